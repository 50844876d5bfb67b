//! Turn execution: drives one turn through the agent loop and turns its
//! output into session events.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use opta_core::agent::{AgentConfig, AgentError, AgentLoop, AgentOutcome, AgentRunContext, ToolOutcome, TurnIo};
use opta_core::envelope::SessionEvent;
use opta_core::ids::{SessionId, TurnId};
use opta_core::session::SessionSnapshot;
use opta_core::settings::ToolSettings;
use opta_core::tools::{ToolContext, ToolDefinition, ToolError, ToolInvocation};
use opta_core::turn::{Turn, TurnStatus};
use opta_store::SessionStore;

use crate::permission::{PermissionBroker, PermissionDecision};
use crate::pool::{PoolError, WorkerPool};
use crate::registry::ToolRegistry;
use crate::sequencer::EventSequencer;

const PREVIEW_CHARS: usize = 200;

#[derive(Clone, Debug)]
pub struct ToolRuntimeConfig {
    pub workers: usize,
    pub timeout: Duration,
    pub permission_timeout: Duration,
    pub working_directory: PathBuf,
}

impl ToolRuntimeConfig {
    pub fn from_settings(settings: &ToolSettings) -> Self {
        let working_directory = settings
            .working_directory
            .as_ref()
            .map(PathBuf::from)
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."));
        Self {
            workers: settings.workers,
            timeout: Duration::from_millis(settings.timeout_ms),
            permission_timeout: Duration::from_millis(settings.permission_timeout_ms),
            working_directory,
        }
    }
}

/// Everything a turn needs to run tools: the registry, the worker pool and
/// the permission broker.
pub struct ToolRuntime {
    registry: Arc<ToolRegistry>,
    pool: Arc<WorkerPool>,
    broker: Arc<PermissionBroker>,
    timeout: Duration,
    working_directory: PathBuf,
}

impl ToolRuntime {
    pub fn new(registry: ToolRegistry, config: ToolRuntimeConfig) -> Self {
        Self {
            registry: Arc::new(registry),
            pool: Arc::new(WorkerPool::new(config.workers)),
            broker: Arc::new(PermissionBroker::new(config.permission_timeout)),
            timeout: config.timeout,
            working_directory: config.working_directory,
        }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn broker(&self) -> &PermissionBroker {
        &self.broker
    }
}

/// Cancellation handle of the active turn.
///
/// Closing the gate and raising the token happen together under the gate
/// lock, and every event the turn emits passes through the same lock, so
/// nothing from a cancelled turn can land after its cancellation.
#[derive(Clone, Default)]
pub struct TurnHandle {
    token: CancellationToken,
    closed: Arc<Mutex<bool>>,
}

impl TurnHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let mut closed = self.closed.lock();
        *closed = true;
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    fn while_open(&self, f: impl FnOnce()) {
        let closed = self.closed.lock();
        if !*closed {
            f();
        }
    }
}

/// `TurnIo` for a single turn.
struct TurnSink {
    sequencer: Arc<EventSequencer>,
    tools: Arc<ToolRuntime>,
    session_id: SessionId,
    turn_id: TurnId,
    handle: TurnHandle,
}

impl TurnSink {
    fn emit(&self, event: SessionEvent) {
        self.handle.while_open(|| {
            if let Err(e) = self.sequencer.emit(&self.session_id, event) {
                warn!(session_id = %self.session_id, turn_id = %self.turn_id, error = %e, "dropping turn event");
            }
        });
    }

    async fn execute(&self, name: &str, arguments: serde_json::Value) -> ToolOutcome {
        let Some(tool) = self.tools.registry.get(name) else {
            return ToolOutcome::error(format!("unknown tool: {name}"));
        };

        if tool.requires_permission() {
            let ticket = self.tools.broker.register(&self.session_id);
            self.emit(SessionEvent::PermissionRequest {
                request_id: ticket.request_id.clone(),
                turn_id: self.turn_id.clone(),
                tool_name: name.to_string(),
                arguments: arguments.clone(),
            });
            if self.tools.broker.wait(ticket, self.handle.token()).await == PermissionDecision::Deny {
                return ToolOutcome::error(ToolError::PermissionDenied(name.to_string()).to_string());
            }
        }

        let ctx = ToolContext {
            session_id: self.session_id.clone(),
            turn_id: self.turn_id.clone(),
            working_directory: self.tools.working_directory.clone(),
            abort_signal: self.handle.token().child_token(),
        };
        let timeout = self.tools.timeout;
        let job = async move { tokio::time::timeout(timeout, tool.execute(arguments, &ctx)).await };

        match self.tools.pool.run(self.handle.token(), job).await {
            Ok(Ok(Ok(result))) => ToolOutcome {
                content: result.content,
                is_error: result.is_error,
            },
            Ok(Ok(Err(e))) => ToolOutcome::error(e.to_string()),
            Ok(Err(_)) => ToolOutcome::error(ToolError::Timeout(timeout).to_string()),
            Err(PoolError::Cancelled) => ToolOutcome::error(ToolError::Cancelled.to_string()),
            Err(e) => ToolOutcome::error(e.to_string()),
        }
    }
}

#[async_trait]
impl TurnIo for TurnSink {
    fn token(&self, text: &str) {
        self.emit(SessionEvent::TurnToken {
            turn_id: self.turn_id.clone(),
            text: text.to_string(),
        });
    }

    fn thinking(&self, text: &str) {
        self.emit(SessionEvent::TurnThinking {
            turn_id: self.turn_id.clone(),
            text: text.to_string(),
        });
    }

    fn tool_definitions(&self) -> Vec<ToolDefinition> {
        self.tools.registry.definitions()
    }

    async fn run_tool(&self, invocation: ToolInvocation) -> ToolOutcome {
        let ToolInvocation {
            call_id,
            name,
            arguments,
        } = invocation;
        self.emit(SessionEvent::ToolStart {
            turn_id: self.turn_id.clone(),
            call_id: call_id.clone(),
            tool_name: name.clone(),
        });

        let started = Instant::now();
        let outcome = self.execute(&name, arguments).await;

        self.emit(SessionEvent::ToolEnd {
            turn_id: self.turn_id.clone(),
            call_id,
            tool_name: name,
            is_error: outcome.is_error,
            duration_ms: started.elapsed().as_millis() as u64,
            preview: outcome.content.chars().take(PREVIEW_CHARS).collect(),
        });
        outcome
    }
}

pub struct TurnExecutor {
    sequencer: Arc<EventSequencer>,
    store: Arc<dyn SessionStore>,
    agent: Arc<dyn AgentLoop>,
    tools: Arc<ToolRuntime>,
    max_iterations: u32,
    abort_grace: Duration,
}

impl TurnExecutor {
    pub fn new(
        sequencer: Arc<EventSequencer>,
        store: Arc<dyn SessionStore>,
        agent: Arc<dyn AgentLoop>,
        tools: Arc<ToolRuntime>,
        max_iterations: u32,
        abort_grace: Duration,
    ) -> Self {
        Self {
            sequencer,
            store,
            agent,
            tools,
            max_iterations,
            abort_grace,
        }
    }

    /// Run the agent loop for `turn`. Once the handle is cancelled the loop
    /// gets `abort_grace` to wind down before it is dropped.
    #[instrument(skip_all, fields(session_id = %turn.session_id, turn_id = %turn.turn_id))]
    pub async fn run(
        &self,
        turn: &Turn,
        model: &str,
        handle: &TurnHandle,
    ) -> Result<AgentOutcome, AgentError> {
        let existing_messages = self
            .store
            .load_snapshot(&turn.session_id)
            .map_err(|e| AgentError::Internal(format!("failed to load session history: {e}")))?
            .map(|s| s.messages)
            .unwrap_or_default();

        let io = Arc::new(TurnSink {
            sequencer: Arc::clone(&self.sequencer),
            tools: Arc::clone(&self.tools),
            session_id: turn.session_id.clone(),
            turn_id: turn.turn_id.clone(),
            handle: handle.clone(),
        });
        let mut config = AgentConfig::new(model);
        config.max_iterations = self.max_iterations;
        config.mode = turn.mode;
        let ctx = AgentRunContext {
            signal: handle.token().clone(),
            existing_messages,
            io,
        };

        let mut run = self.agent.run(&turn.content, &config, ctx);
        tokio::select! {
            result = &mut run => result,
            _ = handle.token().cancelled() => {
                match tokio::time::timeout(self.abort_grace, &mut run).await {
                    Ok(result) => result,
                    Err(_) => {
                        warn!(grace_ms = self.abort_grace.as_millis() as u64, "agent loop ignored cancellation; dropping it");
                        Err(AgentError::Cancelled)
                    }
                }
            }
        }
    }

    /// Record the result of a finished run. Must be called with the owning
    /// session's lock held so it cannot interleave with a cancellation.
    /// A cancelled turn's result is discarded.
    pub fn finish(
        &self,
        turn: &mut Turn,
        handle: &TurnHandle,
        result: Result<AgentOutcome, AgentError>,
        elapsed: Duration,
    ) {
        if handle.is_cancelled() || turn.status == TurnStatus::Cancelled {
            turn.transition(TurnStatus::Cancelled);
            info!(session_id = %turn.session_id, turn_id = %turn.turn_id, "turn cancelled, output discarded");
            return;
        }

        let result = result.and_then(|outcome| {
            let snapshot = SessionSnapshot {
                taken_at_seq: self.sequencer.last_seq(&turn.session_id).unwrap_or(0),
                messages: outcome.messages.clone(),
            };
            self.store
                .save_snapshot(&turn.session_id, &snapshot)
                .map_err(|e| AgentError::Internal(format!("failed to save session history: {e}")))?;
            Ok(outcome)
        });

        let event = match result {
            Ok(outcome) => {
                turn.transition(TurnStatus::Done);
                info!(
                    session_id = %turn.session_id,
                    turn_id = %turn.turn_id,
                    tool_calls = outcome.tool_call_count,
                    duration_ms = elapsed.as_millis() as u64,
                    "turn done"
                );
                SessionEvent::TurnDone {
                    turn_id: turn.turn_id.clone(),
                    writer_id: turn.writer_id.clone(),
                    tool_call_count: outcome.tool_call_count,
                    message_count: outcome.messages.len(),
                    duration_ms: elapsed.as_millis() as u64,
                }
            }
            Err(err) => {
                turn.transition(TurnStatus::Error);
                warn!(session_id = %turn.session_id, turn_id = %turn.turn_id, code = err.code(), error = %err, "turn failed");
                SessionEvent::TurnError {
                    turn_id: turn.turn_id.clone(),
                    writer_id: turn.writer_id.clone(),
                    code: err.code().to_string(),
                    message: err.to_string(),
                    attempts: err.attempts().to_vec(),
                }
            }
        };

        if let Err(e) = self.sequencer.emit(&turn.session_id, event) {
            error!(session_id = %turn.session_id, turn_id = %turn.turn_id, error = %e, "failed to record turn outcome");
        }
        if let Err(e) = self.store.touch_session(&turn.session_id) {
            warn!(session_id = %turn.session_id, error = %e, "failed to touch session");
        }
    }

    pub fn sequencer(&self) -> &Arc<EventSequencer> {
        &self.sequencer
    }

    pub fn tools(&self) -> &Arc<ToolRuntime> {
        &self.tools
    }
}
