//! Session manager: owns every session's FIFO turn queue and its single
//! active-turn slot.
//!
//! Each session sits behind its own mutex. Queue mutations, the active slot,
//! turn status changes and the lifecycle events describing them all happen
//! under that lock, which is always taken before the sequencer's. One driver
//! task per session pops turns in order and runs them; it exits when the
//! queue is empty and is respawned by the next submission.

use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use opta_core::agent::{AgentError, AgentLoop};
use opta_core::envelope::{Envelope, SessionEvent};
use opta_core::errors::DaemonError;
use opta_core::ids::{PermissionRequestId, SessionId, TurnId};
use opta_core::session::{CreateSessionOptions, SessionRecord};
use opta_core::settings::SessionSettings;
use opta_core::turn::{CancelFilter, CancelOutcome, Turn, TurnRequest, TurnStatus};
use opta_store::SessionStore;

use crate::executor::{ToolRuntime, TurnExecutor, TurnHandle};
use crate::hub::Subscription;
use crate::permission::PermissionDecision;
use crate::pool::PoolStats;
use crate::sequencer::EventSequencer;

const OVERLOAD_RETRY_AFTER: Duration = Duration::from_secs(1);

#[derive(Clone, Debug)]
pub struct SessionManagerConfig {
    pub default_model: String,
    pub max_queued_turns: usize,
    pub abort_grace: Duration,
    pub max_agent_iterations: u32,
    pub shutdown_timeout: Duration,
}

impl SessionManagerConfig {
    pub fn from_settings(settings: &SessionSettings) -> Self {
        Self {
            default_model: settings.default_model.clone(),
            max_queued_turns: settings.max_queued_turns_per_session,
            abort_grace: Duration::from_millis(settings.abort_grace_ms),
            max_agent_iterations: settings.max_agent_iterations,
            shutdown_timeout: Duration::from_millis(settings.shutdown_timeout_ms),
        }
    }
}

impl Default for SessionManagerConfig {
    fn default() -> Self {
        Self::from_settings(&SessionSettings::default())
    }
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitReceipt {
    pub turn_id: TurnId,
    pub queue_depth: usize,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
    #[serde(flatten)]
    pub record: SessionRecord,
    pub queued: usize,
    pub active_turn: Option<TurnId>,
    pub last_seq: u64,
    pub subscribers: usize,
}

#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeStats {
    pub sessions: usize,
    pub active_turns: usize,
    pub queued_turns: usize,
    pub subscribers: usize,
    pub pending_permissions: usize,
    pub workers: PoolStats,
}

struct ActiveTurn {
    turn: Turn,
    handle: TurnHandle,
}

struct SessionEntry {
    record: SessionRecord,
    queue: VecDeque<Turn>,
    active: Option<ActiveTurn>,
    running: bool,
}

impl SessionEntry {
    fn new(record: SessionRecord) -> Self {
        Self {
            record,
            queue: VecDeque::new(),
            active: None,
            running: false,
        }
    }
}

struct Inner {
    sessions: DashMap<SessionId, Arc<Mutex<SessionEntry>>>,
    store: Arc<dyn SessionStore>,
    sequencer: Arc<EventSequencer>,
    executor: TurnExecutor,
    config: SessionManagerConfig,
    tasks: TaskTracker,
}

/// Cheap to clone; all clones share the same sessions.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    pub fn new(
        store: Arc<dyn SessionStore>,
        sequencer: Arc<EventSequencer>,
        agent: Arc<dyn AgentLoop>,
        tools: Arc<ToolRuntime>,
        config: SessionManagerConfig,
    ) -> Self {
        let executor = TurnExecutor::new(
            Arc::clone(&sequencer),
            Arc::clone(&store),
            agent,
            tools,
            config.max_agent_iterations,
            config.abort_grace,
        );
        Self {
            inner: Arc::new(Inner {
                sessions: DashMap::new(),
                store,
                sequencer,
                executor,
                config,
                tasks: TaskTracker::new(),
            }),
        }
    }

    pub fn sequencer(&self) -> &Arc<EventSequencer> {
        &self.inner.sequencer
    }

    pub fn tools(&self) -> &Arc<ToolRuntime> {
        self.inner.executor.tools()
    }

    fn entry(&self, session_id: &SessionId) -> Result<Arc<Mutex<SessionEntry>>, DaemonError> {
        self.inner
            .sessions
            .get(session_id)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| DaemonError::NotFound(format!("session {session_id}")))
    }

    pub fn create_session(&self, opts: CreateSessionOptions) -> Result<SessionRecord, DaemonError> {
        if opts.client_id.is_empty() {
            return Err(DaemonError::Validation("clientId is required".into()));
        }
        let session_id = opts.session_id.unwrap_or_else(SessionId::new);
        if session_id.is_empty() {
            return Err(DaemonError::Validation("sessionId must not be empty".into()));
        }
        let now = Utc::now();
        let record = SessionRecord {
            session_id: session_id.clone(),
            client_id: opts.client_id,
            model: opts
                .model
                .filter(|m| !m.trim().is_empty())
                .unwrap_or_else(|| self.inner.config.default_model.clone()),
            created_at: now,
            updated_at: now,
        };

        match self.inner.sessions.entry(session_id.clone()) {
            Entry::Occupied(_) => Err(DaemonError::Validation(format!(
                "session {session_id} already exists"
            ))),
            Entry::Vacant(slot) => {
                self.inner.store.create_session(&record)?;
                slot.insert(Arc::new(Mutex::new(SessionEntry::new(record.clone()))));
                info!(session_id = %session_id, model = %record.model, "session created");
                Ok(record)
            }
        }
    }

    pub fn get_session(&self, session_id: &SessionId) -> Result<SessionView, DaemonError> {
        let entry = self.entry(session_id)?;
        let session = entry.lock();
        Ok(SessionView {
            record: session.record.clone(),
            queued: session.queue.len(),
            active_turn: session.active.as_ref().map(|a| a.turn.turn_id.clone()),
            last_seq: self.inner.sequencer.last_seq(session_id)?,
            subscribers: self.inner.sequencer.hub().subscriber_count(session_id),
        })
    }

    pub fn list_sessions(&self) -> Vec<SessionRecord> {
        let mut records: Vec<SessionRecord> = self
            .inner
            .sessions
            .iter()
            .map(|e| e.value().lock().record.clone())
            .collect();
        records.sort_by_key(|r| r.created_at);
        records
    }

    /// Cancels every turn, then drops the session and its durable log.
    pub fn delete_session(&self, session_id: &SessionId) -> Result<(), DaemonError> {
        let (_, entry) = self
            .inner
            .sessions
            .remove(session_id)
            .ok_or_else(|| DaemonError::NotFound(format!("session {session_id}")))?;
        {
            let mut session = entry.lock();
            self.inner
                .cancel_locked(session_id, &mut session, &CancelFilter::default());
        }
        self.tools().broker().drop_session(session_id);
        self.inner.sequencer.forget(session_id);
        self.inner.store.delete_session(session_id)?;
        info!(session_id = %session_id, "session deleted");
        Ok(())
    }

    /// Enqueue a turn. Emits `turn.queued` before returning and never waits
    /// for the turn to run.
    pub fn submit_turn(
        &self,
        session_id: &SessionId,
        request: TurnRequest,
    ) -> Result<SubmitReceipt, DaemonError> {
        if request.content.trim().is_empty() {
            return Err(DaemonError::Validation("content must not be empty".into()));
        }
        if request.writer_id.is_empty() {
            return Err(DaemonError::Validation("writerId is required".into()));
        }
        if request.client_id.is_empty() {
            return Err(DaemonError::Validation("clientId is required".into()));
        }

        let entry = self.entry(session_id)?;
        let mut session = entry.lock();
        if session.queue.len() >= self.inner.config.max_queued_turns {
            return Err(DaemonError::Overload {
                message: format!(
                    "session {session_id} already has {} queued turns",
                    session.queue.len()
                ),
                retry_after: OVERLOAD_RETRY_AFTER,
            });
        }

        let turn = Turn::queued(session_id.clone(), request);
        let queue_depth = session.queue.len() + 1;
        self.inner.sequencer.emit(
            session_id,
            SessionEvent::TurnQueued {
                turn_id: turn.turn_id.clone(),
                writer_id: turn.writer_id.clone(),
                client_id: turn.client_id.clone(),
                mode: turn.mode,
                queue_depth,
            },
        )?;

        let receipt = SubmitReceipt {
            turn_id: turn.turn_id.clone(),
            queue_depth,
        };
        debug!(session_id = %session_id, turn_id = %turn.turn_id, writer_id = %turn.writer_id, queue_depth, "turn queued");
        session.queue.push_back(turn);

        if !session.running {
            session.running = true;
            let inner = Arc::clone(&self.inner);
            let session_id = session_id.clone();
            let entry = Arc::clone(&entry);
            self.inner.tasks.spawn(drive(inner, session_id, entry));
        }
        Ok(receipt)
    }

    /// Cancel the turns matching `filter`. Turns that do not match are left
    /// alone. A `turnId` that is neither active nor queued is `NotFound`.
    pub fn cancel_session_turns(
        &self,
        session_id: &SessionId,
        filter: CancelFilter,
    ) -> Result<CancelOutcome, DaemonError> {
        let entry = self.entry(session_id)?;
        let mut session = entry.lock();
        if let Some(turn_id) = &filter.turn_id {
            let known = session
                .active
                .as_ref()
                .is_some_and(|a| a.turn.turn_id == *turn_id)
                || session.queue.iter().any(|t| t.turn_id == *turn_id);
            if !known {
                return Err(DaemonError::NotFound(format!("turn {turn_id}")));
            }
        }
        Ok(self.inner.cancel_locked(session_id, &mut session, &filter))
    }

    pub fn events_after(
        &self,
        session_id: &SessionId,
        after_seq: u64,
        limit: Option<usize>,
    ) -> Result<Vec<Envelope>, DaemonError> {
        let _ = self.entry(session_id)?;
        Ok(self
            .inner
            .sequencer
            .get_events_after(session_id, after_seq, limit)?)
    }

    pub fn last_seq(&self, session_id: &SessionId) -> Result<u64, DaemonError> {
        let _ = self.entry(session_id)?;
        Ok(self.inner.sequencer.last_seq(session_id)?)
    }

    pub fn subscribe<F>(&self, session_id: &SessionId, callback: F) -> Result<Subscription, DaemonError>
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        let _ = self.entry(session_id)?;
        Ok(self.inner.sequencer.subscribe(session_id, callback))
    }

    pub fn resolve_permission(
        &self,
        session_id: &SessionId,
        request_id: &PermissionRequestId,
        decision: PermissionDecision,
    ) -> Result<(), DaemonError> {
        let _ = self.entry(session_id)?;
        self.tools().broker().resolve(session_id, request_id, decision)
    }

    pub fn runtime_stats(&self) -> RuntimeStats {
        let entries: Vec<Arc<Mutex<SessionEntry>>> = self
            .inner
            .sessions
            .iter()
            .map(|e| Arc::clone(e.value()))
            .collect();
        let mut stats = RuntimeStats {
            sessions: entries.len(),
            subscribers: self.inner.sequencer.hub().total_subscribers(),
            pending_permissions: self.tools().broker().pending_count(),
            workers: self.tools().pool().stats(),
            ..RuntimeStats::default()
        };
        for entry in entries {
            let session = entry.lock();
            stats.active_turns += usize::from(session.active.is_some());
            stats.queued_turns += session.queue.len();
        }
        stats
    }

    /// Load persisted sessions as idle entries. Returns how many were added.
    pub fn restore(&self) -> Result<usize, DaemonError> {
        let mut restored = 0;
        for record in self.inner.store.list_sessions()? {
            if let Entry::Vacant(slot) = self.inner.sessions.entry(record.session_id.clone()) {
                slot.insert(Arc::new(Mutex::new(SessionEntry::new(record))));
                restored += 1;
            }
        }
        info!(restored, "sessions restored");
        Ok(restored)
    }

    /// Cancel every turn in every session and wait, bounded, for the drivers
    /// to wind down.
    pub async fn shutdown(&self) {
        let entries: Vec<(SessionId, Arc<Mutex<SessionEntry>>)> = self
            .inner
            .sessions
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();
        for (session_id, entry) in entries {
            let mut session = entry.lock();
            self.inner
                .cancel_locked(&session_id, &mut session, &CancelFilter::default());
        }

        self.inner.tasks.close();
        let timeout = self.inner.config.shutdown_timeout;
        if tokio::time::timeout(timeout, self.inner.tasks.wait())
            .await
            .is_err()
        {
            warn!(timeout_ms = timeout.as_millis() as u64, "turn drivers still running at shutdown");
        }
    }
}

impl Inner {
    fn cancel_locked(
        &self,
        session_id: &SessionId,
        session: &mut SessionEntry,
        filter: &CancelFilter,
    ) -> CancelOutcome {
        let mut turn_ids = Vec::new();
        let mut cancelled_active = false;

        if let Some(active) = session.active.as_mut() {
            if filter.matches(&active.turn) && active.turn.transition(TurnStatus::Cancelled) {
                active.handle.cancel();
                cancelled_active = true;
                turn_ids.push(active.turn.turn_id.clone());
            }
        }

        let mut kept = VecDeque::with_capacity(session.queue.len());
        let mut cancelled_queued = 0;
        for mut turn in session.queue.drain(..) {
            if filter.matches(&turn) {
                turn.transition(TurnStatus::Cancelled);
                turn_ids.push(turn.turn_id);
                cancelled_queued += 1;
            } else {
                kept.push_back(turn);
            }
        }
        session.queue = kept;

        if !turn_ids.is_empty() {
            info!(
                session_id = %session_id,
                cancelled_active,
                cancelled_queued,
                writer_id = filter.writer_id.as_ref().map(|w| w.as_str()),
                "turns cancelled"
            );
            let event = SessionEvent::SessionCancelled {
                turn_ids,
                writer_id: filter.writer_id.clone(),
                cancelled_active,
                cancelled_queued,
            };
            if let Err(e) = self.sequencer.emit(session_id, event) {
                warn!(session_id = %session_id, error = %e, "failed to record cancellation");
            }
        }

        CancelOutcome {
            cancelled_active,
            cancelled_queued,
        }
    }
}

/// Per-session driver: run queued turns one at a time until the queue is
/// empty.
async fn drive(inner: Arc<Inner>, session_id: SessionId, entry: Arc<Mutex<SessionEntry>>) {
    loop {
        let (turn, handle, model) = {
            let mut session = entry.lock();
            let Some(mut turn) = session.queue.pop_front() else {
                session.running = false;
                debug!(session_id = %session_id, "session idle");
                return;
            };
            turn.transition(TurnStatus::Active);
            let start = SessionEvent::TurnStart {
                turn_id: turn.turn_id.clone(),
                writer_id: turn.writer_id.clone(),
            };
            if let Err(e) = inner.sequencer.emit(&session_id, start) {
                error!(session_id = %session_id, turn_id = %turn.turn_id, error = %e, "could not start turn; skipping");
                turn.transition(TurnStatus::Error);
                let err = DaemonError::Store(format!("turn could not start: {e}"));
                let failed = SessionEvent::TurnError {
                    turn_id: turn.turn_id.clone(),
                    writer_id: turn.writer_id.clone(),
                    code: err.code().to_string(),
                    message: err.to_string(),
                    attempts: Vec::new(),
                };
                if let Err(e) = inner.sequencer.emit(&session_id, failed) {
                    warn!(session_id = %session_id, turn_id = %turn.turn_id, error = %e, "could not record turn failure");
                }
                continue;
            }
            let handle = TurnHandle::new();
            session.active = Some(ActiveTurn {
                turn: turn.clone(),
                handle: handle.clone(),
            });
            (turn, handle, session.record.model.clone())
        };

        let started = Instant::now();
        let result = AssertUnwindSafe(inner.executor.run(&turn, &model, &handle))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(AgentError::Internal("agent loop panicked".into())));

        {
            let mut session = entry.lock();
            if let Some(mut active) = session.active.take() {
                inner
                    .executor
                    .finish(&mut active.turn, &active.handle, result, started.elapsed());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    use opta_core::envelope::EventName;
    use opta_core::errors::HostFailure;
    use opta_core::ids::{ClientId, DaemonId, WriterId};
    use opta_store::MemorySessionStore;
    use opta_upstream::mock::{MockStep, ScriptedAgentLoop};

    use crate::executor::ToolRuntimeConfig;
    use crate::hub::SubscriptionHub;
    use crate::sequencer::tests::FlakyStore;
    use crate::tools::create_default_registry;

    fn manager_over(
        agent: ScriptedAgentLoop,
        store: Arc<dyn SessionStore>,
        config: SessionManagerConfig,
    ) -> (SessionManager, Arc<ScriptedAgentLoop>) {
        let agent = Arc::new(agent);
        let sequencer = Arc::new(EventSequencer::new(
            DaemonId::from_raw("daemon_t"),
            Arc::clone(&store),
            SubscriptionHub::new(),
        ));
        let tools = Arc::new(ToolRuntime::new(
            create_default_registry(),
            ToolRuntimeConfig {
                workers: 2,
                timeout: Duration::from_secs(5),
                permission_timeout: Duration::from_secs(5),
                working_directory: std::env::temp_dir(),
            },
        ));
        let manager = SessionManager::new(
            store,
            sequencer,
            Arc::clone(&agent) as Arc<dyn AgentLoop>,
            tools,
            config,
        );
        (manager, agent)
    }

    fn manager(agent: ScriptedAgentLoop) -> (SessionManager, Arc<ScriptedAgentLoop>) {
        manager_over(
            agent,
            Arc::new(MemorySessionStore::new()),
            SessionManagerConfig::default(),
        )
    }

    fn session(manager: &SessionManager, id: &str) -> SessionId {
        manager
            .create_session(CreateSessionOptions {
                session_id: Some(SessionId::from_raw(id)),
                client_id: ClientId::from_raw("cli"),
                model: None,
            })
            .unwrap()
            .session_id
    }

    fn request(writer: &str, content: &str) -> TurnRequest {
        TurnRequest {
            client_id: ClientId::from_raw("cli"),
            writer_id: WriterId::from_raw(writer),
            content: content.to_string(),
            mode: Default::default(),
            metadata: Default::default(),
        }
    }

    async fn wait_until(
        manager: &SessionManager,
        session_id: &SessionId,
        done: impl Fn(&[Envelope]) -> bool,
    ) -> Vec<Envelope> {
        for _ in 0..500 {
            let events = manager.events_after(session_id, 0, None).unwrap();
            if done(&events) {
                return events;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    fn count(events: &[Envelope], name: EventName) -> usize {
        events.iter().filter(|e| e.event == name).count()
    }

    fn turn_ids(events: &[Envelope], name: EventName) -> Vec<String> {
        events
            .iter()
            .filter(|e| e.event == name)
            .map(|e| e.payload["turnId"].as_str().unwrap_or_default().to_string())
            .collect()
    }

    #[tokio::test]
    async fn create_session_defaults_model_and_rejects_duplicates() {
        let (m, _) = manager(ScriptedAgentLoop::new());
        let s = session(&m, "sess_1");
        assert_eq!(m.get_session(&s).unwrap().record.model, "default");

        let err = m
            .create_session(CreateSessionOptions {
                session_id: Some(s.clone()),
                client_id: ClientId::from_raw("cli"),
                model: Some("other".into()),
            })
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
        assert_eq!(m.list_sessions().len(), 1);
    }

    #[tokio::test]
    async fn unknown_session_is_not_found() {
        let (m, _) = manager(ScriptedAgentLoop::new());
        let missing = SessionId::from_raw("sess_missing");
        assert_eq!(m.submit_turn(&missing, request("a", "hi")).unwrap_err().code(), "NOT_FOUND");
        assert_eq!(
            m.cancel_session_turns(&missing, CancelFilter::default())
                .unwrap_err()
                .code(),
            "NOT_FOUND"
        );
        assert!(m.events_after(&missing, 0, None).is_err());
    }

    #[tokio::test]
    async fn submit_validates_request() {
        let (m, _) = manager(ScriptedAgentLoop::new());
        let s = session(&m, "sess_v");
        assert_eq!(m.submit_turn(&s, request("a", "  ")).unwrap_err().code(), "VALIDATION_ERROR");
        assert_eq!(m.submit_turn(&s, request("", "hi")).unwrap_err().code(), "VALIDATION_ERROR");
        assert!(m.events_after(&s, 0, None).unwrap().is_empty());
    }

    #[tokio::test]
    async fn turns_start_in_submission_order_regardless_of_writer() {
        let slow = vec![MockStep::Sleep(Duration::from_millis(20)), MockStep::token("ok")];
        let (m, agent) = manager(
            ScriptedAgentLoop::new()
                .on("one", slow.clone())
                .on("two", slow.clone())
                .on("three", slow),
        );
        let s = session(&m, "sess_fifo");

        let ids: Vec<String> = [("a", "one"), ("b", "two"), ("a", "three")]
            .into_iter()
            .map(|(w, c)| m.submit_turn(&s, request(w, c)).unwrap().turn_id.to_string())
            .collect();

        let events = wait_until(&m, &s, |e| count(e, EventName::TurnDone) == 3).await;
        assert_eq!(turn_ids(&events, EventName::TurnStart), ids);
        assert_eq!(agent.calls(), vec!["one", "two", "three"]);

        // A turn never starts while another is active.
        let mut open = 0;
        for e in &events {
            match e.event {
                EventName::TurnStart => {
                    open += 1;
                    assert_eq!(open, 1);
                }
                EventName::TurnDone => open -= 1,
                _ => {}
            }
        }
    }

    #[tokio::test]
    async fn turn_queued_is_emitted_synchronously() {
        let (m, _) = manager(ScriptedAgentLoop::new().on("wait", vec![MockStep::Hang]));
        let s = session(&m, "sess_q");
        let receipt = m.submit_turn(&s, request("w", "wait")).unwrap();
        assert_eq!(receipt.queue_depth, 1);

        let first = &m.events_after(&s, 0, None).unwrap()[0];
        assert_eq!(first.event, EventName::TurnQueued);
        assert_eq!(first.seq, 1);
        assert_eq!(first.payload["writerId"], "w");
        assert_eq!(first.payload["queueDepth"], 1);
        m.shutdown().await;
    }

    #[tokio::test]
    async fn cancelling_writer_a_leaves_writer_b_untouched() {
        let (m, _) = manager(ScriptedAgentLoop::new().on("task from A", vec![MockStep::Hang]));
        let s = session(&m, "sess_ab");

        let a = m.submit_turn(&s, request("A", "task from A")).unwrap().turn_id;
        let b = m.submit_turn(&s, request("B", "task from B")).unwrap().turn_id;
        wait_until(&m, &s, |e| count(e, EventName::TurnStart) == 1).await;

        let outcome = m
            .cancel_session_turns(&s, CancelFilter::by_writer(WriterId::from_raw("A")))
            .unwrap();
        assert_eq!(
            outcome,
            CancelOutcome {
                cancelled_active: true,
                cancelled_queued: 0
            }
        );

        let events = wait_until(&m, &s, |e| count(e, EventName::TurnDone) == 1).await;
        assert_eq!(
            turn_ids(&events, EventName::TurnStart),
            vec![a.to_string(), b.to_string()]
        );
        assert_eq!(turn_ids(&events, EventName::TurnDone), vec![b.to_string()]);
        assert_eq!(
            turn_ids(&events, EventName::TurnQueued),
            vec![a.to_string(), b.to_string()]
        );

        let cancelled = events
            .iter()
            .find(|e| e.event == EventName::SessionCancelled)
            .unwrap();
        assert_eq!(cancelled.payload["turnIds"], serde_json::json!([a.to_string()]));
        assert_eq!(cancelled.payload["writerId"], "A");
        assert_eq!(count(&events, EventName::TurnError), 0);
    }

    #[tokio::test]
    async fn writer_cancel_removes_only_that_writers_queued_turns() {
        let (m, _) = manager(ScriptedAgentLoop::new().on("blocker", vec![MockStep::Hang]));
        let s = session(&m, "sess_iso");

        m.submit_turn(&s, request("b", "blocker")).unwrap();
        wait_until(&m, &s, |e| count(e, EventName::TurnStart) == 1).await;
        m.submit_turn(&s, request("a", "a1")).unwrap();
        let b2 = m.submit_turn(&s, request("b", "b2")).unwrap().turn_id;
        m.submit_turn(&s, request("a", "a2")).unwrap();

        let outcome = m
            .cancel_session_turns(&s, CancelFilter::by_writer(WriterId::from_raw("a")))
            .unwrap();
        assert!(!outcome.cancelled_active);
        assert_eq!(outcome.cancelled_queued, 2);

        let view = m.get_session(&s).unwrap();
        assert_eq!(view.queued, 1);
        assert!(view.active_turn.is_some());

        // Cancel the blocker by id; b2 then runs to completion.
        let blocker = view.active_turn.unwrap();
        let outcome = m.cancel_session_turns(&s, CancelFilter::by_turn(blocker)).unwrap();
        assert!(outcome.cancelled_active);
        let events = wait_until(&m, &s, |e| count(e, EventName::TurnDone) == 1).await;
        assert_eq!(turn_ids(&events, EventName::TurnDone), vec![b2.to_string()]);
    }

    #[tokio::test]
    async fn cancel_filters_edge_cases() {
        let (m, _) = manager(ScriptedAgentLoop::new().on("wait", vec![MockStep::Hang]));
        let s = session(&m, "sess_edge");

        let err = m
            .cancel_session_turns(&s, CancelFilter::by_turn(TurnId::from_raw("turn_nope")))
            .unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");

        // Nothing to cancel: no event.
        let outcome = m.cancel_session_turns(&s, CancelFilter::default()).unwrap();
        assert_eq!(outcome, CancelOutcome::default());
        assert!(m.events_after(&s, 0, None).unwrap().is_empty());

        // Both fields given and disagreeing: nothing matches.
        let t = m.submit_turn(&s, request("w", "wait")).unwrap().turn_id;
        wait_until(&m, &s, |e| count(e, EventName::TurnStart) == 1).await;
        let outcome = m
            .cancel_session_turns(
                &s,
                CancelFilter {
                    turn_id: Some(t.clone()),
                    writer_id: Some(WriterId::from_raw("other")),
                },
            )
            .unwrap();
        assert_eq!(outcome, CancelOutcome::default());

        // Empty filter takes everything.
        let outcome = m.cancel_session_turns(&s, CancelFilter::default()).unwrap();
        assert!(outcome.cancelled_active);
    }

    #[tokio::test]
    async fn failed_turn_does_not_stop_the_queue() {
        let failure = AgentError::UpstreamUnavailable {
            attempts: vec![
                HostFailure {
                    host: "primary".into(),
                    reason: "connection refused".into(),
                },
                HostFailure {
                    host: "backup".into(),
                    reason: "timed out".into(),
                },
            ],
        };
        let (m, _) = manager(ScriptedAgentLoop::new().on("bad", vec![MockStep::Fail(failure)]));
        let s = session(&m, "sess_err");

        m.submit_turn(&s, request("w", "bad")).unwrap();
        m.submit_turn(&s, request("w", "good")).unwrap();
        let events = wait_until(&m, &s, |e| count(e, EventName::TurnDone) == 1).await;

        let err = events.iter().find(|e| e.event == EventName::TurnError).unwrap();
        assert_eq!(err.payload["code"], "UPSTREAM_UNAVAILABLE");
        assert_eq!(err.payload["attempts"][1]["host"], "backup");
        let done_idx = events.iter().position(|e| e.event == EventName::TurnDone).unwrap();
        let err_idx = events.iter().position(|e| e.event == EventName::TurnError).unwrap();
        assert!(err_idx < done_idx);
    }

    #[tokio::test]
    async fn full_queue_is_overloaded() {
        let config = SessionManagerConfig {
            max_queued_turns: 1,
            ..SessionManagerConfig::default()
        };
        let (m, _) = manager_over(
            ScriptedAgentLoop::new().on("wait", vec![MockStep::Hang]),
            Arc::new(MemorySessionStore::new()),
            config,
        );
        let s = session(&m, "sess_full");

        m.submit_turn(&s, request("w", "wait")).unwrap();
        wait_until(&m, &s, |e| count(e, EventName::TurnStart) == 1).await;
        m.submit_turn(&s, request("w", "queued")).unwrap();

        let err = m.submit_turn(&s, request("w", "one too many")).unwrap_err();
        assert_eq!(err.code(), "OVERLOADED");
        assert_eq!(err.retry_after(), Some(Duration::from_secs(1)));
        m.shutdown().await;
    }

    #[tokio::test]
    async fn history_accumulates_across_turns() {
        let store: Arc<dyn SessionStore> = Arc::new(MemorySessionStore::new());
        let (m, _) = manager_over(
            ScriptedAgentLoop::new(),
            Arc::clone(&store),
            SessionManagerConfig::default(),
        );
        let s = session(&m, "sess_hist");

        m.submit_turn(&s, request("w", "first")).unwrap();
        m.submit_turn(&s, request("w", "second")).unwrap();
        let events = wait_until(&m, &s, |e| count(e, EventName::TurnDone) == 2).await;

        let last_done = events.iter().rev().find(|e| e.event == EventName::TurnDone).unwrap();
        assert_eq!(last_done.payload["messageCount"], 4);
        let snapshot = store.load_snapshot(&s).unwrap().unwrap();
        assert_eq!(snapshot.messages.len(), 4);
        assert_eq!(
            turn_ids(&events, EventName::TurnToken).len(),
            2,
            "one echo token per turn"
        );
    }

    #[tokio::test]
    async fn uncooperative_agent_is_abandoned_after_grace() {
        let config = SessionManagerConfig {
            abort_grace: Duration::from_millis(50),
            ..SessionManagerConfig::default()
        };
        let (m, _) = manager_over(
            ScriptedAgentLoop::new().on("stuck", vec![MockStep::HangUncooperative]),
            Arc::new(MemorySessionStore::new()),
            config,
        );
        let s = session(&m, "sess_stuck");

        m.submit_turn(&s, request("w", "stuck")).unwrap();
        m.submit_turn(&s, request("w", "next")).unwrap();
        wait_until(&m, &s, |e| count(e, EventName::TurnStart) == 1).await;

        let stuck = m.get_session(&s).unwrap().active_turn.unwrap();
        m.cancel_session_turns(&s, CancelFilter::by_turn(stuck)).unwrap();
        let events = wait_until(&m, &s, |e| count(e, EventName::TurnDone) == 1).await;
        assert_eq!(count(&events, EventName::TurnStart), 2);
    }

    #[tokio::test]
    async fn failed_append_rejects_submission_without_enqueueing() {
        let store = Arc::new(FlakyStore::default());
        let (m, _) = manager_over(
            ScriptedAgentLoop::new(),
            store.clone(),
            SessionManagerConfig::default(),
        );
        let s = session(&m, "sess_flaky");

        store.fail_appends.store(true, Ordering::SeqCst);
        let err = m.submit_turn(&s, request("w", "hello")).unwrap_err();
        assert_eq!(err.code(), "INTERNAL_ERROR");
        assert_eq!(m.get_session(&s).unwrap().queued, 0);
        assert_eq!(m.last_seq(&s).unwrap(), 0);

        store.fail_appends.store(false, Ordering::SeqCst);
        m.submit_turn(&s, request("w", "hello")).unwrap();
        let events = wait_until(&m, &s, |e| count(e, EventName::TurnDone) == 1).await;
        let seqs: Vec<u64> = events.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, (1..=seqs.len() as u64).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn turn_that_cannot_start_still_ends_with_error() {
        let store = Arc::new(FlakyStore::default());
        let (m, _) = manager_over(
            ScriptedAgentLoop::new(),
            store.clone(),
            SessionManagerConfig::default(),
        );
        let s = session(&m, "sess_nostart");

        *store.fail_event.lock() = Some(EventName::TurnStart);
        let first = m.submit_turn(&s, request("w", "hello")).unwrap().turn_id;
        let events = wait_until(&m, &s, |e| count(e, EventName::TurnError) == 1).await;
        assert_eq!(count(&events, EventName::TurnStart), 0);
        assert_eq!(turn_ids(&events, EventName::TurnError), vec![first.to_string()]);
        let failed = events.iter().find(|e| e.event == EventName::TurnError).unwrap();
        assert_eq!(failed.payload["code"], "INTERNAL_ERROR");

        *store.fail_event.lock() = None;
        m.submit_turn(&s, request("w", "again")).unwrap();
        wait_until(&m, &s, |e| count(e, EventName::TurnDone) == 1).await;
        assert_eq!(m.get_session(&s).unwrap().queued, 0);
    }

    #[tokio::test]
    async fn runtime_stats_reflect_queues() {
        let (m, _) = manager(ScriptedAgentLoop::new().on("wait", vec![MockStep::Hang]));
        let s = session(&m, "sess_stats");
        let _other = session(&m, "sess_other");
        let _sub = m.subscribe(&s, |_| {}).unwrap();

        m.submit_turn(&s, request("w", "wait")).unwrap();
        wait_until(&m, &s, |e| count(e, EventName::TurnStart) == 1).await;
        m.submit_turn(&s, request("w", "later")).unwrap();

        let stats = m.runtime_stats();
        assert_eq!(stats.sessions, 2);
        assert_eq!(stats.active_turns, 1);
        assert_eq!(stats.queued_turns, 1);
        assert_eq!(stats.subscribers, 1);
        assert_eq!(stats.workers.workers, 2);
        // Reading stats has no side effects.
        assert_eq!(m.runtime_stats().queued_turns, 1);
        m.shutdown().await;
    }

    #[tokio::test]
    async fn delete_session_cancels_and_forgets() {
        let store: Arc<dyn SessionStore> = Arc::new(MemorySessionStore::new());
        let (m, _) = manager_over(
            ScriptedAgentLoop::new().on("wait", vec![MockStep::Hang]),
            Arc::clone(&store),
            SessionManagerConfig::default(),
        );
        let s = session(&m, "sess_del");
        m.submit_turn(&s, request("w", "wait")).unwrap();
        wait_until(&m, &s, |e| count(e, EventName::TurnStart) == 1).await;

        m.delete_session(&s).unwrap();
        assert_eq!(m.get_session(&s).unwrap_err().code(), "NOT_FOUND");
        assert!(store.get_session(&s).unwrap().is_none());
        assert_eq!(store.last_seq(&s).unwrap(), 0);
        assert_eq!(m.delete_session(&s).unwrap_err().code(), "NOT_FOUND");
    }

    #[tokio::test]
    async fn restore_resumes_numbering_after_restart() {
        let store: Arc<dyn SessionStore> = Arc::new(MemorySessionStore::new());
        let s = {
            let (first, _) = manager_over(
                ScriptedAgentLoop::new(),
                Arc::clone(&store),
                SessionManagerConfig::default(),
            );
            let s = session(&first, "sess_restore");
            first.submit_turn(&s, request("w", "hi")).unwrap();
            wait_until(&first, &s, |e| count(e, EventName::TurnDone) == 1).await;
            first.shutdown().await;
            s
        };
        let before = store.last_seq(&s).unwrap();

        let (second, _) = manager_over(
            ScriptedAgentLoop::new(),
            Arc::clone(&store),
            SessionManagerConfig::default(),
        );
        assert_eq!(second.restore().unwrap(), 1);
        assert_eq!(second.get_session(&s).unwrap().last_seq, before);

        second.submit_turn(&s, request("w", "again")).unwrap();
        let events = wait_until(&second, &s, |e| count(e, EventName::TurnDone) == 2).await;
        let seqs: Vec<u64> = events.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, (1..=seqs.len() as u64).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn shutdown_cancels_everything() {
        let (m, _) = manager(ScriptedAgentLoop::new().on("wait", vec![MockStep::Hang]));
        let s = session(&m, "sess_down");
        m.submit_turn(&s, request("w", "wait")).unwrap();
        m.submit_turn(&s, request("w", "queued")).unwrap();
        wait_until(&m, &s, |e| count(e, EventName::TurnStart) == 1).await;

        m.shutdown().await;
        let events = m.events_after(&s, 0, None).unwrap();
        let cancelled = events
            .iter()
            .find(|e| e.event == EventName::SessionCancelled)
            .unwrap();
        assert_eq!(cancelled.payload["cancelledActive"], true);
        assert_eq!(cancelled.payload["cancelledQueued"], 1);
        assert_eq!(count(&events, EventName::TurnDone), 0);
        assert_eq!(m.runtime_stats().active_turns, 0);
    }

    #[tokio::test]
    async fn live_subscribers_match_replay() {
        let (m, _) = manager(ScriptedAgentLoop::new());
        let s = session(&m, "sess_live");
        let live = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&live);
        let _sub = m.subscribe(&s, move |e| sink.lock().push(e.clone())).unwrap();

        m.submit_turn(&s, request("w", "hello")).unwrap();
        let replay = wait_until(&m, &s, |e| count(e, EventName::TurnDone) == 1).await;
        assert_eq!(*live.lock(), replay);
    }
}
