use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, instrument};

use opta_core::agent::{AgentConfig, AgentError, AgentLoop, AgentOutcome, AgentRunContext};
use opta_core::health::HealthProbe;
use opta_core::messages::ChatMessage;
use opta_core::tools::ToolInvocation;

use crate::manager::ConnectionManager;
use crate::openai::{ChatRequest, StreamDelta};

/// Agent loop over the OpenAI-compatible chat API: stream a completion, run
/// any requested tools, feed the results back, repeat.
pub struct UpstreamAgentLoop {
    manager: Arc<ConnectionManager>,
}

impl UpstreamAgentLoop {
    pub fn new(manager: Arc<ConnectionManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl AgentLoop for UpstreamAgentLoop {
    #[instrument(skip_all, fields(model = %config.model))]
    async fn run(
        &self,
        content: &str,
        config: &AgentConfig,
        ctx: AgentRunContext,
    ) -> Result<AgentOutcome, AgentError> {
        let AgentRunContext {
            signal,
            existing_messages,
            io,
        } = ctx;

        let mut messages = existing_messages;
        if let Some(prompt) = &config.system_prompt {
            if !matches!(messages.first(), Some(ChatMessage::System { .. })) {
                messages.insert(
                    0,
                    ChatMessage::System {
                        content: prompt.clone(),
                    },
                );
            }
        }
        messages.push(ChatMessage::user(content));

        let tools = io.tool_definitions();
        let mut tool_call_count = 0u32;

        for iteration in 0..config.max_iterations {
            let request = ChatRequest::new(config, &messages, &tools);
            let sink = io.clone();
            let on_delta = move |delta: StreamDelta| match delta {
                StreamDelta::Content(text) => sink.token(&text),
                StreamDelta::Reasoning(text) => sink.thinking(&text),
            };

            let completion = tokio::select! {
                _ = signal.cancelled() => return Err(AgentError::Cancelled),
                result = self.manager.chat_stream(&request, &on_delta) => result?,
            };
            debug!(
                iteration,
                tool_calls = completion.tool_calls.len(),
                "completion finished"
            );

            let calls = completion.tool_calls.clone();
            messages.push(ChatMessage::Assistant {
                content: completion.content,
                tool_calls: completion.tool_calls,
            });
            if calls.is_empty() {
                return Ok(AgentOutcome {
                    messages,
                    tool_call_count,
                });
            }

            for call in calls {
                if signal.is_cancelled() {
                    return Err(AgentError::Cancelled);
                }
                let outcome = io
                    .run_tool(ToolInvocation {
                        call_id: call.id.clone(),
                        name: call.name,
                        arguments: call.arguments,
                    })
                    .await;
                tool_call_count += 1;
                messages.push(ChatMessage::tool_result(call.id, outcome.content));
            }
        }

        Err(AgentError::IterationLimit(config.max_iterations))
    }
}

/// Watchdog probe that checks backend reachability through the connection
/// manager, so a probe also exercises failover.
pub struct UpstreamProbe {
    manager: Arc<ConnectionManager>,
}

impl UpstreamProbe {
    pub fn new(manager: Arc<ConnectionManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl HealthProbe for UpstreamProbe {
    async fn probe(&self) -> Result<(), String> {
        self.manager
            .health()
            .await
            .map(|_| ())
            .map_err(|e| e.to_string())
    }

    fn target(&self) -> String {
        self.manager
            .active_host()
            .unwrap_or_else(|| "upstream".to_string())
    }
}
