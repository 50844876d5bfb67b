//! Scripted agent loop for tests and offline runs.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use opta_core::agent::{AgentConfig, AgentError, AgentLoop, AgentOutcome, AgentRunContext};
use opta_core::ids::ToolCallId;
use opta_core::messages::{ChatMessage, ToolCall};
use opta_core::tools::ToolInvocation;

#[derive(Clone, Debug)]
pub enum MockStep {
    Token(String),
    Thinking(String),
    Tool {
        name: String,
        arguments: serde_json::Value,
    },
    Sleep(Duration),
    /// Block until cancelled.
    Hang,
    /// Block forever, ignoring cancellation.
    HangUncooperative,
    Fail(AgentError),
}

impl MockStep {
    pub fn token(text: &str) -> Self {
        Self::Token(text.to_string())
    }
}

/// Agent loop that plays back scripts keyed by the turn content. Content
/// without a script is echoed back as a single token.
#[derive(Default)]
pub struct ScriptedAgentLoop {
    scripts: Mutex<HashMap<String, Vec<MockStep>>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedAgentLoop {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(self, content: &str, steps: Vec<MockStep>) -> Self {
        let _ = self.scripts.lock().insert(content.to_string(), steps);
        self
    }

    /// Contents of every run, in start order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl AgentLoop for ScriptedAgentLoop {
    async fn run(
        &self,
        content: &str,
        _config: &AgentConfig,
        ctx: AgentRunContext,
    ) -> Result<AgentOutcome, AgentError> {
        self.calls.lock().push(content.to_string());
        let steps = self
            .scripts
            .lock()
            .get(content)
            .cloned()
            .unwrap_or_else(|| vec![MockStep::Token(format!("echo: {content}"))]);

        let mut messages = ctx.existing_messages;
        messages.push(ChatMessage::user(content));
        let mut text = String::new();
        let mut tool_call_count = 0;

        for step in steps {
            if ctx.signal.is_cancelled() {
                return Err(AgentError::Cancelled);
            }
            match step {
                MockStep::Token(t) => {
                    ctx.io.token(&t);
                    text.push_str(&t);
                }
                MockStep::Thinking(t) => ctx.io.thinking(&t),
                MockStep::Tool { name, arguments } => {
                    let call_id = ToolCallId::new();
                    let outcome = ctx
                        .io
                        .run_tool(ToolInvocation {
                            call_id: call_id.clone(),
                            name: name.clone(),
                            arguments: arguments.clone(),
                        })
                        .await;
                    tool_call_count += 1;
                    messages.push(ChatMessage::Assistant {
                        content: None,
                        tool_calls: vec![ToolCall {
                            id: call_id.clone(),
                            name,
                            arguments,
                        }],
                    });
                    messages.push(ChatMessage::tool_result(call_id, outcome.content));
                }
                MockStep::Sleep(d) => {
                    tokio::select! {
                        _ = ctx.signal.cancelled() => return Err(AgentError::Cancelled),
                        _ = tokio::time::sleep(d) => {}
                    }
                }
                MockStep::Hang => {
                    ctx.signal.cancelled().await;
                    return Err(AgentError::Cancelled);
                }
                MockStep::HangUncooperative => std::future::pending::<()>().await,
                MockStep::Fail(err) => return Err(err),
            }
        }

        messages.push(ChatMessage::assistant_text(text));
        Ok(AgentOutcome {
            messages,
            tool_call_count,
        })
    }
}
