//! The agent loop seam.
//!
//! The engine treats the agent loop as an opaque, cancellable unit of work.
//! Everything it needs to report back (streamed text, tool calls) goes through
//! [`TurnIo`], which the executor implements per turn.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::errors::{DaemonError, HostFailure};
use crate::messages::ChatMessage;
use crate::tools::{ToolDefinition, ToolInvocation};
use crate::turn::TurnMode;

#[derive(Clone, Debug)]
pub struct AgentConfig {
    pub model: String,
    pub max_iterations: u32,
    pub mode: TurnMode,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub system_prompt: Option<String>,
}

impl AgentConfig {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            max_iterations: 8,
            mode: TurnMode::Chat,
            temperature: None,
            max_tokens: None,
            system_prompt: None,
        }
    }
}

/// Outcome of a tool call as the model sees it.
#[derive(Clone, Debug, PartialEq)]
pub struct ToolOutcome {
    pub content: String,
    pub is_error: bool,
}

impl ToolOutcome {
    pub fn ok(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
        }
    }
}

/// Per-turn callbacks from the agent loop into the daemon.
#[async_trait]
pub trait TurnIo: Send + Sync {
    fn token(&self, text: &str);
    fn thinking(&self, text: &str);
    fn tool_definitions(&self) -> Vec<ToolDefinition>;
    async fn run_tool(&self, invocation: ToolInvocation) -> ToolOutcome;
}

pub struct AgentRunContext {
    pub signal: CancellationToken,
    pub existing_messages: Vec<ChatMessage>,
    pub io: Arc<dyn TurnIo>,
}

#[derive(Clone, Debug, Default)]
pub struct AgentOutcome {
    /// Full history after the turn, including the new user message.
    pub messages: Vec<ChatMessage>,
    pub tool_call_count: u32,
}

#[derive(Clone, Debug, thiserror::Error)]
pub enum AgentError {
    #[error("upstream unavailable: {}", crate::errors::describe_failures(.attempts))]
    UpstreamUnavailable { attempts: Vec<HostFailure> },

    #[error("upstream rejected request: {0}")]
    Upstream(String),

    #[error("agent loop exceeded {0} iterations")]
    IterationLimit(u32),

    #[error("cancelled")]
    Cancelled,

    #[error("{0}")]
    Internal(String),
}

impl AgentError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::UpstreamUnavailable { .. } => "UPSTREAM_UNAVAILABLE",
            Self::Upstream(_) => "UPSTREAM_ERROR",
            Self::IterationLimit(_) => "ITERATION_LIMIT",
            Self::Cancelled => "CANCELLED",
            Self::Internal(_) => "AGENT_ERROR",
        }
    }

    pub fn attempts(&self) -> &[HostFailure] {
        match self {
            Self::UpstreamUnavailable { attempts } => attempts,
            _ => &[],
        }
    }
}

impl From<AgentError> for DaemonError {
    fn from(err: AgentError) -> Self {
        match err {
            AgentError::UpstreamUnavailable { attempts } => Self::UpstreamUnavailable { attempts },
            AgentError::Cancelled => Self::Cancelled,
            other => Self::Internal(other.to_string()),
        }
    }
}

#[async_trait]
pub trait AgentLoop: Send + Sync {
    async fn run(
        &self,
        content: &str,
        config: &AgentConfig,
        ctx: AgentRunContext,
    ) -> Result<AgentOutcome, AgentError>;
}
