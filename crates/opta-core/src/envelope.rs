use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::errors::HostFailure;
use crate::ids::{ClientId, DaemonId, PermissionRequestId, SessionId, ToolCallId, TurnId, WriterId};
use crate::turn::TurnMode;

/// Wire protocol version stamped on every envelope.
pub const PROTOCOL_VERSION: &str = "3";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventName {
    #[serde(rename = "turn.queued")]
    TurnQueued,
    #[serde(rename = "turn.start")]
    TurnStart,
    #[serde(rename = "turn.token")]
    TurnToken,
    #[serde(rename = "turn.thinking")]
    TurnThinking,
    #[serde(rename = "tool.start")]
    ToolStart,
    #[serde(rename = "tool.end")]
    ToolEnd,
    #[serde(rename = "permission.request")]
    PermissionRequest,
    #[serde(rename = "turn.done")]
    TurnDone,
    #[serde(rename = "turn.error")]
    TurnError,
    #[serde(rename = "session.cancelled")]
    SessionCancelled,
}

impl EventName {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TurnQueued => "turn.queued",
            Self::TurnStart => "turn.start",
            Self::TurnToken => "turn.token",
            Self::TurnThinking => "turn.thinking",
            Self::ToolStart => "tool.start",
            Self::ToolEnd => "tool.end",
            Self::PermissionRequest => "permission.request",
            Self::TurnDone => "turn.done",
            Self::TurnError => "turn.error",
            Self::SessionCancelled => "session.cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let all = [
            Self::TurnQueued,
            Self::TurnStart,
            Self::TurnToken,
            Self::TurnThinking,
            Self::ToolStart,
            Self::ToolEnd,
            Self::PermissionRequest,
            Self::TurnDone,
            Self::TurnError,
            Self::SessionCancelled,
        ];
        all.into_iter().find(|e| e.as_str() == s)
    }
}

impl std::fmt::Display for EventName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Versioned, sequenced event record. This is the only shape clients ever
/// see, live or replayed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub v: String,
    pub event: EventName,
    pub daemon_id: DaemonId,
    pub session_id: SessionId,
    pub seq: u64,
    pub ts: DateTime<Utc>,
    pub payload: serde_json::Value,
}

/// Typed session events before sequencing. The sequencer turns one of these
/// into an [`Envelope`] by stamping seq, timestamp and daemon id.
#[derive(Clone, Debug)]
pub enum SessionEvent {
    TurnQueued {
        turn_id: TurnId,
        writer_id: WriterId,
        client_id: ClientId,
        mode: TurnMode,
        queue_depth: usize,
    },
    TurnStart {
        turn_id: TurnId,
        writer_id: WriterId,
    },
    TurnToken {
        turn_id: TurnId,
        text: String,
    },
    TurnThinking {
        turn_id: TurnId,
        text: String,
    },
    ToolStart {
        turn_id: TurnId,
        call_id: ToolCallId,
        tool_name: String,
    },
    ToolEnd {
        turn_id: TurnId,
        call_id: ToolCallId,
        tool_name: String,
        is_error: bool,
        duration_ms: u64,
        preview: String,
    },
    PermissionRequest {
        request_id: PermissionRequestId,
        turn_id: TurnId,
        tool_name: String,
        arguments: serde_json::Value,
    },
    TurnDone {
        turn_id: TurnId,
        writer_id: WriterId,
        tool_call_count: u32,
        message_count: usize,
        duration_ms: u64,
    },
    TurnError {
        turn_id: TurnId,
        writer_id: WriterId,
        code: String,
        message: String,
        attempts: Vec<HostFailure>,
    },
    SessionCancelled {
        turn_ids: Vec<TurnId>,
        writer_id: Option<WriterId>,
        cancelled_active: bool,
        cancelled_queued: usize,
    },
}

impl SessionEvent {
    pub fn name(&self) -> EventName {
        match self {
            Self::TurnQueued { .. } => EventName::TurnQueued,
            Self::TurnStart { .. } => EventName::TurnStart,
            Self::TurnToken { .. } => EventName::TurnToken,
            Self::TurnThinking { .. } => EventName::TurnThinking,
            Self::ToolStart { .. } => EventName::ToolStart,
            Self::ToolEnd { .. } => EventName::ToolEnd,
            Self::PermissionRequest { .. } => EventName::PermissionRequest,
            Self::TurnDone { .. } => EventName::TurnDone,
            Self::TurnError { .. } => EventName::TurnError,
            Self::SessionCancelled { .. } => EventName::SessionCancelled,
        }
    }

    /// Wire payload (camelCase keys).
    pub fn payload(&self) -> serde_json::Value {
        match self {
            Self::TurnQueued {
                turn_id,
                writer_id,
                client_id,
                mode,
                queue_depth,
            } => json!({
                "turnId": turn_id,
                "writerId": writer_id,
                "clientId": client_id,
                "mode": mode,
                "queueDepth": queue_depth,
            }),
            Self::TurnStart { turn_id, writer_id } => json!({
                "turnId": turn_id,
                "writerId": writer_id,
            }),
            Self::TurnToken { turn_id, text } | Self::TurnThinking { turn_id, text } => json!({
                "turnId": turn_id,
                "text": text,
            }),
            Self::ToolStart {
                turn_id,
                call_id,
                tool_name,
            } => json!({
                "turnId": turn_id,
                "callId": call_id,
                "toolName": tool_name,
            }),
            Self::ToolEnd {
                turn_id,
                call_id,
                tool_name,
                is_error,
                duration_ms,
                preview,
            } => json!({
                "turnId": turn_id,
                "callId": call_id,
                "toolName": tool_name,
                "isError": is_error,
                "durationMs": duration_ms,
                "preview": preview,
            }),
            Self::PermissionRequest {
                request_id,
                turn_id,
                tool_name,
                arguments,
            } => json!({
                "requestId": request_id,
                "turnId": turn_id,
                "toolName": tool_name,
                "arguments": arguments,
            }),
            Self::TurnDone {
                turn_id,
                writer_id,
                tool_call_count,
                message_count,
                duration_ms,
            } => json!({
                "turnId": turn_id,
                "writerId": writer_id,
                "toolCallCount": tool_call_count,
                "messageCount": message_count,
                "durationMs": duration_ms,
            }),
            Self::TurnError {
                turn_id,
                writer_id,
                code,
                message,
                attempts,
            } => json!({
                "turnId": turn_id,
                "writerId": writer_id,
                "code": code,
                "message": message,
                "attempts": attempts,
            }),
            Self::SessionCancelled {
                turn_ids,
                writer_id,
                cancelled_active,
                cancelled_queued,
            } => json!({
                "turnIds": turn_ids,
                "writerId": writer_id,
                "cancelledActive": cancelled_active,
                "cancelledQueued": cancelled_queued,
            }),
        }
    }

    /// Stamp into an envelope.
    pub fn into_envelope(self, daemon_id: &DaemonId, session_id: &SessionId, seq: u64) -> Envelope {
        Envelope {
            v: PROTOCOL_VERSION.to_string(),
            event: self.name(),
            daemon_id: daemon_id.clone(),
            session_id: session_id.clone(),
            seq,
            ts: Utc::now(),
            payload: self.payload(),
        }
    }
}
