//! Control messages clients send over an event WebSocket.
//!
//! Request: `{ type: "turn.submit" | "turn.cancel" | "permission.resolve", id?, ... }`
//! Reply:   `{ type: "ack", id, result }` or `{ type: "error", id, error: { code, message } }`

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use opta_core::errors::DaemonError;
use opta_core::ids::{PermissionRequestId, SessionId};
use opta_core::turn::{CancelFilter, TurnRequest};
use opta_engine::{PermissionDecision, SessionManager};

#[derive(Debug, Deserialize)]
struct ControlHeader {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    id: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResolveBody {
    request_id: PermissionRequestId,
    decision: PermissionDecision,
}

#[derive(Debug, Serialize)]
pub struct ReplyError {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct ControlReply {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub id: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ReplyError>,
}

impl ControlReply {
    pub fn ack(id: Option<Value>, result: Value) -> Self {
        Self {
            kind: "ack",
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Option<Value>, err: &DaemonError) -> Self {
        Self {
            kind: "error",
            id,
            result: None,
            error: Some(ReplyError {
                code: err.code().to_string(),
                message: err.to_string(),
            }),
        }
    }
}

fn body<T: serde::de::DeserializeOwned>(raw: Value) -> Result<T, DaemonError> {
    serde_json::from_value(raw).map_err(|e| DaemonError::Validation(e.to_string()))
}

/// Apply one control message to the connection's session.
pub fn handle_control(sessions: &SessionManager, session_id: &SessionId, raw: &str) -> ControlReply {
    let value: Value = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(e) => return ControlReply::error(None, &DaemonError::Validation(format!("malformed message: {e}"))),
    };
    let header: ControlHeader = match serde_json::from_value(value.clone()) {
        Ok(h) => h,
        Err(e) => return ControlReply::error(None, &DaemonError::Validation(e.to_string())),
    };

    let result = match header.kind.as_str() {
        "turn.submit" => body::<TurnRequest>(value)
            .and_then(|request| sessions.submit_turn(session_id, request))
            .map(|receipt| json!(receipt)),
        "turn.cancel" => body::<CancelFilter>(value)
            .and_then(|filter| sessions.cancel_session_turns(session_id, filter))
            .map(|outcome| json!(outcome)),
        "permission.resolve" => body::<ResolveBody>(value)
            .and_then(|b| sessions.resolve_permission(session_id, &b.request_id, b.decision))
            .map(|()| json!({ "resolved": true })),
        other => Err(DaemonError::Validation(format!("unknown message type: {other}"))),
    };

    match result {
        Ok(result) => ControlReply::ack(header.id, result),
        Err(e) => ControlReply::error(header.id, &e),
    }
}
