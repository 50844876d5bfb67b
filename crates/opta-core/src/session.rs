use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{ClientId, SessionId};
use crate::messages::ChatMessage;

/// Persisted identity of a session. Queue state is in-memory only.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub session_id: SessionId,
    pub client_id: ClientId,
    pub model: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionOptions {
    #[serde(default)]
    pub session_id: Option<SessionId>,
    pub client_id: ClientId,
    #[serde(default)]
    pub model: Option<String>,
}

/// Conversation state handed back to the agent loop on the next turn.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub messages: Vec<ChatMessage>,
    pub taken_at_seq: u64,
}
