use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{ClientId, SessionId, TurnId, WriterId};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnMode {
    #[default]
    Chat,
    Do,
    Plan,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnStatus {
    Queued,
    Active,
    Done,
    Error,
    Cancelled,
}

impl TurnStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error | Self::Cancelled)
    }

    /// Whether moving to `next` is allowed. Terminal states never change.
    pub fn can_transition_to(&self, next: TurnStatus) -> bool {
        match self {
            Self::Queued => matches!(next, Self::Active | Self::Cancelled),
            Self::Active => next.is_terminal(),
            Self::Done | Self::Error | Self::Cancelled => false,
        }
    }
}

/// Body of a turn submission.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnRequest {
    pub client_id: ClientId,
    pub writer_id: WriterId,
    pub content: String,
    #[serde(default)]
    pub mode: TurnMode,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// One unit of work in a session's queue.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Turn {
    pub turn_id: TurnId,
    pub session_id: SessionId,
    pub writer_id: WriterId,
    pub client_id: ClientId,
    pub content: String,
    pub mode: TurnMode,
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub enqueued_at: DateTime<Utc>,
    pub status: TurnStatus,
}

impl Turn {
    pub fn queued(session_id: SessionId, request: TurnRequest) -> Self {
        Self {
            turn_id: TurnId::new(),
            session_id,
            writer_id: request.writer_id,
            client_id: request.client_id,
            content: request.content,
            mode: request.mode,
            metadata: request.metadata,
            enqueued_at: Utc::now(),
            status: TurnStatus::Queued,
        }
    }

    /// Apply a status change, ignoring transitions out of a terminal state.
    /// Returns whether the status actually changed.
    pub fn transition(&mut self, next: TurnStatus) -> bool {
        if self.status.can_transition_to(next) {
            self.status = next;
            true
        } else {
            false
        }
    }
}

/// Which turns a cancellation applies to. An empty filter matches everything.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelFilter {
    #[serde(default)]
    pub turn_id: Option<TurnId>,
    #[serde(default)]
    pub writer_id: Option<WriterId>,
}

impl CancelFilter {
    pub fn by_writer(writer_id: WriterId) -> Self {
        Self {
            turn_id: None,
            writer_id: Some(writer_id),
        }
    }

    pub fn by_turn(turn_id: TurnId) -> Self {
        Self {
            turn_id: Some(turn_id),
            writer_id: None,
        }
    }

    pub fn matches(&self, turn: &Turn) -> bool {
        let turn_ok = self.turn_id.as_ref().map_or(true, |id| *id == turn.turn_id);
        let writer_ok = self.writer_id.as_ref().map_or(true, |w| *w == turn.writer_id);
        turn_ok && writer_ok
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelOutcome {
    pub cancelled_active: bool,
    pub cancelled_queued: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn turn(writer: &str) -> Turn {
        Turn::queued(
            SessionId::new(),
            TurnRequest {
                client_id: ClientId::from_raw("cli"),
                writer_id: WriterId::from_raw(writer),
                content: "hello".into(),
                mode: TurnMode::Chat,
                metadata: serde_json::Map::new(),
            },
        )
    }

    #[test]
    fn terminal_states_are_immutable() {
        let mut t = turn("a");
        assert!(t.transition(TurnStatus::Active));
        assert!(t.transition(TurnStatus::Cancelled));
        assert!(!t.transition(TurnStatus::Done));
        assert_eq!(t.status, TurnStatus::Cancelled);
    }

    #[test]
    fn queued_cannot_jump_to_done() {
        let mut t = turn("a");
        assert!(!t.transition(TurnStatus::Done));
        assert_eq!(t.status, TurnStatus::Queued);
    }

    #[test]
    fn writer_filter_only_matches_that_writer() {
        let filter = CancelFilter::by_writer(WriterId::from_raw("a"));
        assert!(filter.matches(&turn("a")));
        assert!(!filter.matches(&turn("b")));
    }

    #[test]
    fn combined_filter_requires_both() {
        let t = turn("a");
        let filter = CancelFilter {
            turn_id: Some(t.turn_id.clone()),
            writer_id: Some(WriterId::from_raw("b")),
        };
        assert!(!filter.matches(&t));
    }

    #[test]
    fn empty_filter_matches_everything() {
        assert!(CancelFilter::default().matches(&turn("x")));
    }

    #[test]
    fn request_defaults_mode_and_metadata() {
        let req: TurnRequest =
            serde_json::from_str(r#"{"clientId":"c","writerId":"w","content":"hi"}"#).unwrap();
        assert_eq!(req.mode, TurnMode::Chat);
        assert!(req.metadata.is_empty());
    }
}
