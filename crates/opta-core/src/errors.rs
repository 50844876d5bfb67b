use std::time::Duration;

use serde::{Deserialize, Serialize};

/// One failed attempt against a single upstream host.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostFailure {
    pub host: String,
    pub reason: String,
}

/// Daemon-level error taxonomy. Every variant maps to a machine-readable
/// code that clients see either as an HTTP error body or inside `turn.error`.
#[derive(Clone, Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("unauthorized: {0}")]
    Auth(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("overloaded: {message}")]
    Overload {
        message: String,
        retry_after: Duration,
    },

    #[error("upstream unavailable: {}", describe_failures(.attempts))]
    UpstreamUnavailable { attempts: Vec<HostFailure> },

    #[error("cancelled")]
    Cancelled,

    #[error("storage error: {0}")]
    Store(String),

    #[error("{0}")]
    Internal(String),
}

impl DaemonError {
    /// Stable wire code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::Auth(_) => "AUTH_ERROR",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Overload { .. } => "OVERLOADED",
            Self::UpstreamUnavailable { .. } => "UPSTREAM_UNAVAILABLE",
            Self::Cancelled => "CANCELLED",
            Self::Store(_) | Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Overload { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

pub fn describe_failures(attempts: &[HostFailure]) -> String {
    if attempts.is_empty() {
        return "no candidate hosts configured".into();
    }
    attempts
        .iter()
        .map(|a| format!("{}: {}", a.host, a.reason))
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(DaemonError::Validation("x".into()).code(), "VALIDATION_ERROR");
        assert_eq!(DaemonError::Auth("x".into()).code(), "AUTH_ERROR");
        assert_eq!(DaemonError::NotFound("x".into()).code(), "NOT_FOUND");
        assert_eq!(DaemonError::Cancelled.code(), "CANCELLED");
        assert_eq!(DaemonError::Store("x".into()).code(), "INTERNAL_ERROR");
    }

    #[test]
    fn overload_carries_retry_after() {
        let err = DaemonError::Overload {
            message: "queue full".into(),
            retry_after: Duration::from_secs(3),
        };
        assert_eq!(err.code(), "OVERLOADED");
        assert_eq!(err.retry_after(), Some(Duration::from_secs(3)));
        assert_eq!(DaemonError::Cancelled.retry_after(), None);
    }

    #[test]
    fn upstream_unavailable_lists_every_host() {
        let err = DaemonError::UpstreamUnavailable {
            attempts: vec![
                HostFailure {
                    host: "mono512.local".into(),
                    reason: "connection refused".into(),
                },
                HostFailure {
                    host: "192.168.1.20".into(),
                    reason: "timeout after 5s".into(),
                },
            ],
        };
        let msg = err.to_string();
        assert!(msg.contains("mono512.local: connection refused"));
        assert!(msg.contains("192.168.1.20: timeout after 5s"));
    }

    #[test]
    fn empty_failure_list_is_described() {
        assert_eq!(describe_failures(&[]), "no candidate hosts configured");
    }
}
