use std::time::Duration;

use opta_core::agent::AgentError;
use opta_core::errors::{describe_failures, HostFailure};

/// How the connection manager reacts to a failed attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureKind {
    /// Host unreachable: cool it down and move on immediately.
    Connection,
    /// Worth retrying on the same host with backoff.
    Transient,
    /// The request itself is at fault; returned as-is, host untouched.
    Application,
}

#[derive(Clone, Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("connection failed: {0}")]
    Connect(String),

    #[error("timeout after {0:?}")]
    Timeout(Duration),

    #[error("server error {status}: {body}")]
    ServerError {
        status: u16,
        body: String,
        retry_after: Option<Duration>,
    },

    #[error("request rejected with {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("stream interrupted: {0}")]
    StreamInterrupted(String),

    /// The stream broke after output had already been delivered, so the
    /// request cannot be replayed.
    #[error("stream aborted mid-response: {0}")]
    StreamAborted(String),

    #[error("invalid response: {0}")]
    Decode(String),

    #[error("all upstream hosts failed: {}", describe_failures(.0))]
    Exhausted(Vec<HostFailure>),
}

impl UpstreamError {
    /// Classify an HTTP status. 429 and the usual gateway statuses are
    /// transient; anything else non-2xx is the caller's problem.
    pub fn from_status(status: u16, body: String, retry_after: Option<Duration>) -> Self {
        match status {
            429 | 500 | 502 | 503 | 504 => Self::ServerError {
                status,
                body,
                retry_after,
            },
            _ => Self::Rejected { status, body },
        }
    }

    pub fn from_reqwest(err: reqwest::Error, timeout: Duration) -> Self {
        if err.is_timeout() {
            Self::Timeout(timeout)
        } else if err.is_body() || err.is_decode() {
            Self::StreamInterrupted(err.to_string())
        } else {
            Self::Connect(err.to_string())
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Connect(_) | Self::Timeout(_) => FailureKind::Connection,
            Self::ServerError { .. } | Self::StreamInterrupted(_) => FailureKind::Transient,
            Self::Rejected { .. } | Self::StreamAborted(_) | Self::Decode(_) | Self::Exhausted(_) => {
                FailureKind::Application
            }
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::ServerError { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

impl From<UpstreamError> for AgentError {
    fn from(err: UpstreamError) -> Self {
        match err {
            UpstreamError::Exhausted(attempts) => AgentError::UpstreamUnavailable { attempts },
            other => AgentError::Upstream(other.to_string()),
        }
    }
}

/// Parse a `Retry-After` header given in seconds.
pub fn parse_retry_after(value: Option<&reqwest::header::HeaderValue>) -> Option<Duration> {
    let secs: u64 = value?.to_str().ok()?.trim().parse().ok()?;
    Some(Duration::from_secs(secs))
}
