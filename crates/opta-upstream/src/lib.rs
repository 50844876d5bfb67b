//! Talking to the inference backend.
//!
//! [`ConnectionManager`] owns the candidate host table and runs every request
//! through failover, cooldown and retry. [`UpstreamAgentLoop`] drives a turn
//! over it with the OpenAI-compatible chat API.

pub mod agent;
pub mod backoff;
pub mod error;
pub mod hosts;
pub mod manager;
pub mod mock;
pub mod openai;

pub use agent::{UpstreamAgentLoop, UpstreamProbe};
pub use backoff::RetryPolicy;
pub use error::{FailureKind, UpstreamError};
pub use hosts::{HostRole, HostState, HostStatus, UpstreamSnapshot};
pub use manager::{ConnectionManager, Endpoint, UpstreamConfig};
pub use mock::{MockStep, ScriptedAgentLoop};
