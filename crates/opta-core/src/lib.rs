//! Shared types for the Opta daemon: identifiers, the event envelope, turns,
//! the error taxonomy, settings and the seams (agent loop, tools, health
//! probes) the engine is written against.

#![deny(unsafe_code)]

pub mod agent;
pub mod envelope;
pub mod errors;
pub mod health;
pub mod ids;
pub mod messages;
pub mod session;
pub mod settings;
pub mod tools;
pub mod turn;

pub use envelope::{Envelope, EventName, SessionEvent, PROTOCOL_VERSION};
pub use errors::{DaemonError, HostFailure};
pub use ids::{ClientId, DaemonId, PermissionRequestId, SessionId, ToolCallId, TurnId, WriterId};
