//! HTTP + WebSocket surface of the daemon, and a reconnecting client for the
//! event stream.

pub mod auth;
pub mod client;
pub mod error;
pub mod handlers;
pub mod protocol;
pub mod remote;
pub mod server;

pub use auth::AuthToken;
pub use error::ApiError;
pub use remote::{follow, EventStream, RemoteConfig};
pub use server::{build_router, start, AppState, ServerConfig, ServerHandle, ServerParts};
