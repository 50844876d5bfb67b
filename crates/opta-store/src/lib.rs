//! Durable state for the daemon: session records, the per-session event log
//! and conversation snapshots, plus the `state.json` discovery file.

pub mod database;
pub mod error;
pub mod memory;
pub mod schema;
pub mod sqlite;
pub mod state;
pub mod store;

pub use database::Database;
pub use error::StoreError;
pub use memory::MemorySessionStore;
pub use sqlite::SqliteSessionStore;
pub use state::DaemonState;
pub use store::SessionStore;
