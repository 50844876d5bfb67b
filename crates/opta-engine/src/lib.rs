//! Session and turn orchestration: per-session FIFO queues, the event
//! sequencer and hub, the turn executor, the tool worker pool and the
//! backend watchdog.

pub mod executor;
pub mod hub;
pub mod permission;
pub mod pool;
pub mod registry;
pub mod sequencer;
pub mod sessions;
pub mod tools;
pub mod watchdog;

pub use executor::{ToolRuntime, ToolRuntimeConfig};
pub use hub::{SubscriptionHub, Subscription};
pub use permission::{PermissionBroker, PermissionDecision};
pub use pool::{PoolStats, WorkerPool};
pub use registry::ToolRegistry;
pub use sequencer::EventSequencer;
pub use sessions::{RuntimeStats, SessionManager, SessionManagerConfig, SessionView, SubmitReceipt};
pub use watchdog::{Watchdog, WatchdogAlert, WatchdogConfig, WatchdogStatus};
