//! Pending tool-permission requests awaiting a client decision.

use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use opta_core::errors::DaemonError;
use opta_core::ids::{PermissionRequestId, SessionId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionDecision {
    Allow,
    Deny,
}

struct Pending {
    session_id: SessionId,
    reply: oneshot::Sender<PermissionDecision>,
}

/// A registered request. Await it with [`PermissionBroker::wait`].
pub struct PermissionTicket {
    pub request_id: PermissionRequestId,
    reply: oneshot::Receiver<PermissionDecision>,
}

pub struct PermissionBroker {
    pending: DashMap<PermissionRequestId, Pending>,
    timeout: Duration,
}

impl PermissionBroker {
    pub fn new(timeout: Duration) -> Self {
        Self {
            pending: DashMap::new(),
            timeout,
        }
    }

    pub fn register(&self, session_id: &SessionId) -> PermissionTicket {
        let request_id = PermissionRequestId::new();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            request_id.clone(),
            Pending {
                session_id: session_id.clone(),
                reply: tx,
            },
        );
        PermissionTicket {
            request_id,
            reply: rx,
        }
    }

    /// Wait for a decision. Timeout and turn cancellation both deny.
    pub async fn wait(&self, ticket: PermissionTicket, cancel: &CancellationToken) -> PermissionDecision {
        let PermissionTicket { request_id, reply } = ticket;
        let decision = tokio::select! {
            _ = cancel.cancelled() => {
                debug!(request_id = %request_id, "permission request abandoned");
                PermissionDecision::Deny
            }
            outcome = tokio::time::timeout(self.timeout, reply) => match outcome {
                Ok(Ok(decision)) => decision,
                Ok(Err(_)) => PermissionDecision::Deny,
                Err(_) => {
                    warn!(request_id = %request_id, timeout_ms = self.timeout.as_millis() as u64, "permission request timed out");
                    PermissionDecision::Deny
                }
            },
        };
        self.pending.remove(&request_id);
        decision
    }

    pub fn resolve(
        &self,
        session_id: &SessionId,
        request_id: &PermissionRequestId,
        decision: PermissionDecision,
    ) -> Result<(), DaemonError> {
        let pending = self
            .pending
            .remove_if(request_id, |_, p| p.session_id == *session_id)
            .map(|(_, p)| p)
            .ok_or_else(|| DaemonError::NotFound(format!("permission request {request_id}")))?;
        // The waiter may have given up in the meantime.
        let _ = pending.reply.send(decision);
        Ok(())
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Deny everything still pending for a session.
    pub fn drop_session(&self, session_id: &SessionId) {
        self.pending.retain(|_, p| p.session_id != *session_id);
    }
}
