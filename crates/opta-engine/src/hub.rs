//! In-memory fan-out of sequenced envelopes to live listeners.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;

use opta_core::envelope::Envelope;
use opta_core::ids::SessionId;

type Callback = Arc<dyn Fn(&Envelope) + Send + Sync>;

#[derive(Default)]
struct HubInner {
    subscribers: DashMap<SessionId, Vec<(u64, Callback)>>,
    next_id: AtomicU64,
}

impl HubInner {
    fn remove(&self, session_id: &SessionId, id: u64) {
        let now_empty = match self.subscribers.get_mut(session_id) {
            Some(mut subs) => {
                subs.retain(|(sid, _)| *sid != id);
                subs.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.subscribers
                .remove_if(session_id, |_, subs| subs.is_empty());
        }
    }
}

/// Per-session subscriber lists. Cheap to clone.
#[derive(Clone, Default)]
pub struct SubscriptionHub {
    inner: Arc<HubInner>,
}

impl SubscriptionHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` for a session's live events. The callback runs on
    /// the emitting task and must not block.
    pub fn subscribe<F>(&self, session_id: &SessionId, callback: F) -> Subscription
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .subscribers
            .entry(session_id.clone())
            .or_default()
            .push((id, Arc::new(callback)));
        Subscription {
            hub: Arc::downgrade(&self.inner),
            session_id: session_id.clone(),
            id,
            active: true,
        }
    }

    pub fn publish(&self, envelope: &Envelope) {
        // Snapshot the list so callbacks may (un)subscribe without deadlocking.
        let callbacks: Vec<Callback> = match self.inner.subscribers.get(&envelope.session_id) {
            Some(subs) => subs.iter().map(|(_, cb)| Arc::clone(cb)).collect(),
            None => return,
        };
        for cb in callbacks {
            cb(envelope);
        }
    }

    pub fn subscriber_count(&self, session_id: &SessionId) -> usize {
        self.inner
            .subscribers
            .get(session_id)
            .map_or(0, |subs| subs.len())
    }

    pub fn total_subscribers(&self) -> usize {
        self.inner.subscribers.iter().map(|e| e.value().len()).sum()
    }

    /// Drop every listener of a session.
    pub fn remove_session(&self, session_id: &SessionId) {
        self.inner.subscribers.remove(session_id);
    }
}

/// Handle returned by [`SubscriptionHub::subscribe`]. Dropping it
/// unsubscribes.
pub struct Subscription {
    hub: Weak<HubInner>,
    session_id: SessionId,
    id: u64,
    active: bool,
}

impl Subscription {
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        if let Some(hub) = self.hub.upgrade() {
            hub.remove(&self.session_id, self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}
