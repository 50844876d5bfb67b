//! Per-session event sequencing: stamp, persist, then fan out.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, error};

use opta_core::envelope::{Envelope, SessionEvent};
use opta_core::ids::{DaemonId, SessionId};
use opta_store::{SessionStore, StoreError};

use crate::hub::{Subscription, SubscriptionHub};

/// Owns the ingress counter of every session.
///
/// `emit` holds the session's counter lock across increment, durable append
/// and hub delivery, so the persisted order is the delivered order and no
/// listener sees an envelope that a replaying client could not also read.
/// Counters are seeded lazily from the store's last seq, so numbering keeps
/// going across daemon restarts.
pub struct EventSequencer {
    daemon_id: DaemonId,
    store: Arc<dyn SessionStore>,
    hub: SubscriptionHub,
    counters: DashMap<SessionId, Arc<Mutex<Option<u64>>>>,
}

impl EventSequencer {
    pub fn new(daemon_id: DaemonId, store: Arc<dyn SessionStore>, hub: SubscriptionHub) -> Self {
        Self {
            daemon_id,
            store,
            hub,
            counters: DashMap::new(),
        }
    }

    pub fn daemon_id(&self) -> &DaemonId {
        &self.daemon_id
    }

    pub fn hub(&self) -> &SubscriptionHub {
        &self.hub
    }

    fn counter(&self, session_id: &SessionId) -> Arc<Mutex<Option<u64>>> {
        Arc::clone(
            self.counters
                .entry(session_id.clone())
                .or_insert_with(|| Arc::new(Mutex::new(None)))
                .value(),
        )
    }

    /// Stamp the next seq, append, deliver. A failed append leaves the
    /// counter where it was and delivers nothing.
    pub fn emit(&self, session_id: &SessionId, event: SessionEvent) -> Result<Envelope, StoreError> {
        let counter = self.counter(session_id);
        let mut current = counter.lock();
        let last = match *current {
            Some(seq) => seq,
            None => {
                let seeded = self.store.last_seq(session_id)?;
                *current = Some(seeded);
                seeded
            }
        };

        let envelope = event.into_envelope(&self.daemon_id, session_id, last + 1);
        if let Err(e) = self.store.append_event(&envelope) {
            error!(session_id = %session_id, seq = envelope.seq, event = %envelope.event, error = %e, "event append failed");
            return Err(e);
        }
        *current = Some(envelope.seq);
        debug!(session_id = %session_id, seq = envelope.seq, event = %envelope.event, "event emitted");

        self.hub.publish(&envelope);
        Ok(envelope)
    }

    pub fn get_events_after(
        &self,
        session_id: &SessionId,
        after_seq: u64,
        limit: Option<usize>,
    ) -> Result<Vec<Envelope>, StoreError> {
        self.store.events_after(session_id, after_seq, limit)
    }

    /// Highest seq emitted so far, 0 before the first event.
    pub fn last_seq(&self, session_id: &SessionId) -> Result<u64, StoreError> {
        let counter = self.counter(session_id);
        let current = counter.lock();
        match *current {
            Some(seq) => Ok(seq),
            None => self.store.last_seq(session_id),
        }
    }

    pub fn subscribe<F>(&self, session_id: &SessionId, callback: F) -> Subscription
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        self.hub.subscribe(session_id, callback)
    }

    /// Forget a deleted session's counter and listeners.
    pub fn forget(&self, session_id: &SessionId) {
        self.counters.remove(session_id);
        self.hub.remove_session(session_id);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    use opta_core::envelope::EventName;
    use opta_core::ids::{TurnId, WriterId};
    use opta_core::session::{SessionRecord, SessionSnapshot};
    use opta_store::MemorySessionStore;

    /// Store wrapper whose appends can be switched to fail, either all of
    /// them or only those of one event kind.
    #[derive(Default)]
    pub(crate) struct FlakyStore {
        pub inner: MemorySessionStore,
        pub fail_appends: AtomicBool,
        pub fail_event: parking_lot::Mutex<Option<EventName>>,
    }

    impl SessionStore for FlakyStore {
        fn create_session(&self, record: &SessionRecord) -> Result<(), StoreError> {
            self.inner.create_session(record)
        }
        fn get_session(&self, id: &SessionId) -> Result<Option<SessionRecord>, StoreError> {
            self.inner.get_session(id)
        }
        fn list_sessions(&self) -> Result<Vec<SessionRecord>, StoreError> {
            self.inner.list_sessions()
        }
        fn touch_session(&self, id: &SessionId) -> Result<(), StoreError> {
            self.inner.touch_session(id)
        }
        fn delete_session(&self, id: &SessionId) -> Result<bool, StoreError> {
            self.inner.delete_session(id)
        }
        fn append_event(&self, envelope: &Envelope) -> Result<(), StoreError> {
            if self.fail_appends.load(Ordering::SeqCst)
                || *self.fail_event.lock() == Some(envelope.event)
            {
                return Err(StoreError::Database("disk full".into()));
            }
            self.inner.append_event(envelope)
        }
        fn events_after(
            &self,
            id: &SessionId,
            after_seq: u64,
            limit: Option<usize>,
        ) -> Result<Vec<Envelope>, StoreError> {
            self.inner.events_after(id, after_seq, limit)
        }
        fn last_seq(&self, id: &SessionId) -> Result<u64, StoreError> {
            self.inner.last_seq(id)
        }
        fn save_snapshot(&self, id: &SessionId, snapshot: &SessionSnapshot) -> Result<(), StoreError> {
            self.inner.save_snapshot(id, snapshot)
        }
        fn load_snapshot(&self, id: &SessionId) -> Result<Option<SessionSnapshot>, StoreError> {
            self.inner.load_snapshot(id)
        }
    }

    fn token(n: u32) -> SessionEvent {
        SessionEvent::TurnToken {
            turn_id: TurnId::from_raw("turn_1"),
            text: format!("tok{n}"),
        }
    }

    fn sequencer(store: Arc<dyn SessionStore>) -> EventSequencer {
        EventSequencer::new(DaemonId::from_raw("daemon_t"), store, SubscriptionHub::new())
    }

    fn seqs(envelopes: &[Envelope]) -> Vec<u64> {
        envelopes.iter().map(|e| e.seq).collect()
    }

    #[test]
    fn seq_starts_at_one_and_is_gapless() {
        let seq = sequencer(Arc::new(MemorySessionStore::new()));
        let s = SessionId::from_raw("s");
        for n in 0..5 {
            seq.emit(&s, token(n)).unwrap();
        }
        assert_eq!(seqs(&seq.get_events_after(&s, 0, None).unwrap()), vec![1, 2, 3, 4, 5]);
        assert_eq!(seq.last_seq(&s).unwrap(), 5);
    }

    #[test]
    fn sessions_are_numbered_independently() {
        let seq = sequencer(Arc::new(MemorySessionStore::new()));
        let a = SessionId::from_raw("a");
        let b = SessionId::from_raw("b");
        seq.emit(&a, token(0)).unwrap();
        seq.emit(&a, token(1)).unwrap();
        let first_b = seq.emit(&b, token(0)).unwrap();
        assert_eq!(first_b.seq, 1);
    }

    #[test]
    fn replay_returns_exactly_the_suffix() {
        let seq = sequencer(Arc::new(MemorySessionStore::new()));
        let s = SessionId::from_raw("s");
        for n in 0..6 {
            seq.emit(&s, token(n)).unwrap();
        }
        for after in 0..=6u64 {
            let events = seq.get_events_after(&s, after, None).unwrap();
            let expected: Vec<u64> = (after + 1..=6).collect();
            assert_eq!(seqs(&events), expected);
        }
        assert!(seq.get_events_after(&s, 6, None).unwrap().is_empty());

        let once = seq.get_events_after(&s, 2, None).unwrap();
        let twice = seq.get_events_after(&s, 2, None).unwrap();
        assert_eq!(once, twice);
        assert_eq!(seqs(&seq.get_events_after(&s, 2, Some(2)).unwrap()), vec![3, 4]);
    }

    #[test]
    fn counter_is_seeded_from_the_durable_log() {
        let store: Arc<dyn SessionStore> = Arc::new(MemorySessionStore::new());
        let s = SessionId::from_raw("s");
        {
            let first = sequencer(Arc::clone(&store));
            for n in 0..3 {
                first.emit(&s, token(n)).unwrap();
            }
        }
        let restarted = sequencer(store);
        assert_eq!(restarted.last_seq(&s).unwrap(), 3);
        assert_eq!(restarted.emit(&s, token(9)).unwrap().seq, 4);
    }

    #[test]
    fn subscribers_see_log_order() {
        let seq = sequencer(Arc::new(MemorySessionStore::new()));
        let s = SessionId::from_raw("s");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = seq.subscribe(&s, move |e| sink.lock().push(e.seq));
        for n in 0..4 {
            seq.emit(&s, token(n)).unwrap();
        }
        assert_eq!(*seen.lock(), seqs(&seq.get_events_after(&s, 0, None).unwrap()));
    }

    #[test]
    fn failed_append_neither_advances_nor_delivers() {
        let store = Arc::new(FlakyStore::default());
        let seq = sequencer(store.clone());
        let s = SessionId::from_raw("s");
        let delivered = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&delivered);
        let _sub = seq.subscribe(&s, move |e| sink.lock().push(e.seq));

        seq.emit(&s, token(0)).unwrap();
        store.fail_appends.store(true, Ordering::SeqCst);
        assert!(seq.emit(&s, token(1)).is_err());
        assert_eq!(seq.last_seq(&s).unwrap(), 1);

        store.fail_appends.store(false, Ordering::SeqCst);
        assert_eq!(seq.emit(&s, token(2)).unwrap().seq, 2);
        assert_eq!(*delivered.lock(), vec![1, 2]);
    }

    #[test]
    fn envelopes_carry_daemon_and_session() {
        let seq = sequencer(Arc::new(MemorySessionStore::new()));
        let s = SessionId::from_raw("sess_x");
        let env = seq
            .emit(
                &s,
                SessionEvent::TurnStart {
                    turn_id: TurnId::from_raw("turn_1"),
                    writer_id: WriterId::from_raw("w"),
                },
            )
            .unwrap();
        assert_eq!(env.daemon_id.as_str(), "daemon_t");
        assert_eq!(env.session_id, s);
        assert_eq!(env.v, "3");
    }

    #[test]
    fn concurrent_emitters_never_share_a_seq() {
        let seq = Arc::new(sequencer(Arc::new(MemorySessionStore::new())));
        let s = SessionId::from_raw("s");
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let seq = Arc::clone(&seq);
                let s = s.clone();
                std::thread::spawn(move || {
                    for n in 0..25 {
                        seq.emit(&s, token(n)).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let all = seqs(&seq.get_events_after(&s, 0, None).unwrap());
        assert_eq!(all, (1..=100).collect::<Vec<u64>>());
    }
}
