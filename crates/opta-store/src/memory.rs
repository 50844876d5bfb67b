use std::collections::{BTreeMap, HashMap};

use chrono::Utc;
use parking_lot::Mutex;

use opta_core::envelope::Envelope;
use opta_core::ids::SessionId;
use opta_core::session::{SessionRecord, SessionSnapshot};

use crate::error::StoreError;
use crate::store::SessionStore;

#[derive(Default)]
struct Inner {
    sessions: HashMap<SessionId, SessionRecord>,
    events: HashMap<SessionId, BTreeMap<u64, Envelope>>,
    snapshots: HashMap<SessionId, SessionSnapshot>,
}

/// Process-local store used in ephemeral mode and tests.
#[derive(Default)]
pub struct MemorySessionStore {
    inner: Mutex<Inner>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemorySessionStore {
    fn create_session(&self, record: &SessionRecord) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        if inner.sessions.contains_key(&record.session_id) {
            return Err(StoreError::Conflict(format!(
                "session {} already exists",
                record.session_id
            )));
        }
        let _ = inner
            .sessions
            .insert(record.session_id.clone(), record.clone());
        Ok(())
    }

    fn get_session(&self, session_id: &SessionId) -> Result<Option<SessionRecord>, StoreError> {
        Ok(self.inner.lock().sessions.get(session_id).cloned())
    }

    fn list_sessions(&self) -> Result<Vec<SessionRecord>, StoreError> {
        let mut all: Vec<_> = self.inner.lock().sessions.values().cloned().collect();
        all.sort_by_key(|r| r.created_at);
        Ok(all)
    }

    fn touch_session(&self, session_id: &SessionId) -> Result<(), StoreError> {
        match self.inner.lock().sessions.get_mut(session_id) {
            Some(record) => {
                record.updated_at = Utc::now();
                Ok(())
            }
            None => Err(StoreError::NotFound(format!("session {session_id}"))),
        }
    }

    fn delete_session(&self, session_id: &SessionId) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock();
        let _ = inner.events.remove(session_id);
        let _ = inner.snapshots.remove(session_id);
        Ok(inner.sessions.remove(session_id).is_some())
    }

    fn append_event(&self, envelope: &Envelope) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let log = inner.events.entry(envelope.session_id.clone()).or_default();
        if log.contains_key(&envelope.seq) {
            return Err(StoreError::Conflict(format!(
                "seq {} already recorded for {}",
                envelope.seq, envelope.session_id
            )));
        }
        let _ = log.insert(envelope.seq, envelope.clone());
        Ok(())
    }

    fn events_after(
        &self,
        session_id: &SessionId,
        after_seq: u64,
        limit: Option<usize>,
    ) -> Result<Vec<Envelope>, StoreError> {
        let inner = self.inner.lock();
        let Some(log) = inner.events.get(session_id) else {
            return Ok(Vec::new());
        };
        let iter = log
            .range(after_seq.saturating_add(1)..)
            .map(|(_, env)| env.clone());
        Ok(match limit {
            Some(n) => iter.take(n).collect(),
            None => iter.collect(),
        })
    }

    fn last_seq(&self, session_id: &SessionId) -> Result<u64, StoreError> {
        Ok(self
            .inner
            .lock()
            .events
            .get(session_id)
            .and_then(|log| log.keys().next_back().copied())
            .unwrap_or(0))
    }

    fn save_snapshot(
        &self,
        session_id: &SessionId,
        snapshot: &SessionSnapshot,
    ) -> Result<(), StoreError> {
        let _ = self
            .inner
            .lock()
            .snapshots
            .insert(session_id.clone(), snapshot.clone());
        Ok(())
    }

    fn load_snapshot(
        &self,
        session_id: &SessionId,
    ) -> Result<Option<SessionSnapshot>, StoreError> {
        Ok(self.inner.lock().snapshots.get(session_id).cloned())
    }
}
