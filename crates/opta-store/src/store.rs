use opta_core::envelope::Envelope;
use opta_core::ids::SessionId;
use opta_core::session::{SessionRecord, SessionSnapshot};

use crate::error::StoreError;

/// Durable backing for sessions. Implementations are synchronous; callers
/// hold them behind an `Arc<dyn SessionStore>`.
pub trait SessionStore: Send + Sync {
    /// Fails with `Conflict` if the id is taken.
    fn create_session(&self, record: &SessionRecord) -> Result<(), StoreError>;
    fn get_session(&self, session_id: &SessionId) -> Result<Option<SessionRecord>, StoreError>;
    fn list_sessions(&self) -> Result<Vec<SessionRecord>, StoreError>;
    fn touch_session(&self, session_id: &SessionId) -> Result<(), StoreError>;
    /// Removes the record, its event log and snapshot. Returns whether a
    /// record existed.
    fn delete_session(&self, session_id: &SessionId) -> Result<bool, StoreError>;

    /// Fails with `Conflict` if `(session_id, seq)` already exists.
    fn append_event(&self, envelope: &Envelope) -> Result<(), StoreError>;
    /// Envelopes with `seq > after_seq`, ascending.
    fn events_after(
        &self,
        session_id: &SessionId,
        after_seq: u64,
        limit: Option<usize>,
    ) -> Result<Vec<Envelope>, StoreError>;
    /// Highest persisted seq, 0 for an empty log.
    fn last_seq(&self, session_id: &SessionId) -> Result<u64, StoreError>;

    fn save_snapshot(
        &self,
        session_id: &SessionId,
        snapshot: &SessionSnapshot,
    ) -> Result<(), StoreError>;
    fn load_snapshot(&self, session_id: &SessionId)
        -> Result<Option<SessionSnapshot>, StoreError>;
}
