use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use tracing::instrument;

use opta_core::envelope::{Envelope, EventName};
use opta_core::ids::{ClientId, DaemonId, SessionId};
use opta_core::session::{SessionRecord, SessionSnapshot};

use crate::database::Database;
use crate::error::StoreError;
use crate::store::SessionStore;

pub struct SqliteSessionStore {
    db: Database,
}

impl SqliteSessionStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Serialization(format!("timestamp {raw:?}: {e}")))
}

fn row_to_session(row: &Row<'_>) -> Result<SessionRecord, StoreError> {
    let created: String = row.get(3)?;
    let updated: String = row.get(4)?;
    Ok(SessionRecord {
        session_id: SessionId::from_raw(row.get::<_, String>(0)?),
        client_id: ClientId::from_raw(row.get::<_, String>(1)?),
        model: row.get(2)?,
        created_at: parse_ts(&created)?,
        updated_at: parse_ts(&updated)?,
    })
}

fn row_to_envelope(row: &Row<'_>) -> Result<Envelope, StoreError> {
    let event: String = row.get(2)?;
    let ts: String = row.get(3)?;
    let payload: String = row.get(5)?;
    Ok(Envelope {
        v: opta_core::PROTOCOL_VERSION.to_string(),
        event: EventName::parse(&event)
            .ok_or_else(|| StoreError::Serialization(format!("unknown event {event:?}")))?,
        daemon_id: DaemonId::from_raw(row.get::<_, String>(4)?),
        session_id: SessionId::from_raw(row.get::<_, String>(0)?),
        seq: row.get::<_, i64>(1)? as u64,
        ts: parse_ts(&ts)?,
        payload: serde_json::from_str(&payload)?,
    })
}

impl SessionStore for SqliteSessionStore {
    #[instrument(skip(self, record), fields(session_id = %record.session_id))]
    fn create_session(&self, record: &SessionRecord) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO sessions (id, client_id, model, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    record.session_id.as_str(),
                    record.client_id.as_str(),
                    record.model,
                    record.created_at.to_rfc3339(),
                    record.updated_at.to_rfc3339(),
                ],
            )
            .map_err(|e| match StoreError::from(e) {
                StoreError::Conflict(_) => {
                    StoreError::Conflict(format!("session {} already exists", record.session_id))
                }
                other => other,
            })?;
            Ok(())
        })
    }

    fn get_session(&self, session_id: &SessionId) -> Result<Option<SessionRecord>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, client_id, model, created_at, updated_at FROM sessions WHERE id = ?1",
            )?;
            let mut rows = stmt.query([session_id.as_str()])?;
            match rows.next()? {
                Some(row) => Ok(Some(row_to_session(row)?)),
                None => Ok(None),
            }
        })
    }

    fn list_sessions(&self) -> Result<Vec<SessionRecord>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, client_id, model, created_at, updated_at FROM sessions
                 ORDER BY created_at ASC",
            )?;
            let mut rows = stmt.query([])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(row_to_session(row)?);
            }
            Ok(out)
        })
    }

    fn touch_session(&self, session_id: &SessionId) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE sessions SET updated_at = ?1 WHERE id = ?2",
                params![Utc::now().to_rfc3339(), session_id.as_str()],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("session {session_id}")));
            }
            Ok(())
        })
    }

    #[instrument(skip(self), fields(session_id = %session_id))]
    fn delete_session(&self, session_id: &SessionId) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM events WHERE session_id = ?1", [session_id.as_str()])?;
            tx.execute(
                "DELETE FROM snapshots WHERE session_id = ?1",
                [session_id.as_str()],
            )?;
            let removed = tx.execute("DELETE FROM sessions WHERE id = ?1", [session_id.as_str()])?;
            tx.commit()?;
            Ok(removed > 0)
        })
    }

    fn append_event(&self, envelope: &Envelope) -> Result<(), StoreError> {
        let payload = serde_json::to_string(&envelope.payload)?;
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO events (session_id, seq, event, ts, daemon_id, payload)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    envelope.session_id.as_str(),
                    envelope.seq as i64,
                    envelope.event.as_str(),
                    envelope.ts.to_rfc3339(),
                    envelope.daemon_id.as_str(),
                    payload,
                ],
            )?;
            Ok(())
        })
    }

    fn events_after(
        &self,
        session_id: &SessionId,
        after_seq: u64,
        limit: Option<usize>,
    ) -> Result<Vec<Envelope>, StoreError> {
        // Stored seqs never exceed i64::MAX.
        let Ok(after_seq) = i64::try_from(after_seq) else {
            return Ok(Vec::new());
        };
        // SQLite treats a negative LIMIT as unbounded.
        let limit = limit.map(|l| l as i64).unwrap_or(-1);
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT session_id, seq, event, ts, daemon_id, payload FROM events
                 WHERE session_id = ?1 AND seq > ?2
                 ORDER BY seq ASC
                 LIMIT ?3",
            )?;
            let mut rows = stmt.query(params![session_id.as_str(), after_seq, limit])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(row_to_envelope(row)?);
            }
            Ok(out)
        })
    }

    fn last_seq(&self, session_id: &SessionId) -> Result<u64, StoreError> {
        self.db.with_conn(|conn| {
            let seq: i64 = conn.query_row(
                "SELECT COALESCE(MAX(seq), 0) FROM events WHERE session_id = ?1",
                [session_id.as_str()],
                |row| row.get(0),
            )?;
            Ok(seq as u64)
        })
    }

    fn save_snapshot(
        &self,
        session_id: &SessionId,
        snapshot: &SessionSnapshot,
    ) -> Result<(), StoreError> {
        let messages = serde_json::to_string(&snapshot.messages)?;
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO snapshots (session_id, taken_at_seq, messages, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(session_id) DO UPDATE SET
                     taken_at_seq = excluded.taken_at_seq,
                     messages = excluded.messages,
                     updated_at = excluded.updated_at",
                params![
                    session_id.as_str(),
                    snapshot.taken_at_seq as i64,
                    messages,
                    Utc::now().to_rfc3339(),
                ],
            )?;
            Ok(())
        })
    }

    fn load_snapshot(
        &self,
        session_id: &SessionId,
    ) -> Result<Option<SessionSnapshot>, StoreError> {
        self.db.with_conn(|conn| {
            let row: Option<(i64, String)> = conn
                .query_row(
                    "SELECT taken_at_seq, messages FROM snapshots WHERE session_id = ?1",
                    [session_id.as_str()],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            match row {
                Some((seq, messages)) => Ok(Some(SessionSnapshot {
                    messages: serde_json::from_str(&messages)?,
                    taken_at_seq: seq as u64,
                })),
                None => Ok(None),
            }
        })
    }
}
