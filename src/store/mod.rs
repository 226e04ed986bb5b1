// src/store/mod.rs
//! Durable event store backing the per-event state machine.
//!
//! Every cross-chain observation lands here as a row keyed by `event_id` and
//! walks a fixed status graph until it reaches a terminal state. The store is
//! the single source of truth across restarts; in-memory session state is
//! derivative and can be rebuilt from these rows.

use crate::tss::party::Participant;
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("event {0} not found")]
    NotFound(String),
    #[error("event {0} already exists")]
    Duplicate(String),
    #[error("invalid status transition {from} -> {to} for event {event_id}")]
    InvalidTransition {
        event_id: String,
        from: EventStatus,
        to: EventStatus,
    },
    #[error("expiry block height {expiry} must be greater than block height {block}")]
    InvalidExpiry { block: u64, expiry: u64 },
    #[error("legacy event schema detected (error_msg column); migrate the database before starting")]
    LegacySchema,
    #[error("invalid {what} value in row: {value}")]
    Corrupt { what: &'static str, value: String },
    #[error(transparent)]
    Sql(#[from] rusqlite::Error),
    #[error("event payload: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Kind of protocol work an event demands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    Keygen,
    Keyrefresh,
    QuorumChange,
    Sign,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Keygen => "KEYGEN",
            EventType::Keyrefresh => "KEYREFRESH",
            EventType::QuorumChange => "QUORUM_CHANGE",
            EventType::Sign => "SIGN",
        }
    }

    fn from_str(s: &str) -> Option<Self> {
        match s {
            "KEYGEN" => Some(EventType::Keygen),
            "KEYREFRESH" => Some(EventType::Keyrefresh),
            "QUORUM_CHANGE" => Some(EventType::QuorumChange),
            "SIGN" => Some(EventType::Sign),
            _ => None,
        }
    }

    /// Key events drive the share store; sign events drive a signature.
    pub fn is_key_event(&self) -> bool {
        !matches!(self, EventType::Sign)
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event lifecycle status. Transitions are validated on every update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventStatus {
    Confirmed,
    InProgress,
    Signed,
    Broadcasted,
    Completed,
    Failed,
    Reverted,
    Expired,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Confirmed => "CONFIRMED",
            EventStatus::InProgress => "IN_PROGRESS",
            EventStatus::Signed => "SIGNED",
            EventStatus::Broadcasted => "BROADCASTED",
            EventStatus::Completed => "COMPLETED",
            EventStatus::Failed => "FAILED",
            EventStatus::Reverted => "REVERTED",
            EventStatus::Expired => "EXPIRED",
        }
    }

    fn from_str(s: &str) -> Option<Self> {
        match s {
            "CONFIRMED" => Some(EventStatus::Confirmed),
            "IN_PROGRESS" => Some(EventStatus::InProgress),
            "SIGNED" => Some(EventStatus::Signed),
            "BROADCASTED" => Some(EventStatus::Broadcasted),
            "COMPLETED" => Some(EventStatus::Completed),
            "FAILED" => Some(EventStatus::Failed),
            "REVERTED" => Some(EventStatus::Reverted),
            "EXPIRED" => Some(EventStatus::Expired),
            _ => None,
        }
    }

    /// Terminal rows are never re-activated.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EventStatus::Completed | EventStatus::Reverted | EventStatus::Expired
        )
    }

    /// Whether `next` is a legal successor of `self` in the status graph.
    /// Sign events walk IN_PROGRESS -> SIGNED -> BROADCASTED -> COMPLETED;
    /// key ceremonies have no destination broadcast and complete directly
    /// from IN_PROGRESS once the outcome vote lands.
    pub fn can_transition_to(&self, next: EventStatus) -> bool {
        use EventStatus::*;
        match self {
            Confirmed => matches!(next, InProgress | Expired | Reverted),
            InProgress => matches!(next, Signed | Failed | Confirmed | Completed),
            Signed => matches!(next, Broadcasted | Failed),
            Broadcasted => matches!(next, Completed | Failed | Reverted),
            Failed => matches!(next, Reverted),
            Completed | Reverted | Expired => false,
        }
    }
}

impl std::fmt::Display for EventStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One observed cross-chain event.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub event_id: String,
    pub event_type: EventType,
    /// Home-chain height at which the event was observed.
    pub block_height: u64,
    pub expiry_block_height: u64,
    /// Event-type-specific payload, opaque to the store.
    pub event_data: Vec<u8>,
    /// CAIP `"{chain-id}:{raw-hash}"`; empty until the destination broadcast.
    pub broadcasted_tx_hash: String,
    pub status: EventStatus,
    /// Insertion time, unix milliseconds.
    pub created_at: i64,
    pub updated_at: i64,
}

impl Event {
    pub fn new(
        event_id: impl Into<String>,
        event_type: EventType,
        block_height: u64,
        expiry_block_height: u64,
        event_data: Vec<u8>,
    ) -> Self {
        let now = Utc::now().timestamp_millis();
        Self {
            event_id: event_id.into(),
            event_type,
            block_height,
            expiry_block_height,
            event_data,
            broadcasted_tx_hash: String::new(),
            status: EventStatus::Confirmed,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn sign_data(&self) -> Result<SignEventData, StoreError> {
        Ok(serde_json::from_slice(&self.event_data)?)
    }

    pub fn key_data(&self) -> Result<KeyEventData, StoreError> {
        Ok(serde_json::from_slice(&self.event_data)?)
    }
}

/// Payload carried by SIGN events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SignEventData {
    pub key_id: String,
    pub tx_id: String,
    pub utx_id: String,
    /// Hash of the destination-chain transaction to sign, hex.
    pub message_hash: String,
    /// Destination chain in CAIP form (e.g. `eip155:11155111`).
    pub destination_chain_id: String,
    /// Optional chain derivation path for the share.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub derivation_path: Option<String>,
    pub threshold: u32,
    pub participants: Vec<Participant>,
}

impl SignEventData {
    pub fn encode(&self) -> Result<Vec<u8>, StoreError> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Payload carried by KEYGEN / KEYREFRESH / QUORUM_CHANGE events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KeyEventData {
    /// Id the new key material is stored under; a refresh rotates to a fresh
    /// id because shares are write-once.
    pub key_id: String,
    /// Home-chain process id this key ceremony belongs to.
    pub process_id: String,
    pub threshold: u32,
    pub participants: Vec<Participant>,
    /// For refresh and quorum-change ceremonies: the key whose share feeds
    /// the protocol.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_key_id: Option<String>,
}

impl KeyEventData {
    pub fn encode(&self) -> Result<Vec<u8>, StoreError> {
        Ok(serde_json::to_vec(self)?)
    }
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS events (
    event_id            TEXT PRIMARY KEY,
    event_type          TEXT NOT NULL,
    block_height        INTEGER NOT NULL,
    expiry_block_height INTEGER NOT NULL,
    event_data          BLOB NOT NULL,
    broadcasted_tx_hash TEXT NOT NULL DEFAULT '',
    status              TEXT NOT NULL,
    created_at          INTEGER NOT NULL,
    updated_at          INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_events_status ON events (status, block_height);
CREATE INDEX IF NOT EXISTS idx_events_expiry ON events (expiry_block_height);
";

const SELECT_COLS: &str =
    "event_id, event_type, block_height, expiry_block_height, event_data, \
     broadcasted_tx_hash, status, created_at, updated_at";

/// SQLite-backed event store. All operations are single-row and linearised by
/// the connection mutex; readers never observe a half-written transition.
pub struct EventStore {
    conn: Mutex<Connection>,
}

impl EventStore {
    /// Open (or create) the event database at `path`.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// In-memory store, used by tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        // WAL keeps concurrent readers cheap; the pragma answers with the
        // resulting mode, so it has to go through query_row.
        let _mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        Self::reject_legacy_schema(&conn)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    // The pre-`broadcasted_tx_hash` schema carried an `error_msg` column.
    // Refusing to open is deliberate: the operator must migrate explicitly.
    fn reject_legacy_schema(conn: &Connection) -> Result<(), StoreError> {
        let mut stmt = conn.prepare("PRAGMA table_info(events)")?;
        let cols: Vec<String> = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .collect::<Result<_, _>>()?;
        if cols.iter().any(|c| c == "error_msg") || cols.iter().any(|c| c == "tx_hash") {
            return Err(StoreError::LegacySchema);
        }
        Ok(())
    }

    /// Insert a new event. Fails on duplicate id or an expiry at/below the
    /// observation height.
    pub fn create(&self, event: &Event) -> Result<(), StoreError> {
        if event.expiry_block_height <= event.block_height {
            return Err(StoreError::InvalidExpiry {
                block: event.block_height,
                expiry: event.expiry_block_height,
            });
        }
        let conn = self.conn.lock();
        let res = conn.execute(
            "INSERT INTO events (event_id, event_type, block_height, expiry_block_height, \
             event_data, broadcasted_tx_hash, status, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                event.event_id,
                event.event_type.as_str(),
                event.block_height as i64,
                event.expiry_block_height as i64,
                event.event_data,
                event.broadcasted_tx_hash,
                event.status.as_str(),
                event.created_at,
                event.updated_at,
            ],
        );
        match res {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(StoreError::Duplicate(event.event_id.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn get_event(&self, event_id: &str) -> Result<Event, StoreError> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("SELECT {SELECT_COLS} FROM events WHERE event_id = ?1"),
            params![event_id],
            row_to_event,
        )
        .optional()?
        .ok_or_else(|| StoreError::NotFound(event_id.to_string()))
    }

    /// Move an event to `next`, enforcing the status graph. Terminal rows are
    /// immutable.
    pub fn update_status(&self, event_id: &str, next: EventStatus) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        let current: Option<String> = conn
            .query_row(
                "SELECT status FROM events WHERE event_id = ?1",
                params![event_id],
                |row| row.get(0),
            )
            .optional()?;
        let current = current.ok_or_else(|| StoreError::NotFound(event_id.to_string()))?;
        let current = EventStatus::from_str(&current).ok_or(StoreError::Corrupt {
            what: "status",
            value: current,
        })?;
        if !current.can_transition_to(next) {
            return Err(StoreError::InvalidTransition {
                event_id: event_id.to_string(),
                from: current,
                to: next,
            });
        }
        conn.execute(
            "UPDATE events SET status = ?2, updated_at = ?3 WHERE event_id = ?1",
            params![event_id, next.as_str(), Utc::now().timestamp_millis()],
        )?;
        Ok(())
    }

    /// Record the CAIP hash of the destination-chain broadcast. Required
    /// before an event may move to BROADCASTED.
    pub fn update_broadcasted_tx_hash(
        &self,
        event_id: &str,
        caip_hash: &str,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        let n = conn.execute(
            "UPDATE events SET broadcasted_tx_hash = ?2, updated_at = ?3 WHERE event_id = ?1",
            params![event_id, caip_hash, Utc::now().timestamp_millis()],
        )?;
        if n == 0 {
            return Err(StoreError::NotFound(event_id.to_string()));
        }
        Ok(())
    }

    /// CONFIRMED rows old enough to act on and not yet expired, oldest first.
    /// `limit = 0` means unbounded. When the chain is younger than
    /// `min_confirmations` blocks the age threshold collapses to zero.
    pub fn get_non_expired_confirmed(
        &self,
        current_block: u64,
        min_confirmations: u64,
        limit: u32,
    ) -> Result<Vec<Event>, StoreError> {
        let threshold = current_block.saturating_sub(min_confirmations);
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SELECT_COLS} FROM events \
             WHERE status = 'CONFIRMED' AND block_height <= ?1 AND expiry_block_height > ?2 \
             ORDER BY block_height ASC, created_at ASC LIMIT ?3"
        ))?;
        let rows = stmt.query_map(
            params![threshold as i64, current_block as i64, limit_param(limit)],
            row_to_event,
        )?;
        collect(rows)
    }

    /// CONFIRMED rows whose expiry has passed (inclusive).
    pub fn get_expired_confirmed(
        &self,
        current_block: u64,
        limit: u32,
    ) -> Result<Vec<Event>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SELECT_COLS} FROM events \
             WHERE status = 'CONFIRMED' AND expiry_block_height <= ?1 \
             ORDER BY block_height ASC, created_at ASC LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![current_block as i64, limit_param(limit)], row_to_event)?;
        collect(rows)
    }

    /// FAILED rows awaiting revert handling.
    pub fn get_failed_events(&self, limit: u32) -> Result<Vec<Event>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SELECT_COLS} FROM events WHERE status = 'FAILED' \
             ORDER BY block_height ASC, created_at ASC LIMIT ?1"
        ))?;
        let rows = stmt.query_map(params![limit_param(limit)], row_to_event)?;
        collect(rows)
    }

    /// Non-terminal rows whose expiry has passed, for the revert sweep.
    pub fn get_block_expired_events(
        &self,
        current_block: u64,
        limit: u32,
    ) -> Result<Vec<Event>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SELECT_COLS} FROM events \
             WHERE expiry_block_height <= ?1 \
             AND status IN ('CONFIRMED', 'IN_PROGRESS', 'SIGNED', 'BROADCASTED') \
             ORDER BY block_height ASC, created_at ASC LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![current_block as i64, limit_param(limit)], row_to_event)?;
        collect(rows)
    }

    pub fn count_in_progress(&self) -> Result<u64, StoreError> {
        let conn = self.conn.lock();
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM events WHERE status = 'IN_PROGRESS'",
            [],
            |row| row.get(0),
        )?;
        Ok(n as u64)
    }

    /// Crash recovery: return every IN_PROGRESS row to CONFIRMED so the poll
    /// loop can pick it up again. Called once at startup; a second call is a
    /// no-op. Returns the number of rows reset.
    pub fn reset_in_progress_to_confirmed(&self) -> Result<u64, StoreError> {
        let conn = self.conn.lock();
        let n = conn.execute(
            "UPDATE events SET status = 'CONFIRMED', updated_at = ?1 \
             WHERE status = 'IN_PROGRESS'",
            params![Utc::now().timestamp_millis()],
        )?;
        Ok(n as u64)
    }

    /// Retention: delete terminal rows whose expiry lies further than
    /// `retention_blocks` behind the current height. Returns rows deleted.
    pub fn purge_terminal_events(
        &self,
        current_block: u64,
        retention_blocks: u64,
    ) -> Result<u64, StoreError> {
        let cutoff = current_block.saturating_sub(retention_blocks);
        let conn = self.conn.lock();
        let n = conn.execute(
            "DELETE FROM events WHERE status IN ('COMPLETED', 'REVERTED', 'EXPIRED') \
             AND expiry_block_height < ?1",
            params![cutoff as i64],
        )?;
        Ok(n as u64)
    }
}

fn limit_param(limit: u32) -> i64 {
    if limit == 0 {
        -1
    } else {
        limit as i64
    }
}

fn collect(
    rows: impl Iterator<Item = Result<Event, rusqlite::Error>>,
) -> Result<Vec<Event>, StoreError> {
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

fn row_to_event(row: &rusqlite::Row<'_>) -> Result<Event, rusqlite::Error> {
    let event_type: String = row.get(1)?;
    let status: String = row.get(6)?;
    Ok(Event {
        event_id: row.get(0)?,
        event_type: EventType::from_str(&event_type).ok_or_else(|| {
            rusqlite::Error::InvalidColumnType(1, "event_type".into(), rusqlite::types::Type::Text)
        })?,
        block_height: row.get::<_, i64>(2)? as u64,
        expiry_block_height: row.get::<_, i64>(3)? as u64,
        event_data: row.get(4)?,
        broadcasted_tx_hash: row.get(5)?,
        status: EventStatus::from_str(&status).ok_or_else(|| {
            rusqlite::Error::InvalidColumnType(6, "status".into(), rusqlite::types::Type::Text)
        })?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(id: &str, block: u64, expiry: u64) -> Event {
        Event::new(id, EventType::Sign, block, expiry, b"{}".to_vec())
    }

    #[test]
    fn create_rejects_duplicate_id() {
        let store = EventStore::open_in_memory().unwrap();
        store.create(&event("ev-1", 10, 100)).unwrap();
        assert!(matches!(
            store.create(&event("ev-1", 11, 101)),
            Err(StoreError::Duplicate(_))
        ));
    }

    #[test]
    fn create_rejects_expiry_at_or_below_block() {
        let store = EventStore::open_in_memory().unwrap();
        assert!(matches!(
            store.create(&event("ev-1", 100, 100)),
            Err(StoreError::InvalidExpiry { .. })
        ));
    }

    #[test]
    fn update_missing_row_fails() {
        let store = EventStore::open_in_memory().unwrap();
        assert!(matches!(
            store.update_status("nope", EventStatus::InProgress),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn terminal_rows_are_immutable() {
        let store = EventStore::open_in_memory().unwrap();
        store.create(&event("ev-1", 10, 100)).unwrap();
        store.update_status("ev-1", EventStatus::Expired).unwrap();
        for next in [
            EventStatus::Confirmed,
            EventStatus::InProgress,
            EventStatus::Reverted,
        ] {
            assert!(matches!(
                store.update_status("ev-1", next),
                Err(StoreError::InvalidTransition { .. })
            ));
        }
    }

    #[test]
    fn full_sign_path_is_accepted() {
        let store = EventStore::open_in_memory().unwrap();
        store.create(&event("ev-1", 10, 100)).unwrap();
        for next in [
            EventStatus::InProgress,
            EventStatus::Signed,
            EventStatus::Broadcasted,
            EventStatus::Completed,
        ] {
            store.update_status("ev-1", next).unwrap();
        }
        assert_eq!(store.get_event("ev-1").unwrap().status, EventStatus::Completed);
    }

    #[test]
    fn signed_cannot_skip_back_to_confirmed() {
        let store = EventStore::open_in_memory().unwrap();
        store.create(&event("ev-1", 10, 100)).unwrap();
        store.update_status("ev-1", EventStatus::InProgress).unwrap();
        store.update_status("ev-1", EventStatus::Signed).unwrap();
        assert!(matches!(
            store.update_status("ev-1", EventStatus::Confirmed),
            Err(StoreError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn pickup_orders_by_height_and_applies_confirmations() {
        let store = EventStore::open_in_memory().unwrap();
        for (id, height) in [("a", 80), ("b", 85), ("c", 95), ("d", 75)] {
            store.create(&event(id, height, 1_000)).unwrap();
        }
        let got = store.get_non_expired_confirmed(100, 10, 0).unwrap();
        let heights: Vec<u64> = got.iter().map(|e| e.block_height).collect();
        assert_eq!(heights, vec![75, 80, 85]);
    }

    #[test]
    fn confirmation_boundary_is_inclusive() {
        let store = EventStore::open_in_memory().unwrap();
        store.create(&event("ev-1", 90, 1_000)).unwrap();
        // current - block_height == min_confirmations => eligible
        assert_eq!(store.get_non_expired_confirmed(100, 10, 0).unwrap().len(), 1);
        assert_eq!(store.get_non_expired_confirmed(99, 10, 0).unwrap().len(), 0);
    }

    #[test]
    fn young_chain_collapses_threshold_to_zero() {
        let store = EventStore::open_in_memory().unwrap();
        store.create(&event("ev-1", 3, 1_000)).unwrap();
        assert_eq!(store.get_non_expired_confirmed(5, 10, 0).unwrap().len(), 1);
    }

    #[test]
    fn expiry_boundary_is_inclusive() {
        let store = EventStore::open_in_memory().unwrap();
        store.create(&event("ev-1", 10, 100)).unwrap();
        // expiry == current => expired, excluded from pickup
        assert_eq!(store.get_non_expired_confirmed(100, 0, 0).unwrap().len(), 0);
        assert_eq!(store.get_expired_confirmed(100, 0).unwrap().len(), 1);
        assert_eq!(store.get_expired_confirmed(99, 0).unwrap().len(), 0);
    }

    #[test]
    fn picked_up_event_never_reappears() {
        let store = EventStore::open_in_memory().unwrap();
        store.create(&event("ev-1", 10, 1_000)).unwrap();
        assert_eq!(store.get_non_expired_confirmed(100, 10, 0).unwrap().len(), 1);
        store.update_status("ev-1", EventStatus::InProgress).unwrap();
        assert_eq!(store.get_non_expired_confirmed(100, 10, 0).unwrap().len(), 0);
    }

    #[test]
    fn reset_in_progress_is_idempotent() {
        let store = EventStore::open_in_memory().unwrap();
        store.create(&event("ev-1", 10, 1_000)).unwrap();
        store.create(&event("ev-2", 11, 1_000)).unwrap();
        store.update_status("ev-1", EventStatus::InProgress).unwrap();
        store.update_status("ev-2", EventStatus::InProgress).unwrap();
        assert_eq!(store.reset_in_progress_to_confirmed().unwrap(), 2);
        assert_eq!(store.reset_in_progress_to_confirmed().unwrap(), 0);
    }

    #[test]
    fn block_expired_sweep_excludes_terminal_rows() {
        let store = EventStore::open_in_memory().unwrap();
        store.create(&event("active", 10, 50)).unwrap();
        store.create(&event("done", 10, 50)).unwrap();
        store.update_status("done", EventStatus::InProgress).unwrap();
        store.update_status("done", EventStatus::Signed).unwrap();
        store.update_status("done", EventStatus::Broadcasted).unwrap();
        store.update_status("done", EventStatus::Completed).unwrap();
        let ids: Vec<String> = store
            .get_block_expired_events(60, 0)
            .unwrap()
            .into_iter()
            .map(|e| e.event_id)
            .collect();
        assert_eq!(ids, vec!["active"]);
    }

    #[test]
    fn broadcast_hash_is_persisted() {
        let store = EventStore::open_in_memory().unwrap();
        store.create(&event("ev-1", 10, 1_000)).unwrap();
        store
            .update_broadcasted_tx_hash("ev-1", "eip155:11155111:0xabc")
            .unwrap();
        assert_eq!(
            store.get_event("ev-1").unwrap().broadcasted_tx_hash,
            "eip155:11155111:0xabc"
        );
    }

    #[test]
    fn purge_removes_only_old_terminal_rows() {
        let store = EventStore::open_in_memory().unwrap();
        store.create(&event("old", 10, 50)).unwrap();
        store.update_status("old", EventStatus::Expired).unwrap();
        store.create(&event("live", 10, 50)).unwrap();
        assert_eq!(store.purge_terminal_events(20_000, 10_000).unwrap(), 1);
        assert!(store.get_event("live").is_ok());
        assert!(matches!(store.get_event("old"), Err(StoreError::NotFound(_))));
    }
}
