//! Persisted call records.
//!
//! SQLite-backed call log, written twice per call: once when the call is
//! initiated or answered, once at session teardown. Also caches alert
//! channel ids per user so teardown alerting does not re-query the gateway
//! for every inbound call.

use crate::error::{BridgeError, Result};
use rusqlite::{Connection, params};
use std::path::Path;
use std::sync::Mutex;
use tracing::debug;

/// Direction of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallDirection {
    Outbound,
    Inbound,
}

impl CallDirection {
    fn as_str(self) -> &'static str {
        match self {
            Self::Outbound => "outbound",
            Self::Inbound => "inbound",
        }
    }
}

/// Fields known when a call record is first created.
#[derive(Debug, Clone)]
pub struct NewCall {
    pub call_id: Option<String>,
    pub direction: CallDirection,
    pub to_number: String,
    pub from_number: String,
    /// `"initiated"`, `"ringing"`, or `"failed"`.
    pub status: String,
    pub user_id: Option<String>,
    pub chat_id: Option<String>,
}

/// Final state written at teardown.
#[derive(Debug, Clone)]
pub struct CallOutcome {
    pub status: String,
    pub duration_secs: i64,
    pub transcript: String,
    pub cost: f64,
}

/// A persisted call record.
#[derive(Debug, Clone)]
pub struct CallRecord {
    pub id: i64,
    pub call_id: Option<String>,
    pub direction: String,
    pub to_number: String,
    pub from_number: String,
    pub status: String,
    pub duration_secs: Option<i64>,
    pub transcript: Option<String>,
    pub cost: Option<f64>,
    pub user_id: Option<String>,
    pub chat_id: Option<String>,
}

/// SQLite-backed call log.
///
/// Thread-safe via an internal `Mutex<Connection>`; every operation is a
/// single short statement, so serializing writes is fine.
pub struct CallLogStore {
    conn: Mutex<Connection>,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS call_log (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    call_control_id  TEXT,
    direction        TEXT NOT NULL,
    to_number        TEXT NOT NULL,
    from_number      TEXT NOT NULL,
    status           TEXT NOT NULL,
    duration_seconds INTEGER,
    transcript       TEXT,
    cost             REAL,
    user_id          TEXT,
    chat_id          TEXT,
    created_at       TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS user_channel (
    user_id      TEXT NOT NULL,
    channel_name TEXT NOT NULL,
    channel_id   TEXT NOT NULL,
    PRIMARY KEY (user_id, channel_name)
);
";

impl CallLogStore {
    /// Open (or create) the call log at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .map_err(|e| BridgeError::Records(format!("open {}: {e}", path.display())))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| BridgeError::Records(format!("schema: {e}")))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory store (tests).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| BridgeError::Records(format!("open in-memory: {e}")))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| BridgeError::Records(format!("schema: {e}")))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Insert a record for a freshly initiated or answered call.
    pub fn create_call(&self, call: &NewCall) -> Result<i64> {
        let conn = self.conn.lock().expect("store lock");
        conn.execute(
            "INSERT INTO call_log
             (call_control_id, direction, to_number, from_number, status, user_id, chat_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                call.call_id,
                call.direction.as_str(),
                call.to_number,
                call.from_number,
                call.status,
                call.user_id,
                call.chat_id,
                chrono::Utc::now().to_rfc3339(),
            ],
        )
        .map_err(|e| BridgeError::Records(format!("insert: {e}")))?;
        Ok(conn.last_insert_rowid())
    }

    /// Write the final state of a call. Resolves the record by persisted id
    /// when known, otherwise by the most recent row with the provider call
    /// id. Returns the updated record, or `None` if nothing matched.
    pub fn finalize_call(
        &self,
        record_id: Option<i64>,
        call_id: &str,
        outcome: &CallOutcome,
    ) -> Result<Option<CallRecord>> {
        let conn = self.conn.lock().expect("store lock");
        let id: Option<i64> = match record_id {
            Some(id) => Some(id),
            None => conn
                .query_row(
                    "SELECT id FROM call_log WHERE call_control_id = ?1 ORDER BY id DESC LIMIT 1",
                    params![call_id],
                    |row| row.get(0),
                )
                .ok(),
        };
        let Some(id) = id else {
            return Ok(None);
        };

        conn.execute(
            "UPDATE call_log SET status = ?1, duration_seconds = ?2, transcript = ?3, cost = ?4
             WHERE id = ?5",
            params![
                outcome.status,
                outcome.duration_secs,
                outcome.transcript,
                outcome.cost,
                id
            ],
        )
        .map_err(|e| BridgeError::Records(format!("update: {e}")))?;
        debug!(
            "finalized call record {id}: {} ({}s)",
            outcome.status, outcome.duration_secs
        );
        Self::row(&conn, id).map(Some)
    }

    /// Fetch a record by id.
    pub fn get(&self, id: i64) -> Result<CallRecord> {
        let conn = self.conn.lock().expect("store lock");
        Self::row(&conn, id)
    }

    fn row(conn: &Connection, id: i64) -> Result<CallRecord> {
        conn.query_row(
            "SELECT id, call_control_id, direction, to_number, from_number, status,
                    duration_seconds, transcript, cost, user_id, chat_id
             FROM call_log WHERE id = ?1",
            params![id],
            |row| {
                Ok(CallRecord {
                    id: row.get(0)?,
                    call_id: row.get(1)?,
                    direction: row.get(2)?,
                    to_number: row.get(3)?,
                    from_number: row.get(4)?,
                    status: row.get(5)?,
                    duration_secs: row.get(6)?,
                    transcript: row.get(7)?,
                    cost: row.get(8)?,
                    user_id: row.get(9)?,
                    chat_id: row.get(10)?,
                })
            },
        )
        .map_err(|e| BridgeError::Records(format!("select {id}: {e}")))
    }

    /// Cached alert channel id for a user, if previously resolved.
    pub fn channel_for(&self, user_id: &str, channel_name: &str) -> Option<String> {
        let conn = self.conn.lock().expect("store lock");
        conn.query_row(
            "SELECT channel_id FROM user_channel WHERE user_id = ?1 AND channel_name = ?2",
            params![user_id, channel_name],
            |row| row.get(0),
        )
        .ok()
    }

    /// Remember a resolved alert channel id.
    pub fn cache_channel(&self, user_id: &str, channel_name: &str, channel_id: &str) -> Result<()> {
        let conn = self.conn.lock().expect("store lock");
        conn.execute(
            "INSERT OR REPLACE INTO user_channel (user_id, channel_name, channel_id)
             VALUES (?1, ?2, ?3)",
            params![user_id, channel_name, channel_id],
        )
        .map_err(|e| BridgeError::Records(format!("cache channel: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_call(call_id: &str) -> NewCall {
        NewCall {
            call_id: Some(call_id.to_owned()),
            direction: CallDirection::Outbound,
            to_number: "+15550001111".to_owned(),
            from_number: "+15550002222".to_owned(),
            status: "initiated".to_owned(),
            user_id: None,
            chat_id: None,
        }
    }

    #[test]
    fn create_then_finalize_by_record_id() {
        let store = CallLogStore::open_in_memory().expect("store");
        let id = store.create_call(&new_call("cc-1")).expect("create");
        let outcome = CallOutcome {
            status: "completed".to_owned(),
            duration_secs: 42,
            transcript: "User: hi\nAssistant: hello".to_owned(),
            cost: 42.0 / 60.0 * 0.005,
        };
        let record = store
            .finalize_call(Some(id), "cc-1", &outcome)
            .expect("finalize")
            .expect("record");
        assert_eq!(record.status, "completed");
        assert_eq!(record.duration_secs, Some(42));
        assert!(record.transcript.as_deref().unwrap().contains("hello"));
    }

    #[test]
    fn finalize_falls_back_to_call_id_lookup() {
        let store = CallLogStore::open_in_memory().expect("store");
        store.create_call(&new_call("cc-old")).expect("create");
        let newest = store.create_call(&new_call("cc-2")).expect("create");
        let outcome = CallOutcome {
            status: "completed".to_owned(),
            duration_secs: 5,
            transcript: String::new(),
            cost: 0.0,
        };
        let record = store
            .finalize_call(None, "cc-2", &outcome)
            .expect("finalize")
            .expect("record");
        assert_eq!(record.id, newest);
    }

    #[test]
    fn finalize_of_unknown_call_is_a_noop() {
        let store = CallLogStore::open_in_memory().expect("store");
        let outcome = CallOutcome {
            status: "completed".to_owned(),
            duration_secs: 5,
            transcript: String::new(),
            cost: 0.0,
        };
        assert!(
            store
                .finalize_call(None, "ghost", &outcome)
                .expect("finalize")
                .is_none()
        );
    }

    #[test]
    fn channel_cache_round_trips() {
        let store = CallLogStore::open_in_memory().expect("store");
        assert!(store.channel_for("u1", "Alerts").is_none());
        store.cache_channel("u1", "Alerts", "ch-9").expect("cache");
        assert_eq!(store.channel_for("u1", "Alerts").as_deref(), Some("ch-9"));
    }

    #[test]
    fn persists_across_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("calls.db");
        let id = {
            let store = CallLogStore::open(&path).expect("store");
            store.create_call(&new_call("cc-1")).expect("create")
        };
        let store = CallLogStore::open(&path).expect("reopen");
        let record = store.get(id).expect("get");
        assert_eq!(record.call_id.as_deref(), Some("cc-1"));
        assert_eq!(record.status, "initiated");
    }
}
