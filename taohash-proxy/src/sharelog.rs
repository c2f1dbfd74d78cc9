use rusqlite::{params, Connection};
use serde::Serialize;
use std::path::Path;
use thiserror::Error;
use tokio::sync::Mutex;

/// Share log error types
#[derive(Debug, Error)]
pub enum ShareLogError {
    /// SQLite error
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// One share submission and its verdict. Append-only; rows are never updated.
#[derive(Debug, Clone, Serialize)]
pub struct ShareEvent {
    /// Unix seconds
    pub ts: i64,

    /// Miner identity (`worker@ip:port`)
    pub miner: String,

    /// Pool label the share was submitted under
    pub pool: String,

    /// Effective difficulty at submit time
    pub difficulty: f64,

    /// Pool verdict
    pub accepted: bool,

    /// Pool error triple as a JSON string, for rejected shares
    pub error: Option<String>,
}

/// Append-only persistent log of share events, indexed by timestamp.
///
/// Appends are serialized through a single connection; the append must return
/// before the corresponding miner response is released.
pub struct ShareLog {
    conn: Mutex<Connection>,
}

impl ShareLog {
    /// Open (creating if necessary) the share log at `path`.
    pub fn open(path: &Path) -> Result<Self, ShareLogError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS share_events (
                ts         INTEGER NOT NULL,
                miner      TEXT    NOT NULL,
                pool       TEXT    NOT NULL,
                difficulty REAL    NOT NULL,
                accepted   INTEGER NOT NULL,
                error      TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_share_ts ON share_events(ts);",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Durably append one share event.
    pub async fn append(&self, event: &ShareEvent) -> Result<(), ShareLogError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO share_events (ts, miner, pool, difficulty, accepted, error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                event.ts,
                event.miner,
                event.pool,
                event.difficulty,
                event.accepted as i64,
                event.error,
            ],
        )?;
        Ok(())
    }

    /// Share events for `miner` at or after `since_ts`, oldest first.
    pub async fn events_for(
        &self,
        miner: &str,
        since_ts: i64,
    ) -> Result<Vec<ShareEvent>, ShareLogError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT ts, miner, pool, difficulty, accepted, error
             FROM share_events
             WHERE miner = ?1 AND ts >= ?2
             ORDER BY ts ASC",
        )?;
        let rows = stmt.query_map(params![miner, since_ts], Self::row_to_event)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// The most recent share events, newest first, with pagination.
    pub async fn recent(&self, limit: u32, offset: u32) -> Result<Vec<ShareEvent>, ShareLogError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT ts, miner, pool, difficulty, accepted, error
             FROM share_events
             ORDER BY ts DESC
             LIMIT ?1 OFFSET ?2",
        )?;
        let rows = stmt.query_map(params![limit, offset], Self::row_to_event)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<ShareEvent> {
        Ok(ShareEvent {
            ts: row.get(0)?,
            miner: row.get(1)?,
            pool: row.get(2)?,
            difficulty: row.get(3)?,
            accepted: row.get::<_, i64>(4)? != 0,
            error: row.get(5)?,
        })
    }
}
