//! SQLite handle shared by every store.
//!
//! One connection behind a tokio mutex; every multi-step mutation takes the
//! mutex once, runs `BEGIN IMMEDIATE .. COMMIT/ROLLBACK` on it, and performs
//! all of its reads and conditional writes inside that one transaction. The
//! explicit BEGIN/COMMIT (instead of `rusqlite::Transaction`) keeps the
//! guard `Send` so a transaction can span an awaited provider call.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use tokio::sync::{Mutex, MutexGuard};

use crate::error::CoreError;

#[derive(Clone)]
pub struct Db {
    conn: Arc<Mutex<Connection>>,
}

impl Db {
    pub fn open(db_path: &str) -> Result<Self, CoreError> {
        let conn = Connection::open(db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.pragma_update(None, "foreign_keys", "ON").ok();
        init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub async fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().await
    }
}

/// Begin an exclusive write transaction on the locked connection.
pub fn begin(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch("BEGIN IMMEDIATE")
}

pub fn commit(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch("COMMIT")
}

/// Best-effort rollback; the original error is what the caller reports.
pub fn rollback(conn: &Connection) {
    let _ = conn.execute_batch("ROLLBACK");
}

/// Parse an rfc3339 TEXT column into `DateTime<Utc>` inside a row mapper.
pub fn parse_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

pub fn parse_opt_ts(idx: usize, raw: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match raw {
        Some(s) => parse_ts(idx, &s).map(Some),
        None => Ok(None),
    }
}

/// Map a bad stored enum value to a conversion failure inside a row mapper.
pub fn bad_column(idx: usize, what: &str, raw: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        format!("invalid {what}: {raw}").into(),
    )
}

fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS contests (
            id TEXT PRIMARY KEY,
            sport TEXT NOT NULL,
            status TEXT NOT NULL,
            lock_time TEXT NOT NULL,
            tournament_start_time TEXT NOT NULL,
            tournament_end_time TEXT NOT NULL,
            settle_time TEXT,
            entry_fee_cents INTEGER NOT NULL,
            payout_structure TEXT NOT NULL,
            organizer_id TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_contests_status ON contests(status);

        CREATE TABLE IF NOT EXISTS contest_audit (
            id TEXT PRIMARY KEY,
            contest_id TEXT NOT NULL,
            from_status TEXT NOT NULL,
            to_status TEXT NOT NULL,
            actor TEXT NOT NULL,
            reason TEXT NOT NULL,
            noop INTEGER NOT NULL DEFAULT 0,
            payload TEXT NOT NULL,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_contest_audit_contest
            ON contest_audit(contest_id, created_at);

        CREATE TABLE IF NOT EXISTS settlements (
            contest_instance_id TEXT PRIMARY KEY,
            snapshot_id TEXT NOT NULL,
            snapshot_hash TEXT NOT NULL,
            results TEXT NOT NULL,
            results_sha256 TEXT NOT NULL,
            settled_at TEXT NOT NULL,
            participant_count INTEGER NOT NULL,
            total_pool_cents INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS payout_jobs (
            id TEXT PRIMARY KEY,
            contest_id TEXT NOT NULL,
            status TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_payout_jobs_status ON payout_jobs(status);

        CREATE TABLE IF NOT EXISTS payout_transfers (
            id TEXT PRIMARY KEY,
            job_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            amount_cents INTEGER NOT NULL,
            status TEXT NOT NULL,
            attempt_count INTEGER NOT NULL DEFAULT 0,
            max_attempts INTEGER NOT NULL,
            provider_transfer_id TEXT,
            failure_reason TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_payout_transfers_job
            ON payout_transfers(job_id, status);

        CREATE TABLE IF NOT EXISTS ledger_entries (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            idempotency_key TEXT UNIQUE NOT NULL,
            transfer_id TEXT NOT NULL,
            entry_type TEXT NOT NULL,
            direction TEXT NOT NULL,
            amount_cents INTEGER NOT NULL,
            contest_id TEXT NOT NULL,
            snapshot_id TEXT NOT NULL,
            snapshot_hash TEXT NOT NULL,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_ledger_entries_transfer
            ON ledger_entries(transfer_id);

        CREATE TABLE IF NOT EXISTS score_snapshots (
            contest_id TEXT PRIMARY KEY,
            snapshot_id TEXT NOT NULL,
            snapshot_hash TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS participant_scores (
            contest_id TEXT NOT NULL,
            participant_id TEXT NOT NULL,
            total_score REAL NOT NULL,
            PRIMARY KEY (contest_id, participant_id)
        );

        CREATE TABLE IF NOT EXISTS payout_accounts (
            user_id TEXT PRIMARY KEY,
            account_ref TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );",
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[tokio::test]
    async fn open_initializes_schema() {
        let tmp = NamedTempFile::new().unwrap();
        let db = Db::open(tmp.path().to_str().unwrap()).unwrap();
        let conn = db.lock().await;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name IN \
                 ('contests','contest_audit','settlements','payout_jobs',\
                  'payout_transfers','ledger_entries')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 6);
    }

    #[tokio::test]
    async fn explicit_transaction_rolls_back() {
        let tmp = NamedTempFile::new().unwrap();
        let db = Db::open(tmp.path().to_str().unwrap()).unwrap();
        let conn = db.lock().await;
        begin(&conn).unwrap();
        conn.execute(
            "INSERT INTO payout_accounts (user_id, account_ref, updated_at)
             VALUES ('u1', 'acct_1', '2026-01-01T00:00:00Z')",
            [],
        )
        .unwrap();
        rollback(&conn);
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM payout_accounts", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }
}
