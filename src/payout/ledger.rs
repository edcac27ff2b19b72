//! Append-only financial ledger.
//!
//! One row per transfer attempt outcome, never updated or deleted. The
//! idempotency key is unique per (transfer, attempt), so replaying an
//! attempt's write is a no-op at the database level.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};

use crate::db::{parse_ts, Db};
use crate::error::CoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerDirection {
    Credit,
    Debit,
}

impl LedgerDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerDirection::Credit => "CREDIT",
            LedgerDirection::Debit => "DEBIT",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "CREDIT" => Some(LedgerDirection::Credit),
            "DEBIT" => Some(LedgerDirection::Debit),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LedgerEntry {
    pub id: i64,
    pub idempotency_key: String,
    pub transfer_id: String,
    pub entry_type: String,
    pub direction: LedgerDirection,
    pub amount_cents: i64,
    pub contest_id: String,
    pub snapshot_id: String,
    pub snapshot_hash: String,
    pub created_at: DateTime<Utc>,
}

/// Fields an attempt outcome contributes to its ledger row. The snapshot
/// binding is copied from the settlement for audit traceability.
#[derive(Debug, Clone)]
pub struct NewLedgerEntry<'a> {
    pub idempotency_key: String,
    pub transfer_id: &'a str,
    pub direction: LedgerDirection,
    pub amount_cents: i64,
    pub contest_id: &'a str,
    pub snapshot_id: &'a str,
    pub snapshot_hash: &'a str,
}

pub const ENTRY_TYPE_PAYOUT: &str = "payout";

/// Insert one attempt-outcome row inside the caller's transaction.
/// Idempotent per key: a replay lands on the unique index and is ignored.
pub(crate) fn insert_entry(conn: &Connection, entry: &NewLedgerEntry<'_>) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO ledger_entries (idempotency_key, transfer_id, entry_type, direction, \
         amount_cents, contest_id, snapshot_id, snapshot_hash, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9) \
         ON CONFLICT(idempotency_key) DO NOTHING",
        params![
            entry.idempotency_key,
            entry.transfer_id,
            ENTRY_TYPE_PAYOUT,
            entry.direction.as_str(),
            entry.amount_cents,
            entry.contest_id,
            entry.snapshot_id,
            entry.snapshot_hash,
            Utc::now().to_rfc3339(),
        ],
    )?;
    Ok(())
}

#[derive(Clone)]
pub struct LedgerStore {
    db: Db,
}

impl LedgerStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// All attempt rows for one transfer, oldest first.
    pub async fn list_for_transfer(
        &self,
        transfer_id: &str,
    ) -> Result<Vec<LedgerEntry>, CoreError> {
        let conn = self.db.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, idempotency_key, transfer_id, entry_type, direction, amount_cents, \
             contest_id, snapshot_id, snapshot_hash, created_at \
             FROM ledger_entries WHERE transfer_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![transfer_id], |row| {
            let direction_raw: String = row.get(4)?;
            let created_raw: String = row.get(9)?;
            Ok(LedgerEntry {
                id: row.get(0)?,
                idempotency_key: row.get(1)?,
                transfer_id: row.get(2)?,
                entry_type: row.get(3)?,
                direction: LedgerDirection::parse(&direction_raw)
                    .ok_or_else(|| crate::db::bad_column(4, "direction", &direction_raw))?,
                amount_cents: row.get(5)?,
                contest_id: row.get(6)?,
                snapshot_id: row.get(7)?,
                snapshot_hash: row.get(8)?,
                created_at: parse_ts(9, &created_raw)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub async fn count(&self) -> Result<i64, CoreError> {
        let conn = self.db.lock().await;
        Ok(conn.query_row("SELECT COUNT(*) FROM ledger_entries", [], |row| row.get(0))?)
    }
}
