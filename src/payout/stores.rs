//! Payout job and transfer persistence.
//!
//! Two-level model: one job per settlement, one transfer per winning
//! participant. Transfer claiming uses the same conditional-write discipline
//! as contest transitions, scoped to the transfer row so workers on
//! different transfers of one job never conflict.

use std::fmt;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::info;
use uuid::Uuid;

use crate::db::{bad_column, Db};
use crate::error::CoreError;
use crate::settlement::service::SettlementRecord;

pub const DEFAULT_MAX_ATTEMPTS: i64 = 3;

/// Terminal reason recorded when no payable destination exists.
pub const REASON_DESTINATION_MISSING: &str = "DESTINATION_ACCOUNT_MISSING";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Processing,
    Complete,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Complete => "complete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "processing" => Some(JobStatus::Processing),
            "complete" => Some(JobStatus::Complete),
            _ => None,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Pending,
    Processing,
    Completed,
    Retryable,
    FailedTerminal,
}

impl TransferStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferStatus::Pending => "pending",
            TransferStatus::Processing => "processing",
            TransferStatus::Completed => "completed",
            TransferStatus::Retryable => "retryable",
            TransferStatus::FailedTerminal => "failed_terminal",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TransferStatus::Pending),
            "processing" => Some(TransferStatus::Processing),
            "completed" => Some(TransferStatus::Completed),
            "retryable" => Some(TransferStatus::Retryable),
            "failed_terminal" => Some(TransferStatus::FailedTerminal),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TransferStatus::Completed | TransferStatus::FailedTerminal)
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct PayoutJob {
    pub id: String,
    pub contest_id: String,
    pub status: JobStatus,
}

#[derive(Debug, Clone)]
pub struct PayoutTransfer {
    pub id: String,
    pub job_id: String,
    pub user_id: String,
    pub amount_cents: i64,
    pub status: TransferStatus,
    pub attempt_count: i64,
    pub max_attempts: i64,
    pub provider_transfer_id: Option<String>,
    pub failure_reason: Option<String>,
}

impl PayoutTransfer {
    pub fn is_claimable(&self) -> bool {
        matches!(
            self.status,
            TransferStatus::Pending | TransferStatus::Retryable
        ) && self.attempt_count < self.max_attempts
    }
}

/// Counts used by the job finalization check.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferCounts {
    pub total: i64,
    pub completed: i64,
    pub failed_terminal: i64,
}

impl TransferCounts {
    pub fn all_terminal(&self) -> bool {
        self.total > 0 && self.completed + self.failed_terminal == self.total
    }
}

#[derive(Clone)]
pub struct PayoutStore {
    db: Db,
}

impl PayoutStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Create the payout job plus one pending transfer per positive payout
    /// allocation of a settlement, in one transaction. Idempotent per
    /// settlement: an existing job for the contest is returned untouched.
    pub async fn create_job_for_settlement(
        &self,
        settlement: &SettlementRecord,
    ) -> Result<PayoutJob, CoreError> {
        let conn = self.db.lock().await;
        crate::db::begin(&conn)?;
        match create_job_in_tx(&conn, settlement) {
            Ok(job) => {
                crate::db::commit(&conn)?;
                Ok(job)
            }
            Err(e) => {
                crate::db::rollback(&conn);
                Err(e)
            }
        }
    }

    pub async fn get_job(&self, job_id: &str) -> Result<Option<PayoutJob>, CoreError> {
        let conn = self.db.lock().await;
        fetch_job(&conn, job_id).map_err(Into::into)
    }

    pub async fn get_transfer(
        &self,
        transfer_id: &str,
    ) -> Result<Option<PayoutTransfer>, CoreError> {
        let conn = self.db.lock().await;
        fetch_transfer(&conn, transfer_id).map_err(Into::into)
    }

    /// Jobs the scheduler still owes work to.
    pub async fn list_open_jobs(&self) -> Result<Vec<PayoutJob>, CoreError> {
        let conn = self.db.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, contest_id, status FROM payout_jobs \
             WHERE status != 'complete' ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map([], map_job_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub async fn list_transfers(&self, job_id: &str) -> Result<Vec<PayoutTransfer>, CoreError> {
        let conn = self.db.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {TRANSFER_COLUMNS} FROM payout_transfers \
             WHERE job_id = ?1 ORDER BY created_at ASC, id ASC"
        ))?;
        let rows = stmt.query_map(params![job_id], map_transfer_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}

const TRANSFER_COLUMNS: &str = "id, job_id, user_id, amount_cents, status, attempt_count, \
    max_attempts, provider_transfer_id, failure_reason";

fn map_job_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PayoutJob> {
    let status_raw: String = row.get(2)?;
    Ok(PayoutJob {
        id: row.get(0)?,
        contest_id: row.get(1)?,
        status: JobStatus::parse(&status_raw)
            .ok_or_else(|| bad_column(2, "job status", &status_raw))?,
    })
}

fn map_transfer_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PayoutTransfer> {
    let status_raw: String = row.get(4)?;
    Ok(PayoutTransfer {
        id: row.get(0)?,
        job_id: row.get(1)?,
        user_id: row.get(2)?,
        amount_cents: row.get(3)?,
        status: TransferStatus::parse(&status_raw)
            .ok_or_else(|| bad_column(4, "transfer status", &status_raw))?,
        attempt_count: row.get(5)?,
        max_attempts: row.get(6)?,
        provider_transfer_id: row.get(7)?,
        failure_reason: row.get(8)?,
    })
}

pub(crate) fn fetch_job(conn: &Connection, job_id: &str) -> rusqlite::Result<Option<PayoutJob>> {
    conn.query_row(
        "SELECT id, contest_id, status FROM payout_jobs WHERE id = ?1",
        params![job_id],
        map_job_row,
    )
    .optional()
}

pub(crate) fn fetch_transfer(
    conn: &Connection,
    transfer_id: &str,
) -> rusqlite::Result<Option<PayoutTransfer>> {
    conn.query_row(
        &format!("SELECT {TRANSFER_COLUMNS} FROM payout_transfers WHERE id = ?1"),
        params![transfer_id],
        map_transfer_row,
    )
    .optional()
}

fn create_job_in_tx(
    conn: &Connection,
    settlement: &SettlementRecord,
) -> Result<PayoutJob, CoreError> {
    let contest_id = settlement.contest_instance_id.as_str();
    let existing: Option<PayoutJob> = conn
        .query_row(
            "SELECT id, contest_id, status FROM payout_jobs WHERE contest_id = ?1",
            params![contest_id],
            map_job_row,
        )
        .optional()?;
    if let Some(job) = existing {
        return Ok(job);
    }

    let job_id = Uuid::new_v4().to_string();
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO payout_jobs (id, contest_id, status, created_at, updated_at) \
         VALUES (?1, ?2, 'pending', ?3, ?3)",
        params![job_id, contest_id, now],
    )?;

    let mut winners = 0usize;
    for allocation in &settlement.results.payouts {
        if allocation.amount_cents <= 0 {
            continue;
        }
        conn.execute(
            "INSERT INTO payout_transfers (id, job_id, user_id, amount_cents, status, \
             attempt_count, max_attempts, provider_transfer_id, failure_reason, created_at, \
             updated_at) \
             VALUES (?1, ?2, ?3, ?4, 'pending', 0, ?5, NULL, NULL, ?6, ?6)",
            params![
                Uuid::new_v4().to_string(),
                job_id,
                allocation.participant_id,
                allocation.amount_cents,
                DEFAULT_MAX_ATTEMPTS,
                now,
            ],
        )?;
        winners += 1;
    }

    info!(contest_id, job_id = %job_id, winners, "payout job created");
    Ok(PayoutJob {
        id: job_id,
        contest_id: contest_id.to_string(),
        status: JobStatus::Pending,
    })
}

/// Conditional transfer status update; false means the row was not in the
/// expected status (a concurrent worker got there first).
pub(crate) fn cas_transfer_status(
    conn: &Connection,
    transfer_id: &str,
    from: TransferStatus,
    to: TransferStatus,
) -> rusqlite::Result<bool> {
    let affected = conn.execute(
        "UPDATE payout_transfers SET status = ?1, updated_at = ?2 \
         WHERE id = ?3 AND status = ?4",
        params![
            to.as_str(),
            Utc::now().to_rfc3339(),
            transfer_id,
            from.as_str()
        ],
    )?;
    Ok(affected == 1)
}

/// Claim: pending/retryable -> processing, bumping the attempt counter
/// exactly once per execution attempt.
pub(crate) fn claim_transfer(
    conn: &Connection,
    transfer_id: &str,
    from: TransferStatus,
) -> rusqlite::Result<bool> {
    let affected = conn.execute(
        "UPDATE payout_transfers SET status = 'processing', \
         attempt_count = attempt_count + 1, updated_at = ?1 \
         WHERE id = ?2 AND status = ?3 AND attempt_count < max_attempts",
        params![Utc::now().to_rfc3339(), transfer_id, from.as_str()],
    )?;
    Ok(affected == 1)
}

pub(crate) fn finish_transfer(
    conn: &Connection,
    transfer_id: &str,
    to: TransferStatus,
    provider_transfer_id: Option<&str>,
    failure_reason: Option<&str>,
) -> rusqlite::Result<bool> {
    let affected = conn.execute(
        "UPDATE payout_transfers SET status = ?1, provider_transfer_id = ?2, \
         failure_reason = ?3, updated_at = ?4 \
         WHERE id = ?5 AND status = 'processing'",
        params![
            to.as_str(),
            provider_transfer_id,
            failure_reason,
            Utc::now().to_rfc3339(),
            transfer_id,
        ],
    )?;
    Ok(affected == 1)
}

/// Ids of transfers a job pass may claim, bounded.
pub(crate) fn claimable_transfer_ids(
    conn: &Connection,
    job_id: &str,
    limit: usize,
) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare_cached(
        "SELECT id FROM payout_transfers \
         WHERE job_id = ?1 AND status IN ('pending', 'retryable') \
         AND attempt_count < max_attempts \
         ORDER BY created_at ASC, id ASC LIMIT ?2",
    )?;
    let rows = stmt.query_map(params![job_id, limit as i64], |row| row.get(0))?;
    rows.collect()
}

pub(crate) fn transfer_counts(
    conn: &Connection,
    job_id: &str,
) -> rusqlite::Result<TransferCounts> {
    conn.query_row(
        "SELECT COUNT(*), \
         COALESCE(SUM(status = 'completed'), 0), \
         COALESCE(SUM(status = 'failed_terminal'), 0) \
         FROM payout_transfers WHERE job_id = ?1",
        params![job_id],
        |row| {
            Ok(TransferCounts {
                total: row.get(0)?,
                completed: row.get(1)?,
                failed_terminal: row.get(2)?,
            })
        },
    )
}

pub(crate) fn cas_job_status(
    conn: &Connection,
    job_id: &str,
    from: JobStatus,
    to: JobStatus,
) -> rusqlite::Result<bool> {
    let affected = conn.execute(
        "UPDATE payout_jobs SET status = ?1, updated_at = ?2 \
         WHERE id = ?3 AND status = ?4",
        params![
            to.as_str(),
            Utc::now().to_rfc3339(),
            job_id,
            from.as_str()
        ],
    )?;
    Ok(affected == 1)
}
