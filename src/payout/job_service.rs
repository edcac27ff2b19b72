//! Payout Job Service
//!
//! Drives one job per scheduler pass: claim a bounded batch of transfers,
//! execute each (per-transfer failures are recorded, never abort the batch),
//! then run the finalization check. The check runs on every invocation —
//! a job can become fully terminal without any transfer being touched in
//! the current pass, and skipping the check would leave it stuck in
//! `processing` forever.

use chrono::Utc;
use tracing::{error, info};

use crate::db::{self, Db};
use crate::error::CoreError;
use crate::payout::execution::{PayoutExecutionService, TransferOutcome};
use crate::payout::stores::{
    cas_job_status, claimable_transfer_ids, fetch_job, transfer_counts, JobStatus, PayoutJob,
    PayoutStore,
};

pub const DEFAULT_BATCH_SIZE: usize = 50;

/// What one pass over a job did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobPassSummary {
    pub processed: usize,
    pub completed: usize,
    pub retryable: usize,
    pub failed_terminal: usize,
    pub errors: usize,
    pub finalized: bool,
}

#[derive(Clone)]
pub struct PayoutJobService {
    db: Db,
    store: PayoutStore,
    execution: PayoutExecutionService,
    batch_size: usize,
}

impl PayoutJobService {
    pub fn new(db: Db, store: PayoutStore, execution: PayoutExecutionService) -> Self {
        Self {
            db,
            store,
            execution,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// One pass over one job.
    pub async fn process_job(&self, job_id: &str) -> Result<JobPassSummary, CoreError> {
        let batch = self.claim_batch(job_id).await?;

        let mut summary = JobPassSummary::default();
        for transfer_id in &batch {
            match self.execution.execute_transfer(transfer_id).await {
                Ok(TransferOutcome::Completed { .. }) => summary.completed += 1,
                Ok(TransferOutcome::Retryable { .. }) => summary.retryable += 1,
                Ok(TransferOutcome::FailedTerminal { .. }) => summary.failed_terminal += 1,
                Ok(TransferOutcome::NotClaimable) => {}
                Err(e) => {
                    // The attempt rolled back; the transfer stays claimable
                    // for a later pass.
                    error!(job_id, transfer_id, error = %e, "transfer execution error");
                    summary.errors += 1;
                }
            }
            summary.processed += 1;
        }

        summary.finalized = self.finalize_if_terminal(job_id).await?;
        if summary.finalized {
            info!(job_id, "payout job complete");
        }
        Ok(summary)
    }

    /// One pass over every open job; per-job failures are quarantined.
    pub async fn process_open_jobs(&self) -> Result<usize, CoreError> {
        let jobs = self.store.list_open_jobs().await?;
        let count = jobs.len();
        for job in jobs {
            if let Err(e) = self.process_job(&job.id).await {
                error!(job_id = %job.id, error = %e, "job pass quarantined");
            }
        }
        Ok(count)
    }

    /// Mark the job processing and pull the ids this pass may work on.
    async fn claim_batch(&self, job_id: &str) -> Result<Vec<String>, CoreError> {
        let conn = self.db.lock().await;
        db::begin(&conn)?;
        let result = (|| -> Result<Vec<String>, CoreError> {
            let job: PayoutJob = fetch_job(&conn, job_id)?
                .ok_or_else(|| CoreError::JobNotFound(job_id.to_string()))?;
            if job.status == JobStatus::Pending {
                cas_job_status(&conn, job_id, JobStatus::Pending, JobStatus::Processing)?;
            }
            Ok(claimable_transfer_ids(&conn, job_id, self.batch_size)?)
        })();
        match result {
            Ok(ids) => {
                db::commit(&conn)?;
                Ok(ids)
            }
            Err(e) => {
                db::rollback(&conn);
                Err(e)
            }
        }
    }

    /// Finalization check: complete the job once every transfer is terminal.
    async fn finalize_if_terminal(&self, job_id: &str) -> Result<bool, CoreError> {
        let conn = self.db.lock().await;
        db::begin(&conn)?;
        let result = (|| -> Result<bool, CoreError> {
            let job = fetch_job(&conn, job_id)?
                .ok_or_else(|| CoreError::JobNotFound(job_id.to_string()))?;
            if job.status == JobStatus::Complete {
                return Ok(false);
            }
            let counts = transfer_counts(&conn, job_id)?;
            if !counts.all_terminal() {
                return Ok(false);
            }
            Ok(cas_job_status(&conn, job_id, job.status, JobStatus::Complete)?)
        })();
        match result {
            Ok(finalized) => {
                db::commit(&conn)?;
                Ok(finalized)
            }
            Err(e) => {
                db::rollback(&conn);
                Err(e)
            }
        }
    }
}
