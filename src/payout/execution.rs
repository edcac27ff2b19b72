//! Payout Execution Service
//!
//! Drives one transfer end to end inside a single database transaction:
//! claim, resolve the destination, call the provider under a deterministic
//! idempotency key, record the classified outcome, and append exactly one
//! ledger row for the attempt. Any error rolls the whole attempt back, so
//! a claimed/processing state never leaks past the transaction boundary.

use std::sync::Arc;

use rusqlite::{params, Connection, OptionalExtension};
use serde_json::json;
use tracing::{info, warn};

use crate::db::{self, Db};
use crate::error::{CoreError, ProviderError};
use crate::payout::ledger::{insert_entry, LedgerDirection, NewLedgerEntry};
use crate::payout::provider::{
    ledger_idempotency_key, payout_idempotency_key, PaymentProvider, TransferRequest,
};
use crate::payout::stores::{
    claim_transfer, fetch_job, fetch_transfer, finish_transfer, PayoutTransfer, TransferStatus,
    REASON_DESTINATION_MISSING,
};
use crate::settlement::service::fetch_settlement;

/// Resolves the payable destination account for a recipient. `None` is an
/// unrecoverable absence, not a retryable condition.
pub trait DestinationResolver: Send + Sync {
    fn resolve_destination(
        &self,
        conn: &Connection,
        contest_id: &str,
        user_id: &str,
    ) -> Result<Option<String>, CoreError>;
}

/// Resolver backed by the `payout_accounts` table (account linking writes it,
/// out of band).
pub struct DbDestinationResolver;

impl DestinationResolver for DbDestinationResolver {
    fn resolve_destination(
        &self,
        conn: &Connection,
        _contest_id: &str,
        user_id: &str,
    ) -> Result<Option<String>, CoreError> {
        let account: Option<String> = conn
            .query_row(
                "SELECT account_ref FROM payout_accounts WHERE user_id = ?1",
                params![user_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(account.filter(|a| !a.trim().is_empty()))
    }
}

/// Result of one execution attempt. Everything here is success-shaped; a
/// provider failure is a classified outcome, not an `Err`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    Completed { provider_transfer_id: String },
    Retryable { reason: String },
    FailedTerminal { reason: String },
    /// Not in a claimable status or out of attempts; nothing was written.
    NotClaimable,
}

#[derive(Clone)]
pub struct PayoutExecutionService {
    db: Db,
    provider: Arc<dyn PaymentProvider>,
    resolver: Arc<dyn DestinationResolver>,
}

impl PayoutExecutionService {
    pub fn new(
        db: Db,
        provider: Arc<dyn PaymentProvider>,
        resolver: Arc<dyn DestinationResolver>,
    ) -> Self {
        Self {
            db,
            provider,
            resolver,
        }
    }

    /// Execute one attempt for one transfer, fully transactional.
    pub async fn execute_transfer(
        &self,
        transfer_id: &str,
    ) -> Result<TransferOutcome, CoreError> {
        let conn = self.db.lock().await;
        db::begin(&conn)?;
        match self.execute_in_tx(&conn, transfer_id).await {
            Ok(outcome) => {
                db::commit(&conn)?;
                Ok(outcome)
            }
            Err(e) => {
                db::rollback(&conn);
                Err(e)
            }
        }
    }

    async fn execute_in_tx(
        &self,
        conn: &Connection,
        transfer_id: &str,
    ) -> Result<TransferOutcome, CoreError> {
        let Some(transfer) = fetch_transfer(conn, transfer_id)? else {
            return Ok(TransferOutcome::NotClaimable);
        };
        if !transfer.is_claimable() {
            return Ok(TransferOutcome::NotClaimable);
        }
        if !claim_transfer(conn, transfer_id, transfer.status)? {
            return Ok(TransferOutcome::NotClaimable);
        }
        let attempt = transfer.attempt_count + 1;

        let job = fetch_job(conn, &transfer.job_id)?
            .ok_or_else(|| CoreError::JobNotFound(transfer.job_id.clone()))?;
        let settlement = fetch_settlement(conn, &job.contest_id)?
            .ok_or_else(|| CoreError::SettlementMissing(job.contest_id.clone()))?;

        let Some(destination) =
            self.resolver
                .resolve_destination(conn, &job.contest_id, &transfer.user_id)?
        else {
            // No financial event occurred: terminal, provider untouched,
            // no ledger row.
            finish_transfer(
                conn,
                transfer_id,
                TransferStatus::FailedTerminal,
                None,
                Some(REASON_DESTINATION_MISSING),
            )?;
            warn!(
                transfer_id,
                user_id = %transfer.user_id,
                "no payout destination, transfer failed terminally"
            );
            return Ok(TransferOutcome::FailedTerminal {
                reason: REASON_DESTINATION_MISSING.to_string(),
            });
        };

        let request = TransferRequest {
            amount_cents: transfer.amount_cents,
            destination,
            idempotency_key: payout_idempotency_key(transfer_id),
            metadata: json!({
                "contest_id": job.contest_id,
                "job_id": transfer.job_id,
                "user_id": transfer.user_id,
                "attempt": attempt,
            }),
        };

        let (outcome, direction) = match self.provider.create_transfer(&request).await {
            Ok(provider_transfer) => {
                finish_transfer(
                    conn,
                    transfer_id,
                    TransferStatus::Completed,
                    Some(&provider_transfer.transfer_id),
                    None,
                )?;
                info!(
                    transfer_id,
                    provider_transfer_id = %provider_transfer.transfer_id,
                    amount_cents = transfer.amount_cents,
                    "transfer completed"
                );
                (
                    TransferOutcome::Completed {
                        provider_transfer_id: provider_transfer.transfer_id,
                    },
                    LedgerDirection::Credit,
                )
            }
            Err(provider_error) => (
                self.record_failure(conn, transfer_id, &transfer, attempt, provider_error)?,
                LedgerDirection::Debit,
            ),
        };

        insert_entry(
            conn,
            &NewLedgerEntry {
                idempotency_key: ledger_idempotency_key(transfer_id, attempt),
                transfer_id,
                direction,
                amount_cents: transfer.amount_cents,
                contest_id: &job.contest_id,
                snapshot_id: &settlement.snapshot_id,
                snapshot_hash: &settlement.snapshot_hash,
            },
        )?;

        Ok(outcome)
    }

    fn record_failure(
        &self,
        conn: &Connection,
        transfer_id: &str,
        transfer: &PayoutTransfer,
        attempt: i64,
        provider_error: ProviderError,
    ) -> Result<TransferOutcome, CoreError> {
        let reason = provider_error.code().to_string();
        let exhausted = attempt >= transfer.max_attempts;
        // Permanent errors fail terminally; retryable errors fail terminally
        // once the attempt budget is spent.
        let terminal = !provider_error.is_retryable() || exhausted;
        let to = if terminal {
            TransferStatus::FailedTerminal
        } else {
            TransferStatus::Retryable
        };
        finish_transfer(conn, transfer_id, to, None, Some(&reason))?;
        warn!(
            transfer_id,
            attempt,
            max_attempts = transfer.max_attempts,
            reason = %reason,
            terminal,
            "transfer attempt failed"
        );
        Ok(if terminal {
            TransferOutcome::FailedTerminal { reason }
        } else {
            TransferOutcome::Retryable { reason }
        })
    }
}
