//! Self-healing lifecycle advancement.
//!
//! Compares wall clock against the contest's stored timestamps and applies
//! any overdue SYSTEM transition. Runs inline on read paths (get/list) and
//! from the scheduler loop; failures are quarantined per contest so one bad
//! row never poisons a read or a scheduler pass.

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{error, warn};

use crate::error::CoreError;
use crate::lifecycle::store::{ContestLifecycleStore, TransitionOutcome};
use crate::models::{Actor, ContestInstance, ContestStatus};
use crate::settlement::service::{SettleOutcome, SettlementService};

/// The next overdue SYSTEM transition for a contest, if any. Pure.
pub fn next_due(contest: &ContestInstance, now: DateTime<Utc>) -> Option<ContestStatus> {
    match contest.status {
        ContestStatus::Scheduled if now >= contest.lock_time => Some(ContestStatus::Locked),
        ContestStatus::Locked if now >= contest.tournament_start_time => Some(ContestStatus::Live),
        ContestStatus::Live if now >= contest.tournament_end_time => Some(ContestStatus::Complete),
        _ => None,
    }
}

#[derive(Clone)]
pub struct LifecycleAdvancer {
    store: ContestLifecycleStore,
    settlement: SettlementService,
}

impl LifecycleAdvancer {
    pub fn new(store: ContestLifecycleStore, settlement: SettlementService) -> Self {
        Self { store, settlement }
    }

    /// Apply every overdue transition for one contest and return its final
    /// state. A contest whose tournament already ended walks
    /// SCHEDULED -> LOCKED -> LIVE -> COMPLETE in a single call, one
    /// transaction per step.
    pub async fn advance_contest(
        &self,
        contest_id: &str,
        now: DateTime<Utc>,
    ) -> Result<ContestInstance, CoreError> {
        loop {
            let contest = self
                .store
                .get_contest(contest_id)
                .await?
                .ok_or_else(|| CoreError::ContestNotFound(contest_id.to_string()))?;

            let Some(target) = next_due(&contest, now) else {
                return Ok(contest);
            };

            match target {
                ContestStatus::Complete => {
                    self.complete_with_settlement(contest_id).await?;
                    // Settlement is terminal either way (COMPLETE or ERROR).
                    return Ok(self
                        .store
                        .get_contest(contest_id)
                        .await?
                        .ok_or_else(|| CoreError::ContestNotFound(contest_id.to_string()))?);
                }
                to => {
                    match self
                        .store
                        .apply_transition(
                            contest_id,
                            to,
                            Actor::System,
                            "time-based advancement",
                            json!({ "now": now.to_rfc3339() }),
                        )
                        .await?
                    {
                        TransitionOutcome::Applied { .. } | TransitionOutcome::Noop { .. } => {}
                        // A concurrent actor moved the row; re-read and
                        // re-evaluate from its new state.
                        TransitionOutcome::LostRace => {}
                    }
                }
            }
        }
    }

    /// Read path: heal then return. Advancement failures are logged and the
    /// current row is returned anyway; a read must not fail because the
    /// clock moved.
    pub async fn get_contest(
        &self,
        contest_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<ContestInstance>, CoreError> {
        match self.advance_contest(contest_id, now).await {
            Ok(contest) => Ok(Some(contest)),
            Err(CoreError::ContestNotFound(_)) => Ok(None),
            Err(e) => {
                warn!(contest_id, error = %e, "advancement failed on read path");
                self.store.get_contest(contest_id).await
            }
        }
    }

    /// Scheduler pass: advance every non-terminal contest, quarantining
    /// per-contest failures. Returns how many contests were inspected.
    pub async fn advance_all(&self, now: DateTime<Utc>) -> Result<usize, CoreError> {
        let contests = self.store.list_non_terminal().await?;
        let inspected = contests.len();
        for contest in contests {
            if let Err(e) = self.advance_contest(&contest.id, now).await {
                error!(contest_id = %contest.id, error = %e, "advancement quarantined");
            }
        }
        Ok(inspected)
    }

    /// LIVE -> COMPLETE via settlement. If settlement fails for any reason
    /// the contest is parked in ERROR with the failure code preserved for
    /// admin recovery, and the original error is swallowed here because it
    /// has been fully captured.
    async fn complete_with_settlement(&self, contest_id: &str) -> Result<(), CoreError> {
        match self.settlement.settle(contest_id).await {
            Ok(SettleOutcome::Settled(_))
            | Ok(SettleOutcome::AlreadySettled(_))
            | Ok(SettleOutcome::NotLive { .. }) => Ok(()),
            Err(e) => {
                error!(contest_id, error = %e, "settlement failed, quarantining contest");
                self.store
                    .apply_transition(
                        contest_id,
                        ContestStatus::Error,
                        Actor::System,
                        "settlement failure",
                        json!({ "error": e.to_string() }),
                    )
                    .await?;
                Ok(())
            }
        }
    }
}
