//! Transactional settlement execution.
//!
//! One transaction per settlement attempt: lock the contest, check
//! idempotency, validate LIVE, run the injected strategy, compute, insert
//! the settlement record, flip LIVE -> COMPLETE through the same conditional
//! write discipline as every other transition, write one audit row. Any
//! failure rolls the whole attempt back.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::json;
use tracing::info;

use crate::db::{self, parse_ts, Db};
use crate::error::CoreError;
use crate::lifecycle::store::{cas_status, fetch_contest, insert_audit};
use crate::models::{Actor, ContestStatus};
use crate::settlement::canonical::canonical_sha256;
use crate::settlement::engine::{compute_settlement, SettlementResults};
use crate::settlement::strategy::StrategyRegistry;

/// One immutable settlement record, 1:1 with a COMPLETE contest.
#[derive(Debug, Clone)]
pub struct SettlementRecord {
    pub contest_instance_id: String,
    pub snapshot_id: String,
    pub snapshot_hash: String,
    pub results: SettlementResults,
    pub results_sha256: String,
    pub settled_at: DateTime<Utc>,
    pub participant_count: i64,
    pub total_pool_cents: i64,
}

/// Settlement result shape. Idempotent re-runs and wrong-status calls are
/// success-shaped no-ops, never errors.
#[derive(Debug)]
pub enum SettleOutcome {
    Settled(SettlementRecord),
    AlreadySettled(SettlementRecord),
    NotLive { status: ContestStatus },
}

#[derive(Clone)]
pub struct SettlementService {
    db: Db,
    registry: Arc<StrategyRegistry>,
}

impl SettlementService {
    pub fn new(db: Db, registry: Arc<StrategyRegistry>) -> Self {
        Self { db, registry }
    }

    /// Settle one contest. Safe to call repeatedly: the second call returns
    /// the existing record without writing anything.
    pub async fn settle(&self, contest_id: &str) -> Result<SettleOutcome, CoreError> {
        let conn = self.db.lock().await;
        db::begin(&conn)?;
        match self.settle_in_tx(&conn, contest_id) {
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

    fn settle_in_tx(
        &self,
        conn: &Connection,
        contest_id: &str,
    ) -> Result<SettleOutcome, CoreError> {
        let contest = fetch_contest(conn, contest_id)?
            .ok_or_else(|| CoreError::ContestNotFound(contest_id.to_string()))?;

        if let Some(existing) = fetch_settlement(conn, contest_id)? {
            return Ok(SettleOutcome::AlreadySettled(existing));
        }
        if contest.status != ContestStatus::Live {
            return Ok(SettleOutcome::NotLive {
                status: contest.status,
            });
        }

        let strategy = self.registry.resolve(&contest.sport)?;
        let snapshot = strategy.aggregate_scores(conn, contest_id)?;
        snapshot.require_binding()?;

        let participant_count = snapshot.scores.len() as i64;
        let total_pool_cents = contest.entry_fee_cents * participant_count;
        let results =
            compute_settlement(&snapshot.scores, &contest.payout_structure, total_pool_cents);

        let results_value = serde_json::to_value(&results)?;
        let results_sha256 = canonical_sha256(&results_value);
        let settled_at = Utc::now();

        conn.execute(
            "INSERT INTO settlements (contest_instance_id, snapshot_id, snapshot_hash, results, \
             results_sha256, settled_at, participant_count, total_pool_cents) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                contest_id,
                snapshot.snapshot_id,
                snapshot.snapshot_hash,
                results_value.to_string(),
                results_sha256,
                settled_at.to_rfc3339(),
                participant_count,
                total_pool_cents,
            ],
        )?;

        if !cas_status(
            conn,
            contest_id,
            ContestStatus::Live,
            ContestStatus::Complete,
            Some(settled_at),
        )? {
            // Lost the row between read and write; the whole attempt rolls
            // back so the settlement insert above never lands either.
            return Err(CoreError::ContestNotFound(contest_id.to_string()));
        }
        insert_audit(
            conn,
            contest_id,
            ContestStatus::Live,
            ContestStatus::Complete,
            Actor::System,
            "settlement",
            false,
            &json!({
                "snapshot_id": snapshot.snapshot_id,
                "results_sha256": results_sha256,
                "participant_count": participant_count,
            }),
        )?;

        info!(
            contest_id,
            participant_count,
            total_pool_cents,
            results_sha256 = %results_sha256,
            "contest settled"
        );

        Ok(SettleOutcome::Settled(SettlementRecord {
            contest_instance_id: contest_id.to_string(),
            snapshot_id: snapshot.snapshot_id,
            snapshot_hash: snapshot.snapshot_hash,
            results,
            results_sha256,
            settled_at,
            participant_count,
            total_pool_cents,
        }))
    }

    pub async fn get_settlement(
        &self,
        contest_id: &str,
    ) -> Result<Option<SettlementRecord>, CoreError> {
        let conn = self.db.lock().await;
        fetch_settlement(&conn, contest_id)
    }
}

/// Read one settlement record inside the caller's transaction.
pub(crate) fn fetch_settlement(
    conn: &Connection,
    contest_id: &str,
) -> Result<Option<SettlementRecord>, CoreError> {
    let row: Option<(String, String, String, String, String, i64, i64)> = conn
        .query_row(
            "SELECT snapshot_id, snapshot_hash, results, results_sha256, settled_at, \
             participant_count, total_pool_cents \
             FROM settlements WHERE contest_instance_id = ?1",
            params![contest_id],
            |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                ))
            },
        )
        .optional()?;

    let Some((snapshot_id, snapshot_hash, results_raw, results_sha256, settled_raw, count, pool)) =
        row
    else {
        return Ok(None);
    };

    Ok(Some(SettlementRecord {
        contest_instance_id: contest_id.to_string(),
        snapshot_id,
        snapshot_hash,
        results: serde_json::from_str(&results_raw)?,
        results_sha256,
        settled_at: parse_ts(4, &settled_raw)?,
        participant_count: count,
        total_pool_cents: pool,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::store::ContestLifecycleStore;
    use crate::models::{NewContest, ParticipantScore, PayoutStructure, ScoreSnapshot};
    use crate::settlement::strategy::ScoreStrategy;
    use chrono::Duration;
    use tempfile::NamedTempFile;

    #[derive(Debug)]
    struct FixedScores {
        snapshot_id: String,
        snapshot_hash: String,
        scores: Vec<ParticipantScore>,
    }

    impl ScoreStrategy for FixedScores {
        fn aggregate_scores(
            &self,
            _conn: &Connection,
            _contest_id: &str,
        ) -> Result<ScoreSnapshot, CoreError> {
            Ok(ScoreSnapshot {
                snapshot_id: self.snapshot_id.clone(),
                snapshot_hash: self.snapshot_hash.clone(),
                scores: self.scores.clone(),
            })
        }
    }

    fn fixed(scores: Vec<(&str, f64)>) -> Arc<dyn ScoreStrategy> {
        Arc::new(FixedScores {
            snapshot_id: "snap-1".to_string(),
            snapshot_hash: "abc123".to_string(),
            scores: scores
                .into_iter()
                .map(|(id, s)| ParticipantScore {
                    participant_id: id.to_string(),
                    total_score: s,
                })
                .collect(),
        })
    }

    async fn live_contest(store: &ContestLifecycleStore) -> crate::models::ContestInstance {
        let now = Utc::now();
        let contest = store
            .create_contest(&NewContest {
                sport: "nfl".to_string(),
                lock_time: now - Duration::hours(3),
                tournament_start_time: now - Duration::hours(2),
                tournament_end_time: now - Duration::hours(1),
                entry_fee_cents: 5000,
                payout_structure: PayoutStructure::new([(1, 70.0), (2, 20.0), (3, 10.0)]).unwrap(),
                organizer_id: "org-1".to_string(),
            })
            .await
            .unwrap();
        for to in [ContestStatus::Locked, ContestStatus::Live] {
            store
                .apply_transition(&contest.id, to, Actor::System, "t", json!({}))
                .await
                .unwrap();
        }
        store.get_contest(&contest.id).await.unwrap().unwrap()
    }

    fn service_with(db: &Db, strategy: Arc<dyn ScoreStrategy>) -> SettlementService {
        let mut registry = StrategyRegistry::new();
        registry.register("nfl", strategy);
        SettlementService::new(db.clone(), Arc::new(registry))
    }

    #[tokio::test]
    async fn settle_completes_contest_and_writes_record() {
        let tmp = NamedTempFile::new().unwrap();
        let db = Db::open(tmp.path().to_str().unwrap()).unwrap();
        let store = ContestLifecycleStore::new(db.clone());
        let contest = live_contest(&store).await;
        let service = service_with(&db, fixed(vec![("a", 100.0), ("b", 100.0), ("c", 90.0)]));

        let outcome = service.settle(&contest.id).await.unwrap();
        let record = match outcome {
            SettleOutcome::Settled(r) => r,
            other => panic!("expected Settled, got {other:?}"),
        };

        // Pool 3 x 5000 = 15000, rake 1500, distributable 13500.
        assert_eq!(record.total_pool_cents, 15_000);
        assert_eq!(record.results.rake_cents, 1500);
        let paid: i64 = record.results.payouts.iter().map(|p| p.amount_cents).sum();
        assert_eq!(
            paid + record.results.platform_remainder_cents,
            record.results.distributable_cents
        );

        let fetched = store.get_contest(&contest.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, ContestStatus::Complete);
        assert!(fetched.settle_time.is_some());
    }

    #[tokio::test]
    async fn settle_twice_returns_same_record() {
        let tmp = NamedTempFile::new().unwrap();
        let db = Db::open(tmp.path().to_str().unwrap()).unwrap();
        let store = ContestLifecycleStore::new(db.clone());
        let contest = live_contest(&store).await;
        let service = service_with(&db, fixed(vec![("a", 10.0), ("b", 5.0)]));

        let first = match service.settle(&contest.id).await.unwrap() {
            SettleOutcome::Settled(r) => r,
            other => panic!("expected Settled, got {other:?}"),
        };
        let second = match service.settle(&contest.id).await.unwrap() {
            SettleOutcome::AlreadySettled(r) => r,
            other => panic!("expected AlreadySettled, got {other:?}"),
        };
        assert_eq!(first.results_sha256, second.results_sha256);
        assert_eq!(first.results, second.results);

        let conn = db.lock().await;
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM settlements", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn settle_non_live_contest_is_noop() {
        let tmp = NamedTempFile::new().unwrap();
        let db = Db::open(tmp.path().to_str().unwrap()).unwrap();
        let store = ContestLifecycleStore::new(db.clone());
        let now = Utc::now();
        let contest = store
            .create_contest(&NewContest {
                sport: "nfl".to_string(),
                lock_time: now + Duration::hours(1),
                tournament_start_time: now + Duration::hours(2),
                tournament_end_time: now + Duration::hours(3),
                entry_fee_cents: 1000,
                payout_structure: PayoutStructure::new([(1, 100.0)]).unwrap(),
                organizer_id: "org-1".to_string(),
            })
            .await
            .unwrap();
        let service = service_with(&db, fixed(vec![("a", 1.0)]));

        match service.settle(&contest.id).await.unwrap() {
            SettleOutcome::NotLive { status } => assert_eq!(status, ContestStatus::Scheduled),
            other => panic!("expected NotLive, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_snapshot_binding_aborts_and_rolls_back() {
        let tmp = NamedTempFile::new().unwrap();
        let db = Db::open(tmp.path().to_str().unwrap()).unwrap();
        let store = ContestLifecycleStore::new(db.clone());
        let contest = live_contest(&store).await;
        let unbound = Arc::new(FixedScores {
            snapshot_id: String::new(),
            snapshot_hash: String::new(),
            scores: vec![],
        });
        let service = service_with(&db, unbound);

        let err = service.settle(&contest.id).await.unwrap_err();
        assert!(matches!(err, CoreError::MissingSnapshotBinding));

        // Contest stayed LIVE, no settlement row landed.
        let fetched = store.get_contest(&contest.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, ContestStatus::Live);
        assert!(service.get_settlement(&contest.id).await.unwrap().is_none());
    }
}
