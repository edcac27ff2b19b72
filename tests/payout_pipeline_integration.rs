//! End-to-end run of the contest core against a scratch SQLite database:
//! a stale contest self-heals through SCHEDULED -> LOCKED -> LIVE ->
//! COMPLETE, settlement produces the deterministic record, a payout job is
//! cut from the allocations, and the job service drives every transfer to
//! a terminal state with exactly one ledger row per attempt.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use rusqlite::params;
use tempfile::NamedTempFile;

use playoff_backend::{
    db::Db,
    error::ProviderError,
    lifecycle::{ContestLifecycleStore, LifecycleAdvancer},
    models::{ContestStatus, NewContest, PayoutStructure},
    payout::{
        DbDestinationResolver, JobStatus, LedgerDirection, LedgerStore, PaymentProvider,
        PayoutExecutionService, PayoutJobService, PayoutStore, ProviderTransfer, TransferRequest,
        TransferStatus,
    },
    settlement::{SettleOutcome, SettlementService, StoredScoreStrategy, StrategyRegistry},
};

/// In-memory provider honoring idempotency keys: the same key always maps
/// to the same provider transfer, however many times it is retried.
struct FakeProvider {
    calls: AtomicUsize,
    created: std::sync::Mutex<Vec<String>>,
}

impl FakeProvider {
    fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            created: std::sync::Mutex::new(Vec::new()),
        }
    }

    fn distinct_transfers(&self) -> usize {
        self.created.lock().unwrap().len()
    }
}

#[async_trait]
impl PaymentProvider for FakeProvider {
    async fn create_transfer(
        &self,
        request: &TransferRequest,
    ) -> Result<ProviderTransfer, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut created = self.created.lock().unwrap();
        if !created.contains(&request.idempotency_key) {
            created.push(request.idempotency_key.clone());
        }
        Ok(ProviderTransfer {
            transfer_id: format!("pt_{}", request.idempotency_key),
        })
    }
}

struct World {
    db: Db,
    store: ContestLifecycleStore,
    advancer: LifecycleAdvancer,
    settlement: SettlementService,
    payout_store: PayoutStore,
    jobs: PayoutJobService,
    ledger: LedgerStore,
    provider: Arc<FakeProvider>,
    _tmp: NamedTempFile,
}

fn build_world() -> World {
    let tmp = NamedTempFile::new().unwrap();
    let db = Db::open(tmp.path().to_str().unwrap()).unwrap();

    let mut registry = StrategyRegistry::new();
    registry.register("nfl", Arc::new(StoredScoreStrategy));
    let settlement = SettlementService::new(db.clone(), Arc::new(registry));
    let store = ContestLifecycleStore::new(db.clone());
    let advancer = LifecycleAdvancer::new(store.clone(), settlement.clone());

    let provider = Arc::new(FakeProvider::new());
    let payout_store = PayoutStore::new(db.clone());
    let execution = PayoutExecutionService::new(
        db.clone(),
        provider.clone(),
        Arc::new(DbDestinationResolver),
    );
    let jobs = PayoutJobService::new(db.clone(), payout_store.clone(), execution);

    World {
        ledger: LedgerStore::new(db.clone()),
        db,
        store,
        advancer,
        settlement,
        payout_store,
        jobs,
        provider,
        _tmp: tmp,
    }
}

/// A contest whose tournament already ended, with ingested scores, a
/// snapshot binding, and linked payout accounts for the given users.
async fn seed_finished_contest(
    world: &World,
    scores: &[(&str, f64)],
    accounts: &[&str],
) -> String {
    let now = Utc::now();
    let contest = world
        .store
        .create_contest(&NewContest {
            sport: "nfl".to_string(),
            lock_time: now - Duration::hours(6),
            tournament_start_time: now - Duration::hours(5),
            tournament_end_time: now - Duration::hours(1),
            entry_fee_cents: 5000,
            payout_structure: PayoutStructure::new([(1, 70.0), (2, 20.0), (3, 10.0)]).unwrap(),
            organizer_id: "org-1".to_string(),
        })
        .await
        .unwrap();

    let conn = world.db.lock().await;
    conn.execute(
        "INSERT INTO score_snapshots (contest_id, snapshot_id, snapshot_hash, created_at) \
         VALUES (?1, ?2, ?3, ?4)",
        params![
            contest.id,
            format!("snap-{}", contest.id),
            "1f4e8a0c",
            now.to_rfc3339()
        ],
    )
    .unwrap();
    for (participant, score) in scores {
        conn.execute(
            "INSERT INTO participant_scores (contest_id, participant_id, total_score) \
             VALUES (?1, ?2, ?3)",
            params![contest.id, participant, score],
        )
        .unwrap();
    }
    for user in accounts {
        conn.execute(
            "INSERT INTO payout_accounts (user_id, account_ref, updated_at) \
             VALUES (?1, ?2, ?3)",
            params![user, format!("acct_{user}"), now.to_rfc3339()],
        )
        .unwrap();
    }
    drop(conn);

    contest.id
}

#[tokio::test]
async fn full_pipeline_settles_and_pays_out_exactly_once() {
    let world = build_world();
    // Two-way tie for first plus a third place, the settlement worked
    // example: pool 4 x 5000 = 20000, rake 2000, distributable 18000.
    let contest_id = seed_finished_contest(
        &world,
        &[("alice", 120.0), ("bob", 120.0), ("carol", 90.0), ("dave", 10.0)],
        &["alice", "bob", "carol"],
    )
    .await;

    // Read-path self-healing walks the contest to COMPLETE and settles.
    let contest = world
        .advancer
        .get_contest(&contest_id, Utc::now())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(contest.status, ContestStatus::Complete);

    let record = world
        .settlement
        .get_settlement(&contest_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.participant_count, 4);
    assert_eq!(record.total_pool_cents, 20_000);
    assert_eq!(record.results.rake_cents, 2_000);

    // Positions 1-2 combine to 90% of 18000 = 16200, split 8100/8100;
    // position 3 gets 10% = 1800.
    let amounts: Vec<i64> = record.results.payouts.iter().map(|p| p.amount_cents).collect();
    assert_eq!(amounts, vec![8_100, 8_100, 1_800]);
    let paid: i64 = amounts.iter().sum();
    assert_eq!(
        paid + record.results.platform_remainder_cents,
        record.results.distributable_cents
    );

    // Cut the payout job and drive it to completion.
    let job = world
        .payout_store
        .create_job_for_settlement(&record)
        .await
        .unwrap();
    let summary = world.jobs.process_job(&job.id).await.unwrap();
    assert_eq!(summary.completed, 3);
    assert!(summary.finalized);

    let job = world.payout_store.get_job(&job.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Complete);

    // Exactly one provider transfer and one CREDIT ledger row per winner.
    assert_eq!(world.provider.distinct_transfers(), 3);
    for transfer in world.payout_store.list_transfers(&job.id).await.unwrap() {
        assert_eq!(transfer.status, TransferStatus::Completed);
        let rows = world.ledger.list_for_transfer(&transfer.id).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].direction, LedgerDirection::Credit);
        assert_eq!(rows[0].snapshot_id, record.snapshot_id);
    }

    // Re-running the whole tail is idempotent end to end.
    match world.settlement.settle(&contest_id).await.unwrap() {
        SettleOutcome::AlreadySettled(again) => {
            assert_eq!(again.results_sha256, record.results_sha256)
        }
        other => panic!("expected AlreadySettled, got {other:?}"),
    }
    let again = world
        .payout_store
        .create_job_for_settlement(&record)
        .await
        .unwrap();
    assert_eq!(again.id, job.id);
    let repass = world.jobs.process_job(&job.id).await.unwrap();
    assert_eq!(repass.processed, 0);
    assert_eq!(world.provider.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn winner_without_account_fails_terminally_without_ledger_noise() {
    let world = build_world();
    // "bob" never linked a payout account.
    let contest_id =
        seed_finished_contest(&world, &[("alice", 50.0), ("bob", 40.0)], &["alice"]).await;

    world
        .advancer
        .advance_contest(&contest_id, Utc::now())
        .await
        .unwrap();
    let record = world
        .settlement
        .get_settlement(&contest_id)
        .await
        .unwrap()
        .unwrap();
    let job = world
        .payout_store
        .create_job_for_settlement(&record)
        .await
        .unwrap();

    let summary = world.jobs.process_job(&job.id).await.unwrap();
    assert_eq!(summary.completed, 1);
    assert_eq!(summary.failed_terminal, 1);
    assert!(summary.finalized);

    let transfers = world.payout_store.list_transfers(&job.id).await.unwrap();
    let bob = transfers.iter().find(|t| t.user_id == "bob").unwrap();
    assert_eq!(bob.status, TransferStatus::FailedTerminal);
    assert_eq!(
        bob.failure_reason.as_deref(),
        Some("DESTINATION_ACCOUNT_MISSING")
    );
    // No financial event for bob: the ledger only holds alice's credit.
    assert!(world
        .ledger
        .list_for_transfer(&bob.id)
        .await
        .unwrap()
        .is_empty());
    assert_eq!(world.ledger.count().await.unwrap(), 1);
    // Provider was only contacted for alice.
    assert_eq!(world.provider.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn contest_missing_snapshot_is_quarantined_in_error() {
    let world = build_world();
    let now = Utc::now();
    let contest = world
        .store
        .create_contest(&NewContest {
            sport: "nfl".to_string(),
            lock_time: now - Duration::hours(3),
            tournament_start_time: now - Duration::hours(2),
            tournament_end_time: now - Duration::hours(1),
            entry_fee_cents: 1000,
            payout_structure: PayoutStructure::new([(1, 100.0)]).unwrap(),
            organizer_id: "org-1".to_string(),
        })
        .await
        .unwrap();
    // No score snapshot ingested: settlement must refuse and the advancer
    // parks the contest for admin recovery.
    let advanced = world
        .advancer
        .advance_contest(&contest.id, now)
        .await
        .unwrap();
    assert_eq!(advanced.status, ContestStatus::Error);
    assert!(world
        .settlement
        .get_settlement(&contest.id)
        .await
        .unwrap()
        .is_none());
}
