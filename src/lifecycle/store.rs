//! Contest Lifecycle Store
//!
//! Persists contest rows and the transition audit trail. All status writes
//! are conditional (`UPDATE .. WHERE id = ?1 AND status = ?2`); zero affected
//! rows means another actor already moved the row and is treated as a benign
//! no-op, never an error.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use crate::db::{self, bad_column, parse_opt_ts, parse_ts, Db};
use crate::error::CoreError;
use crate::lifecycle::transitions;
use crate::models::{Actor, ContestInstance, ContestStatus, NewContest, PayoutStructure};

/// Result of a transition request. All three variants are success-shaped;
/// callers pattern-match instead of catching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionOutcome {
    /// The row moved from `from` to `to` and one audit row was written.
    Applied {
        from: ContestStatus,
        to: ContestStatus,
    },
    /// The contest was already in the requested status. One audit row is
    /// written tagged `noop` for observability; state is untouched.
    Noop { status: ContestStatus },
    /// A concurrent actor moved the row between read and write.
    LostRace,
}

/// One row of the write-only transition audit trail.
#[derive(Debug, Clone)]
pub struct AuditRecord {
    pub id: String,
    pub contest_id: String,
    pub from_status: ContestStatus,
    pub to_status: ContestStatus,
    pub actor: Actor,
    pub reason: String,
    pub noop: bool,
    pub payload: serde_json::Value,
}

#[derive(Clone)]
pub struct ContestLifecycleStore {
    db: Db,
}

impl ContestLifecycleStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Insert a new SCHEDULED contest.
    pub async fn create_contest(&self, new: &NewContest) -> Result<ContestInstance, CoreError> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let conn = self.db.lock().await;
        conn.execute(
            "INSERT INTO contests (id, sport, status, lock_time, tournament_start_time, \
             tournament_end_time, settle_time, entry_fee_cents, payout_structure, organizer_id, \
             created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL, ?7, ?8, ?9, ?10, ?10)",
            params![
                id,
                new.sport,
                ContestStatus::Scheduled.as_str(),
                new.lock_time.to_rfc3339(),
                new.tournament_start_time.to_rfc3339(),
                new.tournament_end_time.to_rfc3339(),
                new.entry_fee_cents,
                new.payout_structure.to_json(),
                new.organizer_id,
                now.to_rfc3339(),
            ],
        )?;
        info!(contest_id = %id, sport = %new.sport, "contest created");
        Ok(ContestInstance {
            id,
            sport: new.sport.clone(),
            status: ContestStatus::Scheduled,
            lock_time: new.lock_time,
            tournament_start_time: new.tournament_start_time,
            tournament_end_time: new.tournament_end_time,
            settle_time: None,
            entry_fee_cents: new.entry_fee_cents,
            payout_structure: new.payout_structure.clone(),
            organizer_id: new.organizer_id.clone(),
            created_at: now,
            updated_at: now,
        })
    }

    /// Fetch one contest without self-healing advancement.
    pub async fn get_contest(&self, contest_id: &str) -> Result<Option<ContestInstance>, CoreError> {
        let conn = self.db.lock().await;
        fetch_contest(&conn, contest_id).map_err(Into::into)
    }

    /// All contests still subject to automatic advancement.
    pub async fn list_non_terminal(&self) -> Result<Vec<ContestInstance>, CoreError> {
        let conn = self.db.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {CONTEST_COLUMNS} FROM contests \
             WHERE status NOT IN ('COMPLETE', 'CANCELLED') ORDER BY lock_time ASC"
        ))?;
        let rows = stmt.query_map([], map_contest_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Validate and apply one transition as a single transaction.
    ///
    /// Re-requesting an already-applied transition returns `Noop` and writes
    /// one audit row tagged noop without rewriting state.
    pub async fn apply_transition(
        &self,
        contest_id: &str,
        to: ContestStatus,
        actor: Actor,
        reason: &str,
        payload: serde_json::Value,
    ) -> Result<TransitionOutcome, CoreError> {
        let conn = self.db.lock().await;
        db::begin(&conn)?;
        match transition_in_tx(&conn, contest_id, to, actor, reason, payload) {
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

    /// Audit rows for one contest, oldest first.
    pub async fn list_audit(&self, contest_id: &str) -> Result<Vec<AuditRecord>, CoreError> {
        let conn = self.db.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, contest_id, from_status, to_status, actor, reason, noop, payload \
             FROM contest_audit WHERE contest_id = ?1 ORDER BY created_at ASC, id ASC",
        )?;
        let rows = stmt.query_map(params![contest_id], |row| {
            let from_raw: String = row.get(2)?;
            let to_raw: String = row.get(3)?;
            let actor_raw: String = row.get(4)?;
            let payload_raw: String = row.get(7)?;
            Ok(AuditRecord {
                id: row.get(0)?,
                contest_id: row.get(1)?,
                from_status: ContestStatus::parse(&from_raw)
                    .ok_or_else(|| bad_column(2, "status", &from_raw))?,
                to_status: ContestStatus::parse(&to_raw)
                    .ok_or_else(|| bad_column(3, "status", &to_raw))?,
                actor: Actor::parse(&actor_raw)
                    .ok_or_else(|| bad_column(4, "actor", &actor_raw))?,
                reason: row.get(5)?,
                noop: row.get::<_, i64>(6)? != 0,
                payload: serde_json::from_str(&payload_raw).unwrap_or(serde_json::Value::Null),
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}

const CONTEST_COLUMNS: &str = "id, sport, status, lock_time, tournament_start_time, \
    tournament_end_time, settle_time, entry_fee_cents, payout_structure, organizer_id, \
    created_at, updated_at";

fn map_contest_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ContestInstance> {
    let status_raw: String = row.get(2)?;
    let lock_raw: String = row.get(3)?;
    let start_raw: String = row.get(4)?;
    let end_raw: String = row.get(5)?;
    let settle_raw: Option<String> = row.get(6)?;
    let structure_raw: String = row.get(8)?;
    let created_raw: String = row.get(10)?;
    let updated_raw: String = row.get(11)?;
    Ok(ContestInstance {
        id: row.get(0)?,
        sport: row.get(1)?,
        status: ContestStatus::parse(&status_raw)
            .ok_or_else(|| bad_column(2, "status", &status_raw))?,
        lock_time: parse_ts(3, &lock_raw)?,
        tournament_start_time: parse_ts(4, &start_raw)?,
        tournament_end_time: parse_ts(5, &end_raw)?,
        settle_time: parse_opt_ts(6, settle_raw)?,
        entry_fee_cents: row.get(7)?,
        payout_structure: PayoutStructure::from_json(&structure_raw)
            .map_err(|_| bad_column(8, "payout_structure", &structure_raw))?,
        organizer_id: row.get(9)?,
        created_at: parse_ts(10, &created_raw)?,
        updated_at: parse_ts(11, &updated_raw)?,
    })
}

/// Read one contest inside the caller's transaction.
pub(crate) fn fetch_contest(
    conn: &Connection,
    contest_id: &str,
) -> rusqlite::Result<Option<ContestInstance>> {
    conn.query_row(
        &format!("SELECT {CONTEST_COLUMNS} FROM contests WHERE id = ?1"),
        params![contest_id],
        map_contest_row,
    )
    .optional()
}

/// Conditional status flip. Returns false when zero rows matched, i.e. a
/// concurrent actor already moved the contest.
pub(crate) fn cas_status(
    conn: &Connection,
    contest_id: &str,
    from: ContestStatus,
    to: ContestStatus,
    settle_time: Option<chrono::DateTime<Utc>>,
) -> rusqlite::Result<bool> {
    let now = Utc::now().to_rfc3339();
    let affected = match settle_time {
        Some(ts) => conn.execute(
            "UPDATE contests SET status = ?1, settle_time = ?2, updated_at = ?3 \
             WHERE id = ?4 AND status = ?5",
            params![to.as_str(), ts.to_rfc3339(), now, contest_id, from.as_str()],
        )?,
        None => conn.execute(
            "UPDATE contests SET status = ?1, updated_at = ?2 \
             WHERE id = ?3 AND status = ?4",
            params![to.as_str(), now, contest_id, from.as_str()],
        )?,
    };
    Ok(affected == 1)
}

pub(crate) fn insert_audit(
    conn: &Connection,
    contest_id: &str,
    from: ContestStatus,
    to: ContestStatus,
    actor: Actor,
    reason: &str,
    noop: bool,
    payload: &serde_json::Value,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO contest_audit \
         (id, contest_id, from_status, to_status, actor, reason, noop, payload, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            Uuid::new_v4().to_string(),
            contest_id,
            from.as_str(),
            to.as_str(),
            actor.as_str(),
            reason,
            noop as i64,
            payload.to_string(),
            Utc::now().to_rfc3339(),
        ],
    )?;
    Ok(())
}

/// The transition body, run inside an already-open transaction so callers
/// (e.g. the settlement service) can compose it with other writes.
pub(crate) fn transition_in_tx(
    conn: &Connection,
    contest_id: &str,
    to: ContestStatus,
    actor: Actor,
    reason: &str,
    payload: serde_json::Value,
) -> Result<TransitionOutcome, CoreError> {
    let contest = fetch_contest(conn, contest_id)?
        .ok_or_else(|| CoreError::ContestNotFound(contest_id.to_string()))?;
    let from = contest.status;

    if from == to {
        insert_audit(conn, contest_id, from, to, actor, reason, true, &payload)?;
        return Ok(TransitionOutcome::Noop { status: from });
    }

    transitions::validate(from, to, actor)?;

    if !cas_status(conn, contest_id, from, to, None)? {
        return Ok(TransitionOutcome::LostRace);
    }
    insert_audit(conn, contest_id, from, to, actor, reason, false, &payload)?;
    info!(contest_id, %from, %to, %actor, "contest transition applied");
    Ok(TransitionOutcome::Applied { from, to })
}

/// Convenience payload for actor-driven transitions.
pub fn audit_payload(actor: Actor, reason: &str) -> serde_json::Value {
    json!({ "actor": actor.as_str(), "reason": reason })
}
