//! Transition Validator
//!
//! The actor-gated adjacency table for contest status changes. This is the
//! single source of truth: every mutation path asks this module before
//! touching a contest row. Pure lookup, no I/O.

use crate::error::CoreError;
use crate::models::{Actor, ContestStatus};

use ContestStatus::*;

/// Time-driven transitions performed by the scheduler / read-path advancer.
/// LIVE -> ERROR is the settlement-failure quarantine edge.
const SYSTEM_EDGES: &[(ContestStatus, ContestStatus)] = &[
    (Scheduled, Locked),
    (Locked, Live),
    (Live, Complete),
    (Live, Error),
];

/// Manual transitions: force-lock, cancellation while money can still be
/// returned, and recovery of a quarantined settlement.
const ADMIN_EDGES: &[(ContestStatus, ContestStatus)] = &[
    (Scheduled, Locked),
    (Scheduled, Cancelled),
    (Locked, Cancelled),
    (Error, Complete),
    (Error, Cancelled),
];

pub fn is_allowed(from: ContestStatus, to: ContestStatus, actor: Actor) -> bool {
    let edges = match actor {
        Actor::System => SYSTEM_EDGES,
        Actor::Admin => ADMIN_EDGES,
    };
    edges.contains(&(from, to))
}

/// Reject any (from, to, actor) triple not in the adjacency table.
pub fn validate(from: ContestStatus, to: ContestStatus, actor: Actor) -> Result<(), CoreError> {
    if is_allowed(from, to, actor) {
        Ok(())
    } else {
        Err(CoreError::TransitionNotAllowed { from, to, actor })
    }
}
