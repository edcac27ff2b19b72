//! Playoff Contest Backend Library
//!
//! Transactional core of the contest backend: the lifecycle state machine,
//! the deterministic settlement engine, and the exactly-once payout
//! pipeline. Exposed for the `playoffd` scheduler binary and tests.

pub mod db;
pub mod error;
pub mod lifecycle;
pub mod models;
pub mod payout;
pub mod settlement;
