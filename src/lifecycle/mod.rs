//! Contest lifecycle: the actor-gated state machine, its persistence, and
//! time-driven self-healing advancement.

pub mod advancer;
pub mod store;
pub mod transitions;

pub use advancer::{next_due, LifecycleAdvancer};
pub use store::{audit_payload, AuditRecord, ContestLifecycleStore, TransitionOutcome};
