//! Payout pipeline: the job/transfer two-level model, the provider adapter,
//! per-transfer transactional execution, and the append-only ledger.

pub mod execution;
pub mod job_service;
pub mod ledger;
pub mod provider;
pub mod stores;

pub use execution::{DbDestinationResolver, DestinationResolver, PayoutExecutionService, TransferOutcome};
pub use job_service::{JobPassSummary, PayoutJobService, DEFAULT_BATCH_SIZE};
pub use ledger::{LedgerDirection, LedgerEntry, LedgerStore};
pub use provider::{
    ledger_idempotency_key, payout_idempotency_key, HttpPaymentProvider, PaymentProvider,
    ProviderTransfer, TransferRequest,
};
pub use stores::{
    JobStatus, PayoutJob, PayoutStore, PayoutTransfer, TransferCounts, TransferStatus,
    DEFAULT_MAX_ATTEMPTS, REASON_DESTINATION_MISSING,
};
