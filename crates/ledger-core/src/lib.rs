//! Mutual-credit ledger core: the domain model, invariant checker, integrity
//! checkpoint, payment engine, clearing engine, recovery loop, and the
//! collaborator trait seams that adapters implement.
//!
//! A mutual-credit ledger tracks trustlines and debts between participants
//! within an equivalent (unit of account), settles payments via two-phase
//! commit over chains of trustlines, and periodically clears cycles of debt
//! that net to zero without moving any external value.

#![deny(unsafe_code)]

pub mod audit;
pub mod clearing;
pub mod collaborators;
pub mod error;
pub mod integrity;
pub mod invariants;
pub mod model;
pub mod payment;
pub mod recovery;
pub mod retry;
pub mod state_machine;
pub mod storage;

pub use audit::AuditLogWriter;
pub use clearing::{ClearingEngine, Cycle};
pub use collaborators::{
    Collaborators, DistributedLockProvider, DomainEvent, EventPublisher, LedgerEngineConfig,
    LockToken, Router, RouteCandidate, SignatureVerifier,
};
pub use error::{ErrorCode, ErrorObject, LedgerError, LedgerResult};
pub use integrity::{IntegrityCheckpointLoop, IntegrityEngine};
pub use invariants::InvariantChecker;
pub use model::{
    AuditLogEntry, Debt, Equivalent, Flow, IntegrityAuditLogEntry, IntegrityCheckpoint,
    IntegrityStatus, InvariantsStatus, LockEffects, Participant, ParticipantStatus,
    ParticipantType, PrepareLock, ReplayOutcome, Transaction, TransactionState, TransactionType,
    TrustLine, TrustLinePolicy, TrustLineStatus,
};
pub use payment::{MaxFlowResult, PaymentEngine, PaymentOutcome, PaymentRoute, RequestSignature};
pub use recovery::RecoveryLoop;
pub use retry::{with_retry, with_retry_in_savepoint, RetryPolicy};
pub use state_machine::TransactionStateMachine;
pub use storage::{IntegrityAuditLogFilters, LedgerStorageConfig, Storage};
