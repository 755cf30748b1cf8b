//! External collaborator interfaces the engine consumes (spec §6). The core
//! only depends on these traits; `ledger-adapters` supplies concrete
//! implementations and `ledger-node` wires them together. None of this
//! module talks to HTTP, gRPC, or a UI — those facades are out of scope
//! (spec §1) and sit on top of these seams instead.

use crate::error::LedgerResult;
use async_trait::async_trait;
use chrono::Duration;
use rust_decimal::Decimal;
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

/// Validates a canonical encoding of a request payload against the
/// initiator's public key. The core treats a failure here as fatal (E005);
/// it does not issue signatures itself (spec §1 Non-goals).
#[async_trait]
pub trait SignatureVerifier: Send + Sync {
    async fn verify(&self, public_key: &str, payload: &Value, signature: &str) -> LedgerResult<()>;
}

/// One candidate route returned by the external routing collaborator. The
/// core validates what it receives; it does not compute routes itself.
#[derive(Debug, Clone)]
pub struct RouteCandidate {
    pub path: Vec<Uuid>,
    pub amount: Decimal,
}

#[async_trait]
pub trait Router: Send + Sync {
    async fn find_routes(
        &self,
        from: Uuid,
        to: Uuid,
        equivalent_id: Uuid,
        amount: Decimal,
        max_hops: u32,
        max_paths: u32,
    ) -> LedgerResult<Vec<RouteCandidate>>;
}

/// Domain events the engine fires after a commit, best-effort (spec §6,
/// SPEC_FULL §0.1). Delivery failure must never fail the owning operation.
#[derive(Debug, Clone)]
pub enum DomainEvent {
    PaymentCommitted { tx_id: String, equivalent_id: Uuid },
    PaymentAborted { tx_id: String, error_code: String },
    ClearingExecuted { tx_id: String, equivalent_id: Uuid, cleared_edges: u32 },
}

#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: DomainEvent);
}

/// Cross-process mutual-exclusion for `autoClear` (spec §5), keyed
/// `dlock:clearing:<equivalent>`. A missing implementation degrades to a
/// no-op single-process lock (§5); callers never block forever on `None`.
#[derive(Debug, Clone)]
pub struct LockToken {
    pub key: String,
    pub fence: String,
}

#[async_trait]
pub trait DistributedLockProvider: Send + Sync {
    /// Attempt to acquire `key` with the given TTL, waiting up to `wait`
    /// before giving up. `None` means the lock is currently held elsewhere.
    async fn acquire(&self, key: &str, ttl: Duration, wait: Duration) -> LedgerResult<Option<LockToken>>;

    async fn release(&self, token: LockToken) -> LedgerResult<()>;
}

/// Runtime configuration surface (spec §6's enumerated configuration list),
/// loaded by `ledger-node`'s CLI/env and constructible directly by library
/// callers (tests, embedders).
#[derive(Debug, Clone)]
pub struct LedgerEngineConfig {
    pub prepare_lock_ttl_seconds: i64,
    pub commit_retry_attempts: u32,
    pub commit_retry_base_delay_ms: u64,
    pub commit_retry_max_delay_ms: u64,
    pub recovery_interval_seconds: u64,
    pub integrity_checkpoint_interval_seconds: u64,
    pub payment_tx_stuck_timeout_seconds: i64,
    pub clearing_max_depth: u32,
    pub clearing_auto_clear_ceiling: u32,
    pub routing_max_hops: u32,
    pub routing_max_paths: u32,
    pub multipath_enabled: bool,
    pub full_multipath_enabled: bool,
    pub clearing_enabled: bool,
}

impl Default for LedgerEngineConfig {
    fn default() -> Self {
        Self {
            prepare_lock_ttl_seconds: 30,
            commit_retry_attempts: 4,
            commit_retry_base_delay_ms: 20,
            commit_retry_max_delay_ms: 500,
            recovery_interval_seconds: 60,
            integrity_checkpoint_interval_seconds: 300,
            payment_tx_stuck_timeout_seconds: 300,
            clearing_max_depth: 4,
            clearing_auto_clear_ceiling: 100,
            routing_max_hops: 6,
            routing_max_paths: 4,
            multipath_enabled: true,
            full_multipath_enabled: false,
            clearing_enabled: true,
        }
    }
}

/// Bundle of optional collaborators the payment/clearing engines accept.
/// Each is `Option` so a caller can run the core with only the store and
/// still get correct, spec-compliant behavior (signature verification is
/// simply skipped; events are simply not published; distributed locking
/// degrades to single-process per spec §5).
#[derive(Clone, Default)]
pub struct Collaborators {
    pub signature_verifier: Option<Arc<dyn SignatureVerifier>>,
    pub router: Option<Arc<dyn Router>>,
    pub event_publisher: Option<Arc<dyn EventPublisher>>,
    pub distributed_lock: Option<Arc<dyn DistributedLockProvider>>,
}
