//! Concrete, swappable implementations of the ledger core's collaborator
//! seams (spec §6): a real Ed25519 signature verifier, a router stub the
//! core's validation logic sits in front of, a tracing-backed event
//! publisher, and an in-process distributed-lock provider that degrades to
//! single-process mutual exclusion when no external coordinator is wired up
//! (spec §5). None of these talk to HTTP or gRPC — they are the seams
//! `ledger-node` wires into `ledger_core::Collaborators`.

#![deny(unsafe_code)]

use async_trait::async_trait;
use chrono::{Duration, Utc};
use ledger_core::error::{LedgerError, LedgerResult};
use ledger_core::{
    DistributedLockProvider, DomainEvent, EventPublisher, LockToken, Router, RouteCandidate,
    SignatureVerifier,
};
use rust_decimal::Decimal;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

/// Validates a canonical (serde_json, insertion-order) encoding of the
/// payload against an Ed25519 signature, hex-encoded the way the rest of
/// the workspace encodes signatures and public keys.
#[derive(Debug, Clone, Default)]
pub struct Ed25519SignatureVerifier;

#[async_trait]
impl SignatureVerifier for Ed25519SignatureVerifier {
    async fn verify(&self, public_key: &str, payload: &Value, signature: &str) -> LedgerResult<()> {
        use ed25519_dalek::Verifier;

        let pk_bytes = hex::decode(public_key)
            .map_err(|e| LedgerError::InvalidSignature(format!("malformed public key: {e}")))?;
        let sig_bytes = hex::decode(signature)
            .map_err(|e| LedgerError::InvalidSignature(format!("malformed signature: {e}")))?;

        let pk_array: [u8; 32] = pk_bytes
            .as_slice()
            .try_into()
            .map_err(|_| LedgerError::InvalidSignature("public key must be 32 bytes".into()))?;
        let sig_array: [u8; 64] = sig_bytes
            .as_slice()
            .try_into()
            .map_err(|_| LedgerError::InvalidSignature("signature must be 64 bytes".into()))?;

        let verifying_key = ed25519_dalek::VerifyingKey::from_bytes(&pk_array)
            .map_err(|e| LedgerError::InvalidSignature(format!("invalid public key: {e}")))?;
        let sig = ed25519_dalek::Signature::from_bytes(&sig_array);

        let canonical = serde_json::to_vec(payload)?;
        verifying_key
            .verify(&canonical, &sig)
            .map_err(|e| LedgerError::InvalidSignature(format!("signature verification failed: {e}")))
    }
}

/// The core validates what it receives but does not compute routes itself
/// (spec §1, §6). This stub always reports no candidate routes; a real
/// deployment replaces it with a pathfinding service over the same
/// trustline graph the core persists.
#[derive(Debug, Clone, Default)]
pub struct NoRoutesRouter;

#[async_trait]
impl Router for NoRoutesRouter {
    async fn find_routes(
        &self,
        _from: Uuid,
        _to: Uuid,
        _equivalent_id: Uuid,
        _amount: Decimal,
        _max_hops: u32,
        _max_paths: u32,
    ) -> LedgerResult<Vec<RouteCandidate>> {
        Ok(Vec::new())
    }
}

/// A deterministic fixture router for tests and local development: returns
/// a single direct route when at least one hop is allowed, otherwise
/// nothing. Never claims capacity it cannot see — the payment engine's own
/// per-segment check (spec §4.3.1) is still the source of truth.
#[derive(Debug, Clone, Default)]
pub struct DirectRouter;

#[async_trait]
impl Router for DirectRouter {
    async fn find_routes(
        &self,
        from: Uuid,
        to: Uuid,
        _equivalent_id: Uuid,
        amount: Decimal,
        max_hops: u32,
        _max_paths: u32,
    ) -> LedgerResult<Vec<RouteCandidate>> {
        if max_hops < 1 {
            return Ok(Vec::new());
        }
        Ok(vec![RouteCandidate {
            path: vec![from, to],
            amount,
        }])
    }
}

/// Fires domain events through `tracing`, matching the workspace's
/// `event=<domain>.<action> key=value` log-line idiom. Publication is
/// best-effort by contract (spec §6) — this adapter cannot fail.
#[derive(Debug, Clone, Default)]
pub struct TracingEventPublisher;

#[async_trait]
impl EventPublisher for TracingEventPublisher {
    async fn publish(&self, event: DomainEvent) {
        match event {
            DomainEvent::PaymentCommitted { tx_id, equivalent_id } => {
                info!(event = "payment.committed", tx_id = %tx_id, equivalent_id = %equivalent_id);
            }
            DomainEvent::PaymentAborted { tx_id, error_code } => {
                info!(event = "payment.aborted", tx_id = %tx_id, error_code = %error_code);
            }
            DomainEvent::ClearingExecuted {
                tx_id,
                equivalent_id,
                cleared_edges,
            } => {
                info!(
                    event = "clearing.executed",
                    tx_id = %tx_id, equivalent_id = %equivalent_id, cleared_edges
                );
            }
        }
    }
}

struct HeldLock {
    fence: String,
    expires_at: chrono::DateTime<Utc>,
}

/// Single-process mutual exclusion keyed by string (spec §5's
/// `dlock:clearing:<equivalent>` format) — the degraded mode spec §5
/// mandates when no external coordinator (Redis, etcd, a Postgres advisory
/// lock service) is wired up. Safe across tasks in one process; a
/// multi-process deployment needs a real distributed implementation
/// instead.
#[derive(Clone, Default)]
pub struct InProcessLockProvider {
    held: Arc<Mutex<HashMap<String, HeldLock>>>,
}

impl InProcessLockProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DistributedLockProvider for InProcessLockProvider {
    async fn acquire(&self, key: &str, ttl: Duration, wait: Duration) -> LedgerResult<Option<LockToken>> {
        let deadline = tokio::time::Instant::now() + wait.to_std().unwrap_or_default();
        loop {
            {
                let mut held = self.held.lock().await;
                let expired = held.get(key).map(|h| h.expires_at <= Utc::now()).unwrap_or(true);
                if expired {
                    let fence = Uuid::new_v4().to_string();
                    held.insert(
                        key.to_string(),
                        HeldLock {
                            fence: fence.clone(),
                            expires_at: Utc::now() + ttl,
                        },
                    );
                    return Ok(Some(LockToken {
                        key: key.to_string(),
                        fence,
                    }));
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
    }

    async fn release(&self, token: LockToken) -> LedgerResult<()> {
        let mut held = self.held.lock().await;
        if let Some(current) = held.get(&token.key) {
            if current.fence == token.fence {
                held.remove(&token.key);
            } else {
                warn!(key = %token.key, "release called with a stale fence token, ignoring");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn ed25519_verifier_accepts_a_valid_signature_and_rejects_a_tampered_payload() {
        use ed25519_dalek::Signer;
        let signing_key = ed25519_dalek::SigningKey::from_bytes(&[7u8; 32]);
        let payload = json!({ "to": "pid:bob", "amount": "10.00" });
        let canonical = serde_json::to_vec(&payload).unwrap();
        let signature = signing_key.sign(&canonical);

        let verifier = Ed25519SignatureVerifier;
        let public_key = hex::encode(signing_key.verifying_key().as_bytes());
        let sig_hex = hex::encode(signature.to_bytes());

        verifier.verify(&public_key, &payload, &sig_hex).await.unwrap();

        let tampered = json!({ "to": "pid:bob", "amount": "99999.00" });
        let err = verifier.verify(&public_key, &tampered, &sig_hex).await.unwrap_err();
        assert!(matches!(err, LedgerError::InvalidSignature(_)));
    }

    #[tokio::test]
    async fn in_process_lock_excludes_a_concurrent_acquire() {
        let provider = InProcessLockProvider::new();
        let first = provider
            .acquire("dlock:clearing:usd", Duration::seconds(30), Duration::milliseconds(50))
            .await
            .unwrap();
        assert!(first.is_some());

        let second = provider
            .acquire("dlock:clearing:usd", Duration::seconds(30), Duration::milliseconds(50))
            .await
            .unwrap();
        assert!(second.is_none());

        provider.release(first.unwrap()).await.unwrap();
        let third = provider
            .acquire("dlock:clearing:usd", Duration::seconds(30), Duration::milliseconds(50))
            .await
            .unwrap();
        assert!(third.is_some());
    }
}
