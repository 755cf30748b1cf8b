//! Bootstrap for the ledger core's long-running process: wire the storage
//! pool and collaborator adapters together, then keep the recovery loop
//! (spec §4.5) running as a background task for as long as the process
//! lives. No HTTP/gRPC facade lives here — those sit outside the core
//! (spec §1) and would consume `LedgerNode::engines()` from the outside.

#![deny(unsafe_code)]

use ledger_adapters::{DirectRouter, Ed25519SignatureVerifier, InProcessLockProvider, TracingEventPublisher};
use ledger_core::{
    Collaborators, ClearingEngine, IntegrityCheckpointLoop, LedgerEngineConfig, LedgerStorageConfig,
    PaymentEngine, RecoveryLoop, Storage,
};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tracing::info;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error(transparent)]
    Core(#[from] ledger_core::LedgerError),
}

/// Everything `ledger-node` needs to bring the store up and keep it
/// healthy: the database connection and the tunable knobs from spec §6's
/// enumerated configuration list.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub engine: LedgerEngineConfig,
}

impl NodeConfig {
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            max_connections: 10,
            engine: LedgerEngineConfig::default(),
        }
    }
}

/// The bootstrapped node: a storage pool plus the payment, clearing, and
/// recovery engines wired to the same collaborator bundle. Cloning is
/// cheap — every field is an `Arc`-backed handle or `Clone`-cheap struct,
/// matching the grounding crate's `ServiceState`.
#[derive(Clone)]
pub struct LedgerNode {
    pub storage: Storage,
    pub payments: PaymentEngine,
    pub clearing: ClearingEngine,
    pub recovery: RecoveryLoop,
    pub integrity_checkpoints: IntegrityCheckpointLoop,
}

impl LedgerNode {
    pub async fn bootstrap(config: NodeConfig) -> Result<Self, NodeError> {
        let storage_config = LedgerStorageConfig::new(config.database_url.clone(), config.max_connections);
        let storage = Storage::connect(&storage_config).await?;
        storage.ensure_schema().await?;

        let collaborators = Collaborators {
            signature_verifier: Some(Arc::new(Ed25519SignatureVerifier)),
            router: Some(Arc::new(DirectRouter)),
            event_publisher: Some(Arc::new(TracingEventPublisher)),
            distributed_lock: Some(Arc::new(InProcessLockProvider::new())),
        };

        let payments = PaymentEngine::new(storage.clone(), config.engine.clone(), collaborators.clone());
        let clearing = ClearingEngine::new(storage.clone(), config.engine.clone(), collaborators.clone());
        let recovery = RecoveryLoop::new(storage.clone(), config.engine.clone(), payments.clone());
        let integrity_checkpoints = IntegrityCheckpointLoop::new(storage.clone(), config.engine.clone());

        info!(
            max_connections = config.max_connections,
            recovery_interval_seconds = config.engine.recovery_interval_seconds,
            integrity_checkpoint_interval_seconds = config.engine.integrity_checkpoint_interval_seconds,
            "ledger node bootstrapped"
        );

        Ok(Self {
            storage,
            payments,
            clearing,
            recovery,
            integrity_checkpoints,
        })
    }

    /// Spawns the recovery loop as a background task and returns its
    /// `JoinHandle` plus the sender used to request a cooperative shutdown
    /// (spec §4.5 — the loop exits cleanly after its current pass).
    pub fn spawn_recovery(&self) -> (tokio::task::JoinHandle<()>, watch::Sender<bool>) {
        let (tx, rx) = watch::channel(false);
        let recovery = self.recovery.clone();
        let handle = tokio::spawn(async move {
            recovery.run(rx).await;
        });
        (handle, tx)
    }

    /// Spawns the integrity checkpoint loop as a background task, mirroring
    /// `spawn_recovery`'s cooperative-shutdown contract.
    pub fn spawn_integrity_checkpoints(&self) -> (tokio::task::JoinHandle<()>, watch::Sender<bool>) {
        let (tx, rx) = watch::channel(false);
        let loop_handle = self.integrity_checkpoints.clone();
        let handle = tokio::spawn(async move {
            loop_handle.run(rx).await;
        });
        (handle, tx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_config_carries_the_spec_six_defaults() {
        let config = NodeConfig::new("postgres://localhost/ledger_test");
        assert_eq!(config.engine.prepare_lock_ttl_seconds, 30);
        assert_eq!(config.engine.clearing_max_depth, 4);
        assert!(config.engine.multipath_enabled);
        assert!(!config.engine.full_multipath_enabled);
    }
}
