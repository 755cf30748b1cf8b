//! Recovery Loop (spec §4.5): periodic maintenance of two-phase-commit
//! liveness against crashes and client abandonment. Runs once at startup,
//! then on `recovery_interval_seconds`, cooperatively cancellable via a
//! stop signal with a timeout equal to the interval.

use crate::audit::AuditLogWriter;
use crate::collaborators::LedgerEngineConfig;
use crate::error::LedgerResult;
use crate::model::TransactionType;
use crate::payment::PaymentEngine;
use crate::storage::{self, Storage};
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::json;
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Clone)]
pub struct RecoveryLoop {
    storage: Storage,
    config: LedgerEngineConfig,
    payments: PaymentEngine,
}

impl RecoveryLoop {
    pub fn new(storage: Storage, config: LedgerEngineConfig, payments: PaymentEngine) -> Self {
        Self {
            storage,
            config,
            payments,
        }
    }

    /// Enumerates distinct tx_ids of expired prepare locks and aborts each;
    /// afterward, best-effort deletes any residual expired lock rows (locks
    /// the abort itself didn't already clean up).
    pub async fn cleanup_expired_prepare_locks(&self) -> LedgerResult<u32> {
        let mut conn = self.storage.pool().acquire().await?;
        let tx_ids = storage::expired_lock_tx_ids(&mut conn).await?;
        let mut aborted = 0u32;
        for tx_id in &tx_ids {
            match self.payments.abort(tx_id, "Prepare lock expired", None, json!({})).await {
                Ok(()) => {
                    aborted += 1;
                    self.record_recovery_audit(&mut conn, "payment.lock_expired_abort", tx_id).await;
                }
                Err(e) => warn!(tx_id = %tx_id, error = %e, "failed to abort expired prepare lock"),
            }
        }
        let _ = storage::delete_expired_prepare_locks(&mut conn).await;
        Ok(aborted)
    }

    /// Aborts PAYMENT transactions stuck in any active state past
    /// `payment_tx_stuck_timeout_seconds`.
    pub async fn abort_stale_payment_transactions(&self) -> LedgerResult<u32> {
        let mut conn = self.storage.pool().acquire().await?;
        let cutoff = Utc::now() - ChronoDuration::seconds(self.config.payment_tx_stuck_timeout_seconds);
        let tx_ids = storage::find_stale_active_tx_ids(&mut conn, TransactionType::Payment, cutoff).await?;
        let mut aborted = 0u32;
        for tx_id in &tx_ids {
            match self
                .payments
                .abort(tx_id, "Recovered stale payment transaction", None, json!({}))
                .await
            {
                Ok(()) => {
                    aborted += 1;
                    self.record_recovery_audit(&mut conn, "payment.stale_tx_abort", tx_id).await;
                }
                Err(e) => warn!(tx_id = %tx_id, error = %e, "failed to abort stale payment transaction"),
            }
        }
        Ok(aborted)
    }

    async fn record_recovery_audit(&self, conn: &mut sqlx::PgConnection, action: &str, tx_id: &str) {
        let _ = AuditLogWriter::record(
            conn,
            None,
            Some("recovery_loop"),
            action,
            Some("transaction"),
            Some(tx_id),
            Some("automatic recovery pass"),
            None,
            None,
            None,
        )
        .await;
    }

    pub async fn run_once(&self) -> LedgerResult<()> {
        let locks = self.cleanup_expired_prepare_locks().await?;
        let stale = self.abort_stale_payment_transactions().await?;
        if locks > 0 || stale > 0 {
            info!(locks, stale, "recovery pass aborted stuck transactions");
        }
        Ok(())
    }

    /// Runs `run_once` immediately, then on every tick of
    /// `recovery_interval_seconds`, until `stop` is set to `true`.
    pub async fn run(self, mut stop: watch::Receiver<bool>) {
        if let Err(e) = self.run_once().await {
            warn!(error = %e, "recovery pass failed");
        }

        let interval = std::time::Duration::from_secs(self.config.recovery_interval_seconds.max(1));
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.run_once().await {
                        warn!(error = %e, "recovery pass failed");
                    }
                }
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        info!("recovery loop stopping");
                        return;
                    }
                }
            }
        }
    }
}
