//! Payment Engine (spec §4.3) — the hard core of two-phase commit over
//! 1..N disjoint routes. `prepare`/`prepareRoutes` reserve segment capacity
//! and accumulate per-participant flow locks; `commit` applies the flows and
//! re-verifies every invariant before finalizing; `abort` releases locks and
//! persists a stable error object. Every public operation runs its whole
//! unit of work — reads, writes, and the final state transition — under the
//! retry wrapper in `retry.rs` (§4.3.5).

use crate::collaborators::{Collaborators, DomainEvent, LedgerEngineConfig};
use crate::error::{ErrorCode, ErrorObject, LedgerError, LedgerResult};
use crate::integrity::IntegrityEngine;
use crate::invariants::InvariantChecker;
use crate::model::{Flow, LockEffects, PrepareLock, Transaction, TransactionState, TransactionType};
use crate::retry::{with_retry, RetryPolicy};
use crate::storage::{self, Storage};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rust_decimal::Decimal;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use sqlx::{Postgres, Transaction as PgTransaction};
use std::collections::{HashMap, VecDeque};
use uuid::Uuid;

/// One route: an ordered path of participant ids plus the amount to push
/// along it, all in a single equivalent's currency.
#[derive(Debug, Clone)]
pub struct PaymentRoute {
    pub path: Vec<Uuid>,
    pub amount: Decimal,
}

/// `createPayment`'s response shape (spec §6 Payment API).
#[derive(Debug, Clone)]
pub struct PaymentOutcome {
    pub tx_id: String,
    pub status: TransactionState,
    pub routes: Vec<PaymentRoute>,
    pub error: Option<ErrorObject>,
}

/// `maxFlow`'s response shape; `paths` is only populated when
/// `full_multipath_enabled` is set (spec §6's feature-flag gate).
#[derive(Debug, Clone)]
pub struct MaxFlowResult {
    pub max_amount: Decimal,
    pub paths: Option<Vec<PaymentRoute>>,
}

/// Caller-supplied proof that `createPayment`'s initiator actually
/// authored the request, checked against the `SignatureVerifier`
/// collaborator against the initiator's own `public_key` (spec §6).
/// Omitting this when a verifier is configured is itself fatal (E005) —
/// the core never assumes a request is pre-authenticated.
#[derive(Debug, Clone)]
pub struct RequestSignature {
    pub signature: String,
}

#[derive(Clone)]
pub struct PaymentEngine {
    storage: Storage,
    config: LedgerEngineConfig,
    collaborators: Collaborators,
}

impl PaymentEngine {
    pub fn new(storage: Storage, config: LedgerEngineConfig, collaborators: Collaborators) -> Self {
        Self {
            storage,
            config,
            collaborators,
        }
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.config.commit_retry_attempts,
            self.config.commit_retry_base_delay_ms,
            self.config.commit_retry_max_delay_ms,
        )
    }

    /// Single-route convenience wrapper over `prepare_routes`.
    pub async fn prepare(&self, tx_id: &str, path: &[Uuid], amount: Decimal, equivalent_id: Uuid) -> LedgerResult<()> {
        self.prepare_routes(tx_id, &[PaymentRoute { path: path.to_vec(), amount }], equivalent_id)
            .await
    }

    /// Idempotency replay lookup (SPEC_FULL §0.1): callers check this before
    /// calling `prepare` so a repeat submission under the same
    /// `(initiator, type, idempotency_key)` can return the prior terminal
    /// transaction instead of re-running the whole protocol.
    pub async fn find_by_idempotency_key(
        &self,
        initiator_id: Uuid,
        tx_type: TransactionType,
        idempotency_key: &str,
    ) -> LedgerResult<Option<Transaction>> {
        let mut conn = self.storage.pool().acquire().await?;
        storage::get_transaction_by_idempotency_key(&mut conn, initiator_id, tx_type, idempotency_key).await
    }

    pub async fn prepare_routes(&self, tx_id: &str, routes: &[PaymentRoute], equivalent_id: Uuid) -> LedgerResult<()> {
        let policy = self.retry_policy();
        with_retry(policy, || self.prepare_routes_once(tx_id, routes, equivalent_id)).await
    }

    async fn prepare_routes_once(&self, tx_id: &str, routes: &[PaymentRoute], equivalent_id: Uuid) -> LedgerResult<()> {
        if routes.is_empty() {
            return Err(LedgerError::Invalid {
                message: "prepareRoutes requires at least one route".into(),
                details: json!({}),
            });
        }
        for route in routes {
            if route.path.len() < 2 {
                return Err(LedgerError::Invalid {
                    message: "route path must have length >= 2".into(),
                    details: json!({ "path": route.path }),
                });
            }
            if route.amount <= Decimal::ZERO {
                return Err(LedgerError::Invalid {
                    message: "route amount must be positive".into(),
                    details: json!({ "amount": route.amount.to_string() }),
                });
            }
        }

        let mut tx = self.storage.begin().await?;

        let transaction = storage::get_transaction(&mut tx, tx_id)
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("transaction {tx_id} not found")))?;

        match transaction.state {
            TransactionState::Committed => return Ok(()),
            TransactionState::Aborted | TransactionState::Rejected => {
                return Err(LedgerError::Conflict(format!(
                    "transaction {tx_id} already {}",
                    transaction.state.as_str()
                )));
            }
            TransactionState::Prepared => {
                let existing = storage::get_prepare_locks_by_tx(&mut tx, tx_id).await?;
                if !existing.is_empty() {
                    return Ok(());
                }
            }
            TransactionState::New | TransactionState::Routed => {}
            other => {
                return Err(LedgerError::Conflict(format!(
                    "transaction {tx_id} is in state {} and cannot be prepared",
                    other.as_str()
                )));
            }
        }

        let mut all_ids: Vec<Uuid> = routes.iter().flat_map(|r| r.path.iter().copied()).collect();
        all_ids.sort();
        all_ids.dedup();
        let participants = storage::get_participants_by_ids(&mut tx, &all_ids).await?;
        if participants.len() != all_ids.len() {
            return Err(LedgerError::Invalid {
                message: "route references an unknown participant".into(),
                details: json!({ "known": participants.len(), "expected": all_ids.len() }),
            });
        }

        // Per-segment requested amount, in first-seen order, plus the flows
        // each sender needs aggregated into their eventual PrepareLock row.
        let mut segment_order: Vec<(Uuid, Uuid)> = Vec::new();
        let mut segment_requested: HashMap<(Uuid, Uuid), Decimal> = HashMap::new();
        let mut flows_by_sender: HashMap<Uuid, Vec<Flow>> = HashMap::new();

        for route in routes {
            for pair in route.path.windows(2) {
                let (from, to) = (pair[0], pair[1]);
                if from == to {
                    return Err(LedgerError::Invalid {
                        message: "route segment cannot be a self-loop".into(),
                        details: json!({ "participant": from }),
                    });
                }
                let key = (from, to);
                if !segment_requested.contains_key(&key) {
                    segment_order.push(key);
                }
                *segment_requested.entry(key).or_insert(Decimal::ZERO) += route.amount;
                flows_by_sender.entry(from).or_default().push(Flow {
                    from,
                    to,
                    amount: route.amount,
                    equivalent: equivalent_id,
                });
            }
        }

        // Deterministic advisory-lock ordering prevents two concurrent
        // prepares from deadlocking on shared bottleneck segments.
        let mut lock_keys: Vec<i64> = segment_order
            .iter()
            .map(|(from, to)| advisory_key(equivalent_id, *from, *to))
            .collect();
        lock_keys.sort_unstable();
        lock_keys.dedup();
        for key in &lock_keys {
            storage::acquire_advisory_xact_lock(&mut tx, *key).await?;
        }

        for (from, to) in &segment_order {
            let requested = segment_requested[&(*from, *to)];
            let trustline = storage::get_active_trustline(&mut tx, *to, *from, equivalent_id).await?;
            let limit = trustline.map(|tl| tl.limit).unwrap_or(Decimal::ZERO);
            let owed_to_sender = storage::get_debt(&mut tx, *to, *from, equivalent_id)
                .await?
                .map(|d| d.amount)
                .unwrap_or(Decimal::ZERO);
            let owed_by_sender = storage::get_debt(&mut tx, *from, *to, equivalent_id)
                .await?
                .map(|d| d.amount)
                .unwrap_or(Decimal::ZERO);
            // Spec §3: capacity = limit(TL R->S) - debt(S->R) + debt(R->S).
            // An existing reverse debt (receiver already owes sender) is
            // unwound by applyFlow's first step before any new forward debt
            // is created, so it adds capacity rather than consuming it.
            let available = limit - owed_by_sender + owed_to_sender;

            let other_locks = storage::get_active_locks_for_participant(&mut tx, *from, tx_id).await?;
            let mut reserved = Decimal::ZERO;
            for lock in &other_locks {
                for flow in &lock.effects.flows {
                    if flow.from == *from && flow.to == *to && flow.equivalent == equivalent_id {
                        reserved += flow.amount;
                    }
                }
            }

            if available < requested + reserved {
                return Err(LedgerError::Routing {
                    message: format!("insufficient capacity on segment {from} -> {to}"),
                    insufficient_capacity: true,
                    details: json!({
                        "from": from,
                        "to": to,
                        "available": available.to_string(),
                        "needed": requested.to_string(),
                        "reserved": reserved.to_string(),
                    }),
                });
            }
        }

        let now = Utc::now();
        let expires_at = now + ChronoDuration::seconds(self.config.prepare_lock_ttl_seconds);
        for (participant_id, flows) in flows_by_sender {
            let lock = PrepareLock {
                id: Uuid::new_v4(),
                tx_id: tx_id.to_string(),
                participant_id,
                effects: LockEffects { flows },
                expires_at,
                created_at: now,
            };
            storage::insert_prepare_lock(&mut tx, &lock).await?;
        }

        storage::update_transaction_state(&mut tx, tx_id, TransactionState::Prepared).await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn commit(&self, tx_id: &str) -> LedgerResult<()> {
        let policy = self.retry_policy();
        with_retry(policy, || self.commit_once(tx_id)).await
    }

    async fn commit_once(&self, tx_id: &str) -> LedgerResult<()> {
        let mut tx = self.storage.begin().await?;

        let transaction = storage::get_transaction(&mut tx, tx_id)
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("transaction {tx_id} not found")))?;

        if transaction.state == TransactionState::Committed {
            return Ok(());
        }
        if transaction.state != TransactionState::Prepared {
            return Err(LedgerError::Conflict(format!(
                "transaction {tx_id} is in state {} and cannot be committed",
                transaction.state.as_str()
            )));
        }

        let locks = storage::get_prepare_locks_by_tx(&mut tx, tx_id).await?;
        if storage::any_lock_expired(&mut tx, tx_id).await? {
            drop(tx);
            let _ = self.abort(tx_id, "Prepare lock expired", None, json!({})).await;
            return Err(LedgerError::Conflict(format!("transaction {tx_id} prepare lock expired")));
        }

        // Malformed flows never reach here: `row_to_prepare_lock` already
        // defaults an undecodable `effects` blob to an empty flow list.
        let mut flows: Vec<Flow> = Vec::new();
        for lock in &locks {
            flows.extend(lock.effects.flows.iter().cloned());
        }

        let mut equivalents: Vec<Uuid> = flows.iter().map(|f| f.equivalent).collect();
        equivalents.sort();
        equivalents.dedup();

        let mut participants_by_eq: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
        for flow in &flows {
            let v = participants_by_eq.entry(flow.equivalent).or_default();
            if !v.contains(&flow.from) {
                v.push(flow.from);
            }
            if !v.contains(&flow.to) {
                v.push(flow.to);
            }
        }

        let mut checksum_before: HashMap<Uuid, String> = HashMap::new();
        for eq in &equivalents {
            checksum_before.insert(*eq, IntegrityEngine::compute_checksum(&mut tx, *eq).await?);
        }

        let mut net_before: HashMap<(Uuid, Uuid), Decimal> = HashMap::new();
        for (eq, pids) in &participants_by_eq {
            for pid in pids {
                let net = InvariantChecker::calculate_net_position(&mut tx, *pid, *eq).await?;
                net_before.insert((*pid, *eq), net);
            }
        }

        for flow in &flows {
            self.apply_flow(&mut tx, flow.from, flow.to, flow.amount, flow.equivalent).await?;
        }

        let invariant_result: LedgerResult<()> = async {
            for eq in &equivalents {
                let pairs: Vec<(Uuid, Uuid)> = flows
                    .iter()
                    .filter(|f| f.equivalent == *eq)
                    .map(|f| (f.from, f.to))
                    .collect();
                InvariantChecker::check_trust_limits(&mut tx, *eq, Some(&pairs)).await?;
                InvariantChecker::check_zero_sum(&mut tx, *eq).await?;
                InvariantChecker::check_debt_symmetry(&mut tx, *eq, Some(&pairs)).await?;
            }
            for ((pid, eq), before) in &net_before {
                let after = InvariantChecker::calculate_net_position(&mut tx, *pid, *eq).await?;
                let expected_delta: Decimal = flows
                    .iter()
                    .filter(|f| f.equivalent == *eq)
                    .map(|f| {
                        if f.from == *pid {
                            -f.amount
                        } else if f.to == *pid {
                            f.amount
                        } else {
                            Decimal::ZERO
                        }
                    })
                    .sum();
                InvariantChecker::check_payment_delta(expected_delta, after - before)?;
            }
            Ok(())
        }
        .await;

        if let Err(e) = invariant_result {
            let error_object = e.to_error_object();
            drop(tx);
            let _ = self
                .abort(tx_id, "invariant violation", Some(error_object.code), error_object.details.clone())
                .await;
            return Err(e);
        }

        let mut checksum_after: HashMap<Uuid, String> = HashMap::new();
        for eq in &equivalents {
            checksum_after.insert(*eq, IntegrityEngine::compute_checksum(&mut tx, *eq).await?);
        }

        for eq in &equivalents {
            let affected = participants_by_eq.get(eq).cloned().unwrap_or_default();
            let equivalent_code = storage::get_equivalent_by_id(&mut tx, *eq)
                .await?
                .map(|e| e.code)
                .unwrap_or_else(|| eq.to_string());
            let invariants_status = IntegrityEngine::evaluate_invariants(&mut tx, *eq).await?;
            // Best-effort: a failed audit write must never fail the commit.
            let _ = IntegrityEngine::record_audit(
                &mut tx,
                "PAYMENT",
                tx_id,
                &equivalent_code,
                checksum_before.get(eq).map(String::as_str).unwrap_or_default(),
                checksum_after.get(eq).map(String::as_str).unwrap_or_default(),
                json!(affected),
                &invariants_status,
                None,
            )
            .await;
        }

        storage::delete_prepare_locks_by_tx(&mut tx, tx_id).await?;
        storage::update_transaction_state(&mut tx, tx_id, TransactionState::Committed).await?;
        tx.commit().await?;

        if let Some(publisher) = &self.collaborators.event_publisher {
            for eq in &equivalents {
                publisher
                    .publish(DomainEvent::PaymentCommitted { tx_id: tx_id.to_string(), equivalent_id: *eq })
                    .await;
            }
        }

        Ok(())
    }

    pub async fn abort(&self, tx_id: &str, reason: &str, error_code: Option<ErrorCode>, details: Value) -> LedgerResult<()> {
        let policy = self.retry_policy();
        with_retry(policy, || self.abort_once(tx_id, reason, error_code, &details)).await
    }

    async fn abort_once(&self, tx_id: &str, reason: &str, error_code: Option<ErrorCode>, details: &Value) -> LedgerResult<()> {
        let mut tx = self.storage.begin().await?;

        let transaction = storage::get_transaction(&mut tx, tx_id)
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("transaction {tx_id} not found")))?;

        // Never transitions COMMITTED -> ABORTED; just clear any stray locks.
        if transaction.state == TransactionState::Committed {
            storage::delete_prepare_locks_by_tx(&mut tx, tx_id).await?;
            tx.commit().await?;
            return Ok(());
        }
        if transaction.state == TransactionState::Aborted {
            return Ok(());
        }

        let code = error_code.unwrap_or(ErrorCode::E010);
        let error = serde_json::to_value(ErrorObject::new(code, reason, details.clone()))?;
        storage::update_transaction_state_and_error(&mut tx, tx_id, TransactionState::Aborted, &error).await?;
        storage::delete_prepare_locks_by_tx(&mut tx, tx_id).await?;
        tx.commit().await?;

        if let Some(publisher) = &self.collaborators.event_publisher {
            publisher
                .publish(DomainEvent::PaymentAborted { tx_id: tx_id.to_string(), error_code: code.to_string() })
                .await;
        }

        Ok(())
    }

    /// §4.3.3: transfer `amount` from `from` to `to` by first unwinding any
    /// pre-existing reverse debt, then growing the forward debt with the
    /// remainder, then netting away any mutual positivity a concurrent
    /// writer introduced. Runs in a savepoint with a bounded retry on
    /// optimistic-lock conflict so the caller's outer transaction survives.
    async fn apply_flow(
        &self,
        tx: &mut PgTransaction<'_, Postgres>,
        from: Uuid,
        to: Uuid,
        amount: Decimal,
        equivalent_id: Uuid,
    ) -> LedgerResult<()> {
        if from == to {
            return Err(LedgerError::Invalid {
                message: "applyFlow cannot target a self-loop".into(),
                details: json!({ "participant": from }),
            });
        }

        let mut attempt = 0u32;
        loop {
            let mut savepoint = tx.begin().await?;
            match apply_flow_once(&mut savepoint, from, to, amount, equivalent_id).await {
                Ok(()) => {
                    savepoint.commit().await?;
                    return Ok(());
                }
                Err(LedgerError::Conflict(msg)) if attempt + 1 < 3 => {
                    attempt += 1;
                    tracing::warn!(attempt, from = %from, to = %to, %msg, "applyFlow optimistic-lock conflict, retrying");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Read-only capacity query for segment `from` -> `to`, matching the
    /// formula `prepare` enforces, minus any other in-flight reservations.
    pub async fn capacity(&self, from: Uuid, to: Uuid, equivalent_id: Uuid) -> LedgerResult<Decimal> {
        let mut conn = self.storage.pool().acquire().await?;
        let trustline = storage::get_active_trustline(&mut conn, to, from, equivalent_id).await?;
        let limit = trustline.map(|tl| tl.limit).unwrap_or(Decimal::ZERO);
        let owed_to_sender = storage::get_debt(&mut conn, to, from, equivalent_id)
            .await?
            .map(|d| d.amount)
            .unwrap_or(Decimal::ZERO);
        let owed_by_sender = storage::get_debt(&mut conn, from, to, equivalent_id)
            .await?
            .map(|d| d.amount)
            .unwrap_or(Decimal::ZERO);
        Ok(limit - owed_by_sender + owed_to_sender)
    }

    /// `createPayment` (spec §6): inserts the transaction record, resolves
    /// routes (caller-supplied, or failing that via the `Router`
    /// collaborator), then drives prepare -> commit. Idempotent resubmission
    /// under the same `tx_id`/`idempotency_key` returns the prior terminal
    /// state instead of re-running the protocol (SPEC_FULL §0.1).
    pub async fn create_payment(
        &self,
        initiator_id: Uuid,
        to: Uuid,
        equivalent_id: Uuid,
        amount: Decimal,
        tx_id: &str,
        idempotency_key: Option<&str>,
        routes: Option<Vec<PaymentRoute>>,
        signature: Option<RequestSignature>,
    ) -> LedgerResult<PaymentOutcome> {
        let payload = json!({
            "to": to.to_string(),
            "equivalent": equivalent_id.to_string(),
            "amount": amount.to_string(),
        });

        if let Some(verifier) = &self.collaborators.signature_verifier {
            let Some(signature) = &signature else {
                return Err(LedgerError::InvalidSignature(
                    "a signature verifier is configured but the request carried none".to_string(),
                ));
            };
            let mut conn = self.storage.pool().acquire().await?;
            let initiator = storage::get_participants_by_ids(&mut conn, &[initiator_id])
                .await?
                .into_iter()
                .next()
                .ok_or_else(|| LedgerError::NotFound(format!("participant {initiator_id} not found")))?;
            verifier
                .verify(&initiator.public_key, &payload, &signature.signature)
                .await?;
        }

        let signatures: Vec<Value> = signature
            .map(|s| json!({ "signature": s.signature }))
            .into_iter()
            .collect();

        if let Some(key) = idempotency_key {
            if let Some(existing) = self
                .find_by_idempotency_key(initiator_id, TransactionType::Payment, key)
                .await?
            {
                return match existing.check_idempotent_replay(&payload) {
                    crate::model::ReplayOutcome::IdenticalReplay => {
                        Ok(self.outcome_from_transaction(existing))
                    }
                    crate::model::ReplayOutcome::ConflictingReplay => Err(LedgerError::Conflict(format!(
                        "idempotency key {key} already used with a different payload"
                    ))),
                };
            }
        }

        let routes = match routes {
            Some(routes) if !routes.is_empty() => routes,
            _ => match &self.collaborators.router {
                Some(router) => router
                    .find_routes(
                        initiator_id,
                        to,
                        equivalent_id,
                        amount,
                        self.config.routing_max_hops,
                        self.config.routing_max_paths,
                    )
                    .await?
                    .into_iter()
                    .map(|r| PaymentRoute { path: r.path, amount: r.amount })
                    .collect(),
                None => Vec::new(),
            },
        };

        let rejection = if routes.is_empty() {
            Some(ErrorObject::new(ErrorCode::E001, "no route available", json!({})))
        } else if routes.len() > 1 && !self.config.multipath_enabled {
            Some(ErrorObject::new(
                ErrorCode::E009,
                "multipath payments are disabled for this ledger",
                json!({ "route_count": routes.len() }),
            ))
        } else {
            None
        };

        if let Some(error) = rejection {
            let transaction = Transaction {
                id: Uuid::new_v4(),
                tx_id: tx_id.to_string(),
                idempotency_key: idempotency_key.map(str::to_string),
                tx_type: TransactionType::Payment,
                initiator_id,
                payload,
                signatures: signatures.clone(),
                state: TransactionState::Rejected,
                error: Some(serde_json::to_value(&error)?),
                created_at: Utc::now(),
                updated_at: Utc::now(),
            };
            let mut tx = self.storage.begin().await?;
            storage::insert_transaction(&mut tx, &transaction).await?;
            storage::update_transaction_state_and_error(
                &mut tx,
                tx_id,
                TransactionState::Rejected,
                transaction.error.as_ref().unwrap(),
            )
            .await?;
            tx.commit().await?;
            return Ok(PaymentOutcome {
                tx_id: tx_id.to_string(),
                status: TransactionState::Rejected,
                routes: Vec::new(),
                error: Some(error),
            });
        }

        let transaction = Transaction {
            id: Uuid::new_v4(),
            tx_id: tx_id.to_string(),
            idempotency_key: idempotency_key.map(str::to_string),
            tx_type: TransactionType::Payment,
            initiator_id,
            payload,
            signatures,
            state: TransactionState::New,
            error: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        {
            let mut tx = self.storage.begin().await?;
            storage::insert_transaction(&mut tx, &transaction).await?;
            tx.commit().await?;
        }

        let result = async {
            self.prepare_routes(tx_id, &routes, equivalent_id).await?;
            self.commit(tx_id).await
        }
        .await;

        // prepare/commit already abort on any failure they detect themselves
        // (§4.3.1 capacity, §4.3.2 invariants); a failure caught before any
        // state mutation (e.g. input validation) leaves the row active, so
        // make sure it still lands on a terminal ABORTED state here.
        if let Err(e) = &result {
            let _ = self
                .abort(tx_id, "createPayment failed", Some(e.code()), e.to_error_object().details)
                .await;
        }

        let final_tx = self
            .get_payment(tx_id)
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("transaction {tx_id} vanished after commit")))?;

        let mut outcome = self.outcome_from_transaction(final_tx);
        if result.is_ok() {
            outcome.routes = routes;
        }
        Ok(outcome)
    }

    fn outcome_from_transaction(&self, transaction: Transaction) -> PaymentOutcome {
        let error = transaction
            .error
            .as_ref()
            .and_then(|v| serde_json::from_value::<ErrorObject>(v.clone()).ok());
        PaymentOutcome {
            tx_id: transaction.tx_id,
            status: transaction.state,
            routes: Vec::new(),
            error,
        }
    }

    /// `getPayment` (spec §6): the current transaction row, unmapped beyond
    /// what `Transaction` already carries (the HTTP facade owns the
    /// outward-facing response shape; the core exposes the row itself).
    pub async fn get_payment(&self, tx_id: &str) -> LedgerResult<Option<Transaction>> {
        let mut conn = self.storage.pool().acquire().await?;
        storage::get_transaction(&mut conn, tx_id).await
    }

    /// `listPayments` (spec §6): sent/received PAYMENT history for a
    /// participant, optionally scoped by equivalent and a lower bound on
    /// `created_at`, paginated by `(limit, offset)`.
    pub async fn list_payments(
        &self,
        participant_id: Uuid,
        sent: bool,
        equivalent_code: Option<&str>,
        from_date: Option<DateTime<Utc>>,
        limit: i64,
        offset: i64,
    ) -> LedgerResult<Vec<Transaction>> {
        let mut conn = self.storage.pool().acquire().await?;
        storage::list_payment_transactions(&mut conn, participant_id, sent, equivalent_code, from_date, limit, offset)
            .await
    }

    /// `maxFlow` (spec §6): Edmonds-Karp augmenting-path max flow over the
    /// trustline/debt capacity graph for one equivalent, bounded to
    /// `routing_max_hops` per path. Path metadata is only returned when
    /// `full_multipath_enabled` is set.
    pub async fn max_flow(&self, from: Uuid, to: Uuid, equivalent_id: Uuid) -> LedgerResult<MaxFlowResult> {
        let mut conn = self.storage.pool().acquire().await?;

        let trustlines = storage::get_all_active_trustlines_for_equivalent(&mut conn, equivalent_id).await?;
        let locks = storage::get_all_active_locks(&mut conn).await?;

        let mut reserved: HashMap<(Uuid, Uuid), Decimal> = HashMap::new();
        for lock in &locks {
            for flow in &lock.effects.flows {
                if flow.equivalent == equivalent_id {
                    *reserved.entry((flow.from, flow.to)).or_insert(Decimal::ZERO) += flow.amount;
                }
            }
        }

        // A directed edge sender -> receiver exists wherever the receiver
        // has granted the sender trust (TrustLine receiver -> sender), per
        // the same capacity formula `prepare` enforces.
        let mut capacity: HashMap<(Uuid, Uuid), Decimal> = HashMap::new();
        for tl in &trustlines {
            let (receiver, sender) = (tl.from_participant_id, tl.to_participant_id);
            let owed_to_sender = storage::get_debt(&mut conn, receiver, sender, equivalent_id)
                .await?
                .map(|d| d.amount)
                .unwrap_or(Decimal::ZERO);
            let owed_by_sender = storage::get_debt(&mut conn, sender, receiver, equivalent_id)
                .await?
                .map(|d| d.amount)
                .unwrap_or(Decimal::ZERO);
            let already_reserved = reserved.get(&(sender, receiver)).copied().unwrap_or(Decimal::ZERO);
            let available = (tl.limit - owed_by_sender + owed_to_sender - already_reserved).max(Decimal::ZERO);
            if available > Decimal::ZERO {
                capacity.insert((sender, receiver), available);
            }
        }

        let max_hops = self.config.routing_max_hops as usize;
        let mut total = Decimal::ZERO;
        let mut paths: Vec<PaymentRoute> = Vec::new();

        loop {
            let Some(path) = bfs_augmenting_path(&capacity, from, to, max_hops) else {
                break;
            };
            let bottleneck = path
                .windows(2)
                .map(|pair| capacity.get(&(pair[0], pair[1])).copied().unwrap_or(Decimal::ZERO))
                .min()
                .unwrap_or(Decimal::ZERO);
            if bottleneck <= Decimal::ZERO {
                break;
            }
            for pair in path.windows(2) {
                let key = (pair[0], pair[1]);
                let remaining = capacity.get(&key).copied().unwrap_or(Decimal::ZERO) - bottleneck;
                if remaining <= Decimal::ZERO {
                    capacity.remove(&key);
                } else {
                    capacity.insert(key, remaining);
                }
            }
            total += bottleneck;
            paths.push(PaymentRoute { path, amount: bottleneck });
        }

        Ok(MaxFlowResult {
            max_amount: total,
            paths: if self.config.full_multipath_enabled { Some(paths) } else { None },
        })
    }
}

/// Plain BFS over the residual capacity graph, bounded to `max_hops` edges;
/// returns the first `from -> to` path found (Edmonds-Karp's augmenting-path
/// step).
fn bfs_augmenting_path(
    capacity: &HashMap<(Uuid, Uuid), Decimal>,
    from: Uuid,
    to: Uuid,
    max_hops: usize,
) -> Option<Vec<Uuid>> {
    let mut adjacency: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
    for (s, r) in capacity.keys() {
        adjacency.entry(*s).or_default().push(*r);
    }

    let mut queue: VecDeque<Uuid> = VecDeque::new();
    let mut visited: HashMap<Uuid, Uuid> = HashMap::new();
    let mut depth: HashMap<Uuid, usize> = HashMap::new();
    queue.push_back(from);
    depth.insert(from, 0);

    while let Some(node) = queue.pop_front() {
        if node == to {
            let mut path = vec![to];
            let mut cur = to;
            while cur != from {
                cur = visited[&cur];
                path.push(cur);
            }
            path.reverse();
            return Some(path);
        }
        let d = depth[&node];
        if d >= max_hops {
            continue;
        }
        if let Some(neighbors) = adjacency.get(&node) {
            for &next in neighbors {
                if !depth.contains_key(&next) {
                    depth.insert(next, d + 1);
                    visited.insert(next, node);
                    queue.push_back(next);
                }
            }
        }
    }
    None
}

async fn apply_flow_once(
    tx: &mut PgTransaction<'_, Postgres>,
    from: Uuid,
    to: Uuid,
    amount: Decimal,
    equivalent_id: Uuid,
) -> LedgerResult<()> {
    let mut remaining = amount;

    if let Some(d_rs) = storage::get_debt_for_update(tx, to, from, equivalent_id).await? {
        if d_rs.amount > Decimal::ZERO {
            let k = remaining.min(d_rs.amount);
            let new_amount = d_rs.amount - k;
            if new_amount <= Decimal::ZERO {
                storage::delete_debt(tx, d_rs.id).await?;
            } else {
                let affected = storage::set_debt_amount(tx, d_rs.id, new_amount, d_rs.version).await?;
                if affected == 0 {
                    return Err(LedgerError::Conflict(format!("optimistic lock conflict on debt {}", d_rs.id)));
                }
            }
            remaining -= k;
        }
    }

    if remaining > Decimal::ZERO {
        storage::upsert_debt_delta(tx, from, to, equivalent_id, remaining).await?;
    }

    // Concurrent writers can leave both directions positive; net them away.
    let d_sr = storage::get_debt_for_update(tx, from, to, equivalent_id).await?;
    let d_rs = storage::get_debt_for_update(tx, to, from, equivalent_id).await?;
    if let (Some(d_sr), Some(d_rs)) = (d_sr, d_rs) {
        if d_sr.amount > Decimal::ZERO && d_rs.amount > Decimal::ZERO {
            let net = d_sr.amount.min(d_rs.amount);
            settle_half(tx, &d_sr, d_sr.amount - net).await?;
            settle_half(tx, &d_rs, d_rs.amount - net).await?;
        }
    }

    Ok(())
}

async fn settle_half(tx: &mut PgTransaction<'_, Postgres>, debt: &crate::model::Debt, remainder: Decimal) -> LedgerResult<()> {
    if remainder <= Decimal::ZERO {
        storage::delete_debt(tx, debt.id).await?;
    } else {
        let affected = storage::set_debt_amount(tx, debt.id, remainder, debt.version).await?;
        if affected == 0 {
            return Err(LedgerError::Conflict(format!("optimistic lock conflict on debt {}", debt.id)));
        }
    }
    Ok(())
}

/// Deterministic 64-bit signed advisory-lock key for a directed segment,
/// used to serialize prepares that share a bottleneck edge (§4.3.1). Built
/// from the leading 8 bytes of a SHA-256 over the concatenated id bytes so
/// the key is stable across processes and releases, unlike `DefaultHasher`.
fn advisory_key(equivalent_id: Uuid, from: Uuid, to: Uuid) -> i64 {
    let mut hasher = Sha256::new();
    hasher.update(equivalent_id.as_bytes());
    hasher.update(from.as_bytes());
    hasher.update(to.as_bytes());
    let digest = hasher.finalize();
    i64::from_be_bytes(digest[..8].try_into().expect("sha256 digest is at least 8 bytes"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advisory_key_is_deterministic_and_direction_sensitive() {
        let eq = Uuid::new_v4();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert_eq!(advisory_key(eq, a, b), advisory_key(eq, a, b));
        assert_ne!(advisory_key(eq, a, b), advisory_key(eq, b, a));
    }

    #[test]
    fn bfs_finds_shortest_augmenting_path_within_hop_bound() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();
        let d = Uuid::new_v4();
        let mut capacity = HashMap::new();
        capacity.insert((a, b), Decimal::from(10));
        capacity.insert((b, d), Decimal::from(10));
        capacity.insert((a, c), Decimal::from(5));
        capacity.insert((c, d), Decimal::from(5));

        let path = bfs_augmenting_path(&capacity, a, d, 4).expect("a path should exist");
        assert_eq!(path.first(), Some(&a));
        assert_eq!(path.last(), Some(&d));
        assert_eq!(path.len(), 3);
    }

    #[test]
    fn bfs_respects_max_hops() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();
        let mut capacity = HashMap::new();
        capacity.insert((a, b), Decimal::from(10));
        capacity.insert((b, c), Decimal::from(10));

        assert!(bfs_augmenting_path(&capacity, a, c, 1).is_none());
        assert!(bfs_augmenting_path(&capacity, a, c, 2).is_some());
    }
}
