//! Clearing Engine (spec §4.4): discover closed debt cycles and execute
//! them atomically, leaving every cycle participant's net position exactly
//! unchanged. Set-based SQL self-joins do the common case; a bounded
//! in-memory depth-first search is the fallback when they find nothing.

use crate::collaborators::{Collaborators, DomainEvent, LedgerEngineConfig};
use crate::error::{LedgerError, LedgerResult};
use crate::integrity::IntegrityEngine;
use crate::invariants::InvariantChecker;
use crate::model::{Debt, Transaction, TransactionState, TransactionType};
use crate::retry::{with_retry, RetryPolicy};
use crate::storage::{self, Storage};
use chrono::{Duration as ChronoDuration, Utc};
use rust_decimal::Decimal;
use serde_json::json;
use sqlx::PgConnection;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// A closed walk of positive debts, each edge's creditor the next edge's
/// debtor, the last edge's creditor equal to the first edge's debtor.
#[derive(Debug, Clone)]
pub struct Cycle {
    pub edges: Vec<Debt>,
}

#[derive(Clone)]
pub struct ClearingEngine {
    storage: Storage,
    config: LedgerEngineConfig,
    collaborators: Collaborators,
}

impl ClearingEngine {
    pub fn new(storage: Storage, config: LedgerEngineConfig, collaborators: Collaborators) -> Self {
        Self {
            storage,
            config,
            collaborators,
        }
    }

    pub async fn find_cycles(&self, equivalent_id: Uuid, max_depth: u32) -> LedgerResult<Vec<Cycle>> {
        let mut conn = self.storage.pool().acquire().await?;

        let locked_pairs = locked_pairs(&mut conn).await?;
        let mut cycles: Vec<Cycle> = Vec::new();
        let mut seen: HashSet<Vec<Uuid>> = HashSet::new();

        if max_depth >= 3 {
            let raw = storage::find_cycles_depth3(&mut conn, equivalent_id).await?;
            self.admit_set_based_cycles(&mut conn, raw, &locked_pairs, &mut cycles, &mut seen).await?;
        }
        if max_depth >= 4 {
            let raw = storage::find_cycles_depth4(&mut conn, equivalent_id).await?;
            self.admit_set_based_cycles(&mut conn, raw, &locked_pairs, &mut cycles, &mut seen).await?;
        }

        if cycles.is_empty() {
            let debts = storage::get_all_debts_for_equivalent(&mut conn, equivalent_id).await?;
            let trustlines = storage::get_all_active_trustlines_for_equivalent(&mut conn, equivalent_id).await?;
            let mut policy_allows: HashMap<(Uuid, Uuid), bool> = HashMap::new();
            for tl in &trustlines {
                policy_allows.insert((tl.from_participant_id, tl.to_participant_id), tl.policy.auto_clearing);
            }
            let raw = dfs_find_cycles(&debts, &policy_allows, &locked_pairs, max_depth as usize, 10);
            for edges in raw {
                let mut ids: Vec<Uuid> = edges.iter().map(|e| e.id).collect();
                ids.sort();
                if seen.insert(ids) {
                    cycles.push(Cycle { edges });
                }
            }
        }

        Ok(cycles)
    }

    /// Applies the shared admission rules (not locked, controlling
    /// trustline active with `auto_clearing`) and dedupes by sorted debt id
    /// to a SQL-discovered batch of raw cycle edges.
    async fn admit_set_based_cycles(
        &self,
        conn: &mut PgConnection,
        raw: Vec<Vec<Debt>>,
        locked_pairs: &HashSet<(Uuid, Uuid)>,
        cycles: &mut Vec<Cycle>,
        seen: &mut HashSet<Vec<Uuid>>,
    ) -> LedgerResult<()> {
        'cycles: for edges in raw {
            let mut ids: Vec<Uuid> = edges.iter().map(|e| e.id).collect();
            ids.sort();
            if seen.contains(&ids) {
                continue;
            }
            for edge in &edges {
                let pair = (edge.debtor_id.min(edge.creditor_id), edge.debtor_id.max(edge.creditor_id));
                if locked_pairs.contains(&pair) {
                    continue 'cycles;
                }
                let trustline = storage::get_active_trustline(conn, edge.creditor_id, edge.debtor_id, edge.equivalent_id).await?;
                match trustline {
                    Some(tl) if tl.policy.auto_clearing => {}
                    _ => continue 'cycles,
                }
            }
            seen.insert(ids);
            cycles.push(Cycle { edges });
        }
        Ok(())
    }

    pub async fn execute_clearing(&self, cycle: &Cycle) -> LedgerResult<()> {
        let policy = RetryPolicy::new(
            self.config.commit_retry_attempts,
            self.config.commit_retry_base_delay_ms,
            self.config.commit_retry_max_delay_ms,
        );
        with_retry(policy, || self.execute_clearing_once(cycle)).await
    }

    async fn execute_clearing_once(&self, cycle: &Cycle) -> LedgerResult<()> {
        let mut tx = self.storage.begin().await?;

        let ids: Vec<Uuid> = cycle.edges.iter().map(|e| e.id).collect();
        let current = storage::get_debts_for_update_by_ids(&mut tx, &ids).await?;
        if current.len() != ids.len() {
            return Err(LedgerError::Conflict("clearing cycle edge no longer exists".into()));
        }

        let min_recorded = cycle.edges.iter().map(|e| e.amount).min().unwrap_or(Decimal::ZERO);
        let clear_amount = current.iter().map(|d| d.amount).min().unwrap_or(Decimal::ZERO);
        if clear_amount < min_recorded {
            return Err(LedgerError::Conflict("clearing cycle amount dropped below its discovery minimum".into()));
        }

        let equivalent_id = current[0].equivalent_id;
        for debt in &current {
            let trustline = storage::get_active_trustline(&mut tx, debt.creditor_id, debt.debtor_id, debt.equivalent_id).await?;
            match trustline {
                Some(tl) if tl.policy.auto_clearing => {}
                _ => return Err(LedgerError::Conflict("clearing edge no longer permits auto-clearing".into())),
            }
        }
        let locked = locked_pairs(&mut tx).await?;
        for debt in &current {
            let pair = (debt.debtor_id.min(debt.creditor_id), debt.debtor_id.max(debt.creditor_id));
            if locked.contains(&pair) {
                return Err(LedgerError::Conflict("clearing edge is reserved by an active prepare lock".into()));
            }
        }

        let mut participants: Vec<Uuid> = current.iter().flat_map(|d| [d.debtor_id, d.creditor_id]).collect();
        participants.sort();
        participants.dedup();
        let mut net_before = Vec::with_capacity(participants.len());
        for p in &participants {
            net_before.push((*p, InvariantChecker::calculate_net_position(&mut tx, *p, equivalent_id).await?));
        }

        let tx_id = format!("clr-{}", Uuid::new_v4());
        let payload = json!({
            "equivalent": equivalent_id,
            "amount": clear_amount.to_string(),
            "edges": current.iter().map(|d| json!({
                "debt_id": d.id, "debtor": d.debtor_id, "creditor": d.creditor_id, "amount": d.amount.to_string(),
            })).collect::<Vec<_>>(),
            "cycle": participants,
        });
        let transaction = Transaction {
            id: Uuid::new_v4(),
            tx_id: tx_id.clone(),
            idempotency_key: None,
            tx_type: TransactionType::Clearing,
            initiator_id: current[0].creditor_id,
            payload,
            signatures: Vec::new(),
            state: TransactionState::New,
            error: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        storage::insert_transaction(&mut tx, &transaction).await?;

        let checksum_before = IntegrityEngine::compute_checksum(&mut tx, equivalent_id).await?;

        for debt in &current {
            let new_amount = debt.amount - clear_amount;
            if new_amount <= Decimal::ZERO {
                storage::delete_debt(&mut tx, debt.id).await?;
            } else {
                let affected = storage::set_debt_amount(&mut tx, debt.id, new_amount, debt.version).await?;
                if affected == 0 {
                    return Err(LedgerError::Conflict(format!("optimistic lock conflict on debt {}", debt.id)));
                }
            }
        }

        let mut net_after = Vec::with_capacity(participants.len());
        for p in &participants {
            net_after.push((*p, InvariantChecker::calculate_net_position(&mut tx, *p, equivalent_id).await?));
        }
        InvariantChecker::verify_clearing_neutrality(&net_before, &net_after)?;

        let checksum_after = IntegrityEngine::compute_checksum(&mut tx, equivalent_id).await?;
        let invariants_status = IntegrityEngine::evaluate_invariants(&mut tx, equivalent_id).await?;
        let equivalent_code = storage::get_equivalent_by_id(&mut tx, equivalent_id)
            .await?
            .map(|e| e.code)
            .unwrap_or_else(|| equivalent_id.to_string());
        let _ = IntegrityEngine::record_audit(
            &mut tx,
            "CLEARING",
            &tx_id,
            &equivalent_code,
            &checksum_before,
            &checksum_after,
            json!(participants),
            &invariants_status,
            None,
        )
        .await;

        storage::update_transaction_state(&mut tx, &tx_id, TransactionState::Committed).await?;
        tx.commit().await?;

        if let Some(publisher) = &self.collaborators.event_publisher {
            publisher
                .publish(DomainEvent::ClearingExecuted {
                    tx_id,
                    equivalent_id,
                    cleared_edges: current.len() as u32,
                })
                .await;
        }

        Ok(())
    }

    /// Repeats cycle discovery + execution until an iteration finds nothing
    /// or every candidate fails, bounded by `clearing_auto_clear_ceiling`.
    /// Serialized across processes via `dlock:clearing:<equivalent>` when a
    /// distributed lock provider is configured (spec §5).
    pub async fn auto_clear(&self, equivalent_id: Uuid, max_depth: u32) -> LedgerResult<u32> {
        if !self.config.clearing_enabled {
            return Ok(0);
        }

        let lock_key = format!("dlock:clearing:{equivalent_id}");
        let token = match &self.collaborators.distributed_lock {
            Some(provider) => {
                match provider
                    .acquire(&lock_key, ChronoDuration::seconds(30), ChronoDuration::seconds(5))
                    .await?
                {
                    Some(token) => Some(token),
                    None => return Ok(0),
                }
            }
            None => None,
        };

        let result = self.auto_clear_locked(equivalent_id, max_depth).await;

        if let (Some(provider), Some(token)) = (&self.collaborators.distributed_lock, token) {
            let _ = provider.release(token).await;
        }

        result
    }

    async fn auto_clear_locked(&self, equivalent_id: Uuid, max_depth: u32) -> LedgerResult<u32> {
        let mut cleared = 0u32;
        loop {
            if cleared >= self.config.clearing_auto_clear_ceiling {
                break;
            }
            let cycles = self.find_cycles(equivalent_id, max_depth).await?;
            if cycles.is_empty() {
                break;
            }
            let mut progressed = false;
            for cycle in &cycles {
                if cleared >= self.config.clearing_auto_clear_ceiling {
                    break;
                }
                if self.execute_clearing(cycle).await.is_ok() {
                    cleared += 1;
                    progressed = true;
                }
            }
            if !progressed {
                break;
            }
        }
        Ok(cleared)
    }
}

async fn locked_pairs(conn: &mut PgConnection) -> LedgerResult<HashSet<(Uuid, Uuid)>> {
    let active_locks = storage::get_all_active_locks(conn).await?;
    let mut pairs = HashSet::new();
    for lock in &active_locks {
        for flow in &lock.effects.flows {
            pairs.insert((flow.from.min(flow.to), flow.from.max(flow.to)));
        }
    }
    Ok(pairs)
}

/// Bounded DFS fallback (§4.4 step 6): explores the in-memory debt
/// adjacency from every node, stopping at `cap` discovered cycles.
fn dfs_find_cycles(
    debts: &[Debt],
    policy_allows: &HashMap<(Uuid, Uuid), bool>,
    locked_pairs: &HashSet<(Uuid, Uuid)>,
    max_depth: usize,
    cap: usize,
) -> Vec<Vec<Debt>> {
    let mut adjacency: HashMap<Uuid, Vec<&Debt>> = HashMap::new();
    for d in debts {
        adjacency.entry(d.debtor_id).or_default().push(d);
    }

    let mut start_nodes: Vec<Uuid> = debts.iter().map(|d| d.debtor_id).collect();
    start_nodes.sort();
    start_nodes.dedup();

    let mut found: Vec<Vec<Debt>> = Vec::new();
    let mut seen: HashSet<Vec<Uuid>> = HashSet::new();

    for start in start_nodes {
        if found.len() >= cap {
            break;
        }
        let mut path: Vec<&Debt> = Vec::new();
        let mut visited: HashSet<Uuid> = HashSet::new();
        visited.insert(start);
        dfs_step(
            start,
            start,
            &adjacency,
            policy_allows,
            locked_pairs,
            max_depth,
            &mut path,
            &mut visited,
            &mut found,
            &mut seen,
            cap,
        );
    }

    found
}

#[allow(clippy::too_many_arguments)]
fn dfs_step<'a>(
    start: Uuid,
    current: Uuid,
    adjacency: &HashMap<Uuid, Vec<&'a Debt>>,
    policy_allows: &HashMap<(Uuid, Uuid), bool>,
    locked_pairs: &HashSet<(Uuid, Uuid)>,
    max_depth: usize,
    path: &mut Vec<&'a Debt>,
    visited: &mut HashSet<Uuid>,
    found: &mut Vec<Vec<Debt>>,
    seen: &mut HashSet<Vec<Uuid>>,
    cap: usize,
) {
    if found.len() >= cap || path.len() >= max_depth {
        return;
    }
    let Some(edges) = adjacency.get(&current) else {
        return;
    };
    for edge in edges {
        let pair = (edge.debtor_id.min(edge.creditor_id), edge.debtor_id.max(edge.creditor_id));
        if locked_pairs.contains(&pair) {
            continue;
        }
        if !policy_allows.get(&(edge.creditor_id, edge.debtor_id)).copied().unwrap_or(false) {
            continue;
        }
        if edge.creditor_id == start && path.len() + 1 >= 3 {
            let mut cycle = path.clone();
            cycle.push(edge);
            let mut ids: Vec<Uuid> = cycle.iter().map(|d| d.id).collect();
            ids.sort();
            if seen.insert(ids) {
                found.push(cycle.into_iter().cloned().collect());
                if found.len() >= cap {
                    return;
                }
            }
            continue;
        }
        if visited.contains(&edge.creditor_id) {
            continue;
        }
        path.push(edge);
        visited.insert(edge.creditor_id);
        dfs_step(
            start,
            edge.creditor_id,
            adjacency,
            policy_allows,
            locked_pairs,
            max_depth,
            path,
            visited,
            found,
            seen,
            cap,
        );
        visited.remove(&edge.creditor_id);
        path.pop();
        if found.len() >= cap {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn debt(debtor: Uuid, creditor: Uuid, amount: i64) -> Debt {
        Debt {
            id: Uuid::new_v4(),
            debtor_id: debtor,
            creditor_id: creditor,
            equivalent_id: Uuid::new_v4(),
            amount: Decimal::from(amount),
            version: 0,
        }
    }

    #[test]
    fn dfs_finds_a_simple_triangle() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();
        let debts = vec![debt(a, b, 10), debt(b, c, 10), debt(c, a, 10)];
        let mut allows = HashMap::new();
        allows.insert((b, a), true);
        allows.insert((c, b), true);
        allows.insert((a, c), true);
        let cycles = dfs_find_cycles(&debts, &allows, &HashSet::new(), 4, 10);
        assert_eq!(cycles.len(), 1);
        assert_eq!(cycles[0].len(), 3);
    }

    #[test]
    fn dfs_rejects_edges_without_auto_clearing_policy() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();
        let debts = vec![debt(a, b, 10), debt(b, c, 10), debt(c, a, 10)];
        let allows = HashMap::new();
        let cycles = dfs_find_cycles(&debts, &allows, &HashSet::new(), 4, 10);
        assert!(cycles.is_empty());
    }
}
