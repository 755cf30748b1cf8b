//! Relational persistence (spec §3). Raw `sqlx::query`/`query_as` against
//! PostgreSQL, manual `Row::try_get` decoding, schema bootstrap via
//! `CREATE TABLE IF NOT EXISTS` — the idiom the grounding crate's
//! `PostgresLedgerStore` establishes for its single append-only table,
//! generalized here to the full six-entity-plus-audit schema.

use crate::error::{LedgerError, LedgerResult};
use crate::model::*;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgConnection, PgPool, Postgres, Row, Transaction as PgTransaction};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct LedgerStorageConfig {
    pub database_url: String,
    pub max_connections: u32,
}

impl LedgerStorageConfig {
    pub fn new(database_url: impl Into<String>, max_connections: u32) -> Self {
        Self {
            database_url: database_url.into(),
            max_connections,
        }
    }
}

/// Owns the connection pool and schema lifecycle for the ledger store.
#[derive(Clone)]
pub struct Storage {
    pool: PgPool,
}

impl Storage {
    pub async fn connect(config: &LedgerStorageConfig) -> LedgerResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn begin(&self) -> LedgerResult<PgTransaction<'static, Postgres>> {
        Ok(self.pool.begin().await?)
    }

    /// Idempotent schema bootstrap; safe to call on every process start,
    /// mirroring the grounding crate's `ensure_schema()`.
    pub async fn ensure_schema(&self) -> LedgerResult<()> {
        let mut conn = self.pool.acquire().await?;
        ensure_schema(&mut conn).await
    }
}

pub async fn ensure_schema(conn: &mut PgConnection) -> LedgerResult<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS equivalents (
            id UUID PRIMARY KEY,
            code VARCHAR(16) NOT NULL UNIQUE,
            symbol VARCHAR(16),
            description TEXT,
            precision SMALLINT NOT NULL DEFAULT 2,
            is_active BOOLEAN NOT NULL DEFAULT TRUE,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            CONSTRAINT chk_equivalents_code_upper CHECK (code = upper(code))
        )
        "#,
    )
    .execute(&mut *conn)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS participants (
            id UUID PRIMARY KEY,
            pid VARCHAR(64) NOT NULL UNIQUE,
            display_name VARCHAR(255) NOT NULL,
            public_key VARCHAR(64) NOT NULL UNIQUE,
            type VARCHAR(20) NOT NULL DEFAULT 'person',
            status VARCHAR(20) NOT NULL DEFAULT 'active',
            verification_level SMALLINT NOT NULL DEFAULT 0,
            profile JSONB,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            CONSTRAINT chk_participant_type CHECK (type IN ('person', 'business', 'hub')),
            CONSTRAINT chk_participant_status CHECK (status IN ('active', 'suspended', 'left', 'deleted'))
        )
        "#,
    )
    .execute(&mut *conn)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS trust_lines (
            id UUID PRIMARY KEY,
            from_participant_id UUID NOT NULL REFERENCES participants(id) ON DELETE CASCADE,
            to_participant_id UUID NOT NULL REFERENCES participants(id) ON DELETE CASCADE,
            equivalent_id UUID NOT NULL REFERENCES equivalents(id) ON DELETE CASCADE,
            "limit" NUMERIC(20, 8) NOT NULL,
            policy JSONB,
            status VARCHAR(20) NOT NULL DEFAULT 'active',
            created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            CONSTRAINT uq_trust_lines_from_to_equivalent UNIQUE (from_participant_id, to_participant_id, equivalent_id),
            CONSTRAINT chk_trust_line_status CHECK (status IN ('active', 'frozen', 'closed')),
            CONSTRAINT chk_trust_line_limit_positive CHECK ("limit" >= 0),
            CONSTRAINT chk_trust_line_no_self_loop CHECK (from_participant_id != to_participant_id)
        )
        "#,
    )
    .execute(&mut *conn)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS ix_trust_lines_from_status ON trust_lines (from_participant_id, status)")
        .execute(&mut *conn)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS debts (
            id UUID PRIMARY KEY,
            debtor_id UUID NOT NULL REFERENCES participants(id) ON DELETE CASCADE,
            creditor_id UUID NOT NULL REFERENCES participants(id) ON DELETE CASCADE,
            equivalent_id UUID NOT NULL REFERENCES equivalents(id) ON DELETE CASCADE,
            amount NUMERIC(20, 8) NOT NULL,
            version INTEGER NOT NULL DEFAULT 0,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            CONSTRAINT uq_debts_debtor_creditor_equivalent UNIQUE (debtor_id, creditor_id, equivalent_id),
            CONSTRAINT chk_debt_amount_positive CHECK (amount >= 0),
            CONSTRAINT chk_debt_no_self_loop CHECK (debtor_id != creditor_id)
        )
        "#,
    )
    .execute(&mut *conn)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS ix_debts_debtor_creditor ON debts (debtor_id, creditor_id)")
        .execute(&mut *conn)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS ix_debts_equivalent ON debts (equivalent_id)")
        .execute(&mut *conn)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS transactions (
            id UUID PRIMARY KEY,
            tx_id VARCHAR(64) NOT NULL UNIQUE,
            idempotency_key VARCHAR(128),
            type VARCHAR(30) NOT NULL,
            initiator_id UUID NOT NULL REFERENCES participants(id) ON DELETE RESTRICT,
            payload JSONB NOT NULL,
            signatures JSONB,
            state VARCHAR(30) NOT NULL DEFAULT 'NEW',
            error JSONB,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            CONSTRAINT chk_transaction_type CHECK (type IN ('TRUST_LINE_CREATE', 'TRUST_LINE_UPDATE', 'TRUST_LINE_CLOSE', 'PAYMENT', 'CLEARING', 'COMPENSATION', 'COMMODITY_REDEMPTION')),
            CONSTRAINT chk_transaction_state CHECK (state IN ('NEW', 'ROUTED', 'PREPARE_IN_PROGRESS', 'PREPARED', 'COMMITTED', 'ABORTED', 'PROPOSED', 'WAITING', 'REJECTED')),
            CONSTRAINT uq_transactions_initiator_type_idempotency UNIQUE (initiator_id, type, idempotency_key)
        )
        "#,
    )
    .execute(&mut *conn)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS ix_transactions_state ON transactions (state)")
        .execute(&mut *conn)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS ix_transactions_updated_at ON transactions (updated_at)")
        .execute(&mut *conn)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS prepare_locks (
            id UUID PRIMARY KEY,
            tx_id VARCHAR(64) NOT NULL,
            participant_id UUID NOT NULL REFERENCES participants(id),
            effects JSONB NOT NULL,
            expires_at TIMESTAMPTZ NOT NULL,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            CONSTRAINT uq_prepare_locks_tx_participant UNIQUE (tx_id, participant_id)
        )
        "#,
    )
    .execute(&mut *conn)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS ix_prepare_locks_expires_at ON prepare_locks (expires_at)")
        .execute(&mut *conn)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS ix_prepare_locks_participant ON prepare_locks (participant_id)")
        .execute(&mut *conn)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS audit_log (
            id UUID PRIMARY KEY,
            timestamp TIMESTAMPTZ NOT NULL DEFAULT now(),
            actor_id UUID REFERENCES participants(id) ON DELETE SET NULL,
            actor_role VARCHAR(50),
            action VARCHAR(100) NOT NULL,
            object_type VARCHAR(50),
            object_id VARCHAR(64),
            reason TEXT,
            before_state JSONB,
            after_state JSONB,
            request_id VARCHAR(64)
        )
        "#,
    )
    .execute(&mut *conn)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS ix_audit_log_object ON audit_log (object_type, object_id)")
        .execute(&mut *conn)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS integrity_audit_log (
            id UUID PRIMARY KEY,
            timestamp TIMESTAMPTZ NOT NULL DEFAULT now(),
            operation_type VARCHAR(30) NOT NULL,
            tx_id VARCHAR(64) NOT NULL,
            equivalent_code VARCHAR(16) NOT NULL,
            state_checksum_before VARCHAR(64) NOT NULL,
            state_checksum_after VARCHAR(64) NOT NULL,
            affected_participants JSONB NOT NULL,
            invariants_checked JSONB NOT NULL,
            verification_passed BOOLEAN NOT NULL,
            error_details JSONB
        )
        "#,
    )
    .execute(&mut *conn)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS integrity_checkpoints (
            id UUID PRIMARY KEY,
            equivalent_id UUID NOT NULL REFERENCES equivalents(id) ON DELETE CASCADE,
            checksum VARCHAR(64) NOT NULL,
            invariants_status JSONB NOT NULL,
            computed_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )
        "#,
    )
    .execute(&mut *conn)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS ix_integrity_checkpoints_equivalent ON integrity_checkpoints (equivalent_id, computed_at)")
        .execute(&mut *conn)
        .await?;

    Ok(())
}

fn row_to_equivalent(row: &sqlx::postgres::PgRow) -> LedgerResult<Equivalent> {
    Ok(Equivalent {
        id: row.try_get("id")?,
        code: row.try_get("code")?,
        symbol: row.try_get("symbol")?,
        description: row.try_get("description")?,
        precision: row.try_get("precision")?,
        is_active: row.try_get("is_active")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

pub async fn get_equivalent_by_code(
    conn: &mut PgConnection,
    code: &str,
) -> LedgerResult<Option<Equivalent>> {
    let row = sqlx::query("SELECT * FROM equivalents WHERE code = $1")
        .bind(code)
        .fetch_optional(&mut *conn)
        .await?;
    row.as_ref().map(row_to_equivalent).transpose()
}

pub async fn get_equivalent_by_id(
    conn: &mut PgConnection,
    id: Uuid,
) -> LedgerResult<Option<Equivalent>> {
    let row = sqlx::query("SELECT * FROM equivalents WHERE id = $1")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
    row.as_ref().map(row_to_equivalent).transpose()
}

/// All active equivalents, ordered by code — backs the Integrity API's
/// `status()` (spec §6), which has no single equivalent to scope to.
pub async fn list_active_equivalents(conn: &mut PgConnection) -> LedgerResult<Vec<Equivalent>> {
    let rows = sqlx::query("SELECT * FROM equivalents WHERE is_active = TRUE ORDER BY code")
        .fetch_all(&mut *conn)
        .await?;
    rows.iter().map(row_to_equivalent).collect()
}

fn parse_participant_type(s: &str) -> ParticipantType {
    match s {
        "business" => ParticipantType::Business,
        "hub" => ParticipantType::Hub,
        _ => ParticipantType::Person,
    }
}

fn parse_participant_status(s: &str) -> ParticipantStatus {
    match s {
        "suspended" => ParticipantStatus::Suspended,
        "left" => ParticipantStatus::Left,
        "deleted" => ParticipantStatus::Deleted,
        _ => ParticipantStatus::Active,
    }
}

fn row_to_participant(row: &sqlx::postgres::PgRow) -> LedgerResult<Participant> {
    let kind: String = row.try_get("type")?;
    let status: String = row.try_get("status")?;
    Ok(Participant {
        id: row.try_get("id")?,
        pid: row.try_get("pid")?,
        display_name: row.try_get("display_name")?,
        public_key: row.try_get("public_key")?,
        kind: parse_participant_type(&kind),
        status: parse_participant_status(&status),
        verification_level: row.try_get("verification_level")?,
    })
}

pub async fn get_participants_by_pids(
    conn: &mut PgConnection,
    pids: &[String],
) -> LedgerResult<Vec<Participant>> {
    let rows = sqlx::query("SELECT * FROM participants WHERE pid = ANY($1)")
        .bind(pids)
        .fetch_all(&mut *conn)
        .await?;
    rows.iter().map(row_to_participant).collect()
}

pub async fn get_participants_by_ids(
    conn: &mut PgConnection,
    ids: &[Uuid],
) -> LedgerResult<Vec<Participant>> {
    let rows = sqlx::query("SELECT * FROM participants WHERE id = ANY($1)")
        .bind(ids)
        .fetch_all(&mut *conn)
        .await?;
    rows.iter().map(row_to_participant).collect()
}

fn parse_trustline_status(s: &str) -> TrustLineStatus {
    match s {
        "frozen" => TrustLineStatus::Frozen,
        "closed" => TrustLineStatus::Closed,
        _ => TrustLineStatus::Active,
    }
}

fn row_to_trustline(row: &sqlx::postgres::PgRow) -> LedgerResult<TrustLine> {
    let status: String = row.try_get("status")?;
    let policy_json: Option<Value> = row.try_get("policy")?;
    let policy = match policy_json {
        Some(v) => serde_json::from_value(v).unwrap_or_default(),
        None => TrustLinePolicy::default(),
    };
    Ok(TrustLine {
        id: row.try_get("id")?,
        from_participant_id: row.try_get("from_participant_id")?,
        to_participant_id: row.try_get("to_participant_id")?,
        equivalent_id: row.try_get("equivalent_id")?,
        limit: row.try_get("limit")?,
        policy,
        status: parse_trustline_status(&status),
    })
}

/// Active TrustLine(from -> to, equivalent); absent or non-active ⇒ None
/// (callers treat that as effective limit 0, per spec §3 capacity semantics).
pub async fn get_active_trustline(
    conn: &mut PgConnection,
    from: Uuid,
    to: Uuid,
    equivalent_id: Uuid,
) -> LedgerResult<Option<TrustLine>> {
    let row = sqlx::query(
        "SELECT * FROM trust_lines WHERE from_participant_id = $1 AND to_participant_id = $2 \
         AND equivalent_id = $3 AND status = 'active'",
    )
    .bind(from)
    .bind(to)
    .bind(equivalent_id)
    .fetch_optional(&mut *conn)
    .await?;
    row.as_ref().map(row_to_trustline).transpose()
}

/// All active trustlines for an equivalent, used to build the clearing
/// engine's in-memory auto-clearing policy map (§4.4 DFS fallback).
pub async fn get_all_active_trustlines_for_equivalent(
    conn: &mut PgConnection,
    equivalent_id: Uuid,
) -> LedgerResult<Vec<TrustLine>> {
    let rows = sqlx::query("SELECT * FROM trust_lines WHERE equivalent_id = $1 AND status = 'active'")
        .bind(equivalent_id)
        .fetch_all(&mut *conn)
        .await?;
    rows.iter().map(row_to_trustline).collect()
}

/// Every TrustLine row for an equivalent regardless of status, ordered by
/// (from, to) — the integrity checksum (§4.2) hashes the full trustline
/// table for the equivalent, not just the pairs touched by current debts,
/// so a limit or status change is tamper-evident even with no open debt.
pub async fn get_all_trustlines_for_equivalent(
    conn: &mut PgConnection,
    equivalent_id: Uuid,
) -> LedgerResult<Vec<TrustLine>> {
    let rows = sqlx::query(
        "SELECT * FROM trust_lines WHERE equivalent_id = $1 ORDER BY from_participant_id, to_participant_id",
    )
    .bind(equivalent_id)
    .fetch_all(&mut *conn)
    .await?;
    rows.iter().map(row_to_trustline).collect()
}

fn row_to_debt(row: &sqlx::postgres::PgRow) -> LedgerResult<Debt> {
    Ok(Debt {
        id: row.try_get("id")?,
        debtor_id: row.try_get("debtor_id")?,
        creditor_id: row.try_get("creditor_id")?,
        equivalent_id: row.try_get("equivalent_id")?,
        amount: row.try_get("amount")?,
        version: row.try_get("version")?,
    })
}

pub async fn get_debt(
    conn: &mut PgConnection,
    debtor_id: Uuid,
    creditor_id: Uuid,
    equivalent_id: Uuid,
) -> LedgerResult<Option<Debt>> {
    let row = sqlx::query(
        "SELECT * FROM debts WHERE debtor_id = $1 AND creditor_id = $2 AND equivalent_id = $3",
    )
    .bind(debtor_id)
    .bind(creditor_id)
    .bind(equivalent_id)
    .fetch_optional(&mut *conn)
    .await?;
    row.as_ref().map(row_to_debt).transpose()
}

pub async fn get_debt_for_update(
    tx: &mut PgTransaction<'_, Postgres>,
    debtor_id: Uuid,
    creditor_id: Uuid,
    equivalent_id: Uuid,
) -> LedgerResult<Option<Debt>> {
    let row = sqlx::query(
        "SELECT * FROM debts WHERE debtor_id = $1 AND creditor_id = $2 AND equivalent_id = $3 FOR UPDATE",
    )
    .bind(debtor_id)
    .bind(creditor_id)
    .bind(equivalent_id)
    .fetch_optional(&mut **tx)
    .await?;
    row.as_ref().map(row_to_debt).transpose()
}

pub async fn get_debts_for_update_by_ids(
    tx: &mut PgTransaction<'_, Postgres>,
    ids: &[Uuid],
) -> LedgerResult<Vec<Debt>> {
    let rows = sqlx::query("SELECT * FROM debts WHERE id = ANY($1) FOR UPDATE")
        .bind(ids)
        .fetch_all(&mut **tx)
        .await?;
    rows.iter().map(row_to_debt).collect()
}

pub async fn get_all_debts_for_equivalent(
    conn: &mut PgConnection,
    equivalent_id: Uuid,
) -> LedgerResult<Vec<Debt>> {
    let rows = sqlx::query("SELECT * FROM debts WHERE equivalent_id = $1 AND amount > 0 ORDER BY debtor_id, creditor_id")
        .bind(equivalent_id)
        .fetch_all(&mut *conn)
        .await?;
    rows.iter().map(row_to_debt).collect()
}

fn row_to_cycle_edge(row: &sqlx::postgres::PgRow, n: u32) -> LedgerResult<Debt> {
    Ok(Debt {
        id: row.try_get(format!("id{n}").as_str())?,
        debtor_id: row.try_get(format!("debtor{n}").as_str())?,
        creditor_id: row.try_get(format!("creditor{n}").as_str())?,
        equivalent_id: row.try_get(format!("eq{n}").as_str())?,
        amount: row.try_get(format!("amount{n}").as_str())?,
        version: row.try_get(format!("version{n}").as_str())?,
    })
}

/// Set-based depth-3 cycle discovery (§4.4): a self-join of Debt with
/// itself closing back to the first debtor, all edges strictly positive.
pub async fn find_cycles_depth3(
    conn: &mut PgConnection,
    equivalent_id: Uuid,
) -> LedgerResult<Vec<Vec<Debt>>> {
    let rows = sqlx::query(
        r#"
        SELECT
            d1.id AS id1, d1.debtor_id AS debtor1, d1.creditor_id AS creditor1, d1.equivalent_id AS eq1, d1.amount AS amount1, d1.version AS version1,
            d2.id AS id2, d2.debtor_id AS debtor2, d2.creditor_id AS creditor2, d2.equivalent_id AS eq2, d2.amount AS amount2, d2.version AS version2,
            d3.id AS id3, d3.debtor_id AS debtor3, d3.creditor_id AS creditor3, d3.equivalent_id AS eq3, d3.amount AS amount3, d3.version AS version3
        FROM debts d1
        JOIN debts d2 ON d2.debtor_id = d1.creditor_id AND d2.equivalent_id = d1.equivalent_id
        JOIN debts d3 ON d3.debtor_id = d2.creditor_id AND d3.creditor_id = d1.debtor_id AND d3.equivalent_id = d1.equivalent_id
        WHERE d1.equivalent_id = $1 AND d1.amount > 0 AND d2.amount > 0 AND d3.amount > 0
        "#,
    )
    .bind(equivalent_id)
    .fetch_all(&mut *conn)
    .await?;

    rows.iter()
        .map(|row| {
            Ok(vec![
                row_to_cycle_edge(row, 1)?,
                row_to_cycle_edge(row, 2)?,
                row_to_cycle_edge(row, 3)?,
            ])
        })
        .collect()
}

/// Set-based depth-4 cycle discovery. The extra non-adjacent-vertex checks
/// (`d1.debtor != d2.creditor`, `d1.creditor != d3.creditor`) reject
/// non-simple walks like A->B->C->B->A that a plain 4-edge join would admit.
pub async fn find_cycles_depth4(
    conn: &mut PgConnection,
    equivalent_id: Uuid,
) -> LedgerResult<Vec<Vec<Debt>>> {
    let rows = sqlx::query(
        r#"
        SELECT
            d1.id AS id1, d1.debtor_id AS debtor1, d1.creditor_id AS creditor1, d1.equivalent_id AS eq1, d1.amount AS amount1, d1.version AS version1,
            d2.id AS id2, d2.debtor_id AS debtor2, d2.creditor_id AS creditor2, d2.equivalent_id AS eq2, d2.amount AS amount2, d2.version AS version2,
            d3.id AS id3, d3.debtor_id AS debtor3, d3.creditor_id AS creditor3, d3.equivalent_id AS eq3, d3.amount AS amount3, d3.version AS version3,
            d4.id AS id4, d4.debtor_id AS debtor4, d4.creditor_id AS creditor4, d4.equivalent_id AS eq4, d4.amount AS amount4, d4.version AS version4
        FROM debts d1
        JOIN debts d2 ON d2.debtor_id = d1.creditor_id AND d2.equivalent_id = d1.equivalent_id
        JOIN debts d3 ON d3.debtor_id = d2.creditor_id AND d3.equivalent_id = d1.equivalent_id
        JOIN debts d4 ON d4.debtor_id = d3.creditor_id AND d4.creditor_id = d1.debtor_id AND d4.equivalent_id = d1.equivalent_id
        WHERE d1.equivalent_id = $1 AND d1.amount > 0 AND d2.amount > 0 AND d3.amount > 0 AND d4.amount > 0
              AND d1.debtor_id != d2.creditor_id
              AND d1.creditor_id != d3.creditor_id
        "#,
    )
    .bind(equivalent_id)
    .fetch_all(&mut *conn)
    .await?;

    rows.iter()
        .map(|row| {
            Ok(vec![
                row_to_cycle_edge(row, 1)?,
                row_to_cycle_edge(row, 2)?,
                row_to_cycle_edge(row, 3)?,
                row_to_cycle_edge(row, 4)?,
            ])
        })
        .collect()
}

/// Insert-or-bump a debt row by `delta` (positive or negative); deletes the
/// row when the resulting amount is zero. Used by `applyFlow` (§4.3.3).
pub async fn upsert_debt_delta(
    tx: &mut PgTransaction<'_, Postgres>,
    debtor_id: Uuid,
    creditor_id: Uuid,
    equivalent_id: Uuid,
    delta: Decimal,
) -> LedgerResult<()> {
    let existing = get_debt_for_update(tx, debtor_id, creditor_id, equivalent_id).await?;
    match existing {
        Some(debt) => {
            let new_amount = debt.amount + delta;
            if new_amount <= Decimal::ZERO {
                sqlx::query("DELETE FROM debts WHERE id = $1")
                    .bind(debt.id)
                    .execute(&mut **tx)
                    .await?;
            } else {
                sqlx::query(
                    "UPDATE debts SET amount = $1, version = version + 1, updated_at = now() WHERE id = $2 AND version = $3",
                )
                .bind(new_amount)
                .bind(debt.id)
                .bind(debt.version)
                .execute(&mut **tx)
                .await?;
            }
        }
        None => {
            if delta > Decimal::ZERO {
                sqlx::query(
                    "INSERT INTO debts (id, debtor_id, creditor_id, equivalent_id, amount, version) \
                     VALUES ($1, $2, $3, $4, $5, 0)",
                )
                .bind(Uuid::new_v4())
                .bind(debtor_id)
                .bind(creditor_id)
                .bind(equivalent_id)
                .bind(delta)
                .execute(&mut **tx)
                .await?;
            }
        }
    }
    Ok(())
}

pub async fn delete_debt(tx: &mut PgTransaction<'_, Postgres>, id: Uuid) -> LedgerResult<()> {
    sqlx::query("DELETE FROM debts WHERE id = $1")
        .bind(id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

pub async fn set_debt_amount(
    tx: &mut PgTransaction<'_, Postgres>,
    id: Uuid,
    amount: Decimal,
    expected_version: i32,
) -> LedgerResult<u64> {
    let result = sqlx::query(
        "UPDATE debts SET amount = $1, version = version + 1, updated_at = now() WHERE id = $2 AND version = $3",
    )
    .bind(amount)
    .bind(id)
    .bind(expected_version)
    .execute(&mut **tx)
    .await?;
    Ok(result.rows_affected())
}

fn parse_tx_type(s: &str) -> TransactionType {
    match s {
        "TRUST_LINE_CREATE" => TransactionType::TrustLineCreate,
        "TRUST_LINE_UPDATE" => TransactionType::TrustLineUpdate,
        "TRUST_LINE_CLOSE" => TransactionType::TrustLineClose,
        "CLEARING" => TransactionType::Clearing,
        "COMPENSATION" => TransactionType::Compensation,
        "COMMODITY_REDEMPTION" => TransactionType::CommodityRedemption,
        _ => TransactionType::Payment,
    }
}

fn parse_tx_state(s: &str) -> TransactionState {
    match s {
        "ROUTED" => TransactionState::Routed,
        "PREPARE_IN_PROGRESS" => TransactionState::PrepareInProgress,
        "PREPARED" => TransactionState::Prepared,
        "COMMITTED" => TransactionState::Committed,
        "ABORTED" => TransactionState::Aborted,
        "PROPOSED" => TransactionState::Proposed,
        "WAITING" => TransactionState::Waiting,
        "REJECTED" => TransactionState::Rejected,
        _ => TransactionState::New,
    }
}

fn row_to_transaction(row: &sqlx::postgres::PgRow) -> LedgerResult<Transaction> {
    let tx_type: String = row.try_get("type")?;
    let state: String = row.try_get("state")?;
    let signatures: Option<Value> = row.try_get("signatures")?;
    Ok(Transaction {
        id: row.try_get("id")?,
        tx_id: row.try_get("tx_id")?,
        idempotency_key: row.try_get("idempotency_key")?,
        tx_type: parse_tx_type(&tx_type),
        initiator_id: row.try_get("initiator_id")?,
        payload: row.try_get("payload")?,
        signatures: signatures
            .and_then(|v| v.as_array().cloned())
            .unwrap_or_default(),
        state: parse_tx_state(&state),
        error: row.try_get("error")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

pub async fn get_transaction(
    conn: &mut PgConnection,
    tx_id: &str,
) -> LedgerResult<Option<Transaction>> {
    let row = sqlx::query("SELECT * FROM transactions WHERE tx_id = $1")
        .bind(tx_id)
        .fetch_optional(&mut *conn)
        .await?;
    row.as_ref().map(row_to_transaction).transpose()
}

pub async fn get_transaction_by_idempotency_key(
    conn: &mut PgConnection,
    initiator_id: Uuid,
    tx_type: TransactionType,
    idempotency_key: &str,
) -> LedgerResult<Option<Transaction>> {
    let row = sqlx::query(
        "SELECT * FROM transactions WHERE initiator_id = $1 AND type = $2 AND idempotency_key = $3",
    )
    .bind(initiator_id)
    .bind(tx_type.as_str())
    .bind(idempotency_key)
    .fetch_optional(&mut *conn)
    .await?;
    row.as_ref().map(row_to_transaction).transpose()
}

pub async fn insert_transaction(
    tx: &mut PgTransaction<'_, Postgres>,
    transaction: &Transaction,
) -> LedgerResult<()> {
    sqlx::query(
        "INSERT INTO transactions (id, tx_id, idempotency_key, type, initiator_id, payload, signatures, state) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
    )
    .bind(transaction.id)
    .bind(&transaction.tx_id)
    .bind(&transaction.idempotency_key)
    .bind(transaction.tx_type.as_str())
    .bind(transaction.initiator_id)
    .bind(&transaction.payload)
    .bind(Value::Array(transaction.signatures.clone()))
    .bind(transaction.state.as_str())
    .execute(&mut **tx)
    .await?;
    Ok(())
}

pub async fn update_transaction_state(
    tx: &mut PgTransaction<'_, Postgres>,
    tx_id: &str,
    state: TransactionState,
) -> LedgerResult<()> {
    sqlx::query("UPDATE transactions SET state = $1, updated_at = now() WHERE tx_id = $2")
        .bind(state.as_str())
        .bind(tx_id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

pub async fn update_transaction_state_and_error(
    tx: &mut PgTransaction<'_, Postgres>,
    tx_id: &str,
    state: TransactionState,
    error: &Value,
) -> LedgerResult<()> {
    sqlx::query("UPDATE transactions SET state = $1, error = $2, updated_at = now() WHERE tx_id = $3")
        .bind(state.as_str())
        .bind(error)
        .bind(tx_id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

/// Sent/received payment history for `listPayments` (spec §6): "sent" is a
/// straight `initiator_id` match; "received" relies on the `to` participant
/// id the caller stored in the PAYMENT payload at creation time.
pub async fn list_payment_transactions(
    conn: &mut PgConnection,
    participant_id: Uuid,
    sent: bool,
    equivalent_code: Option<&str>,
    from_date: Option<DateTime<Utc>>,
    limit: i64,
    offset: i64,
) -> LedgerResult<Vec<Transaction>> {
    let rows = if sent {
        sqlx::query(
            "SELECT * FROM transactions WHERE type = 'PAYMENT' AND initiator_id = $1 \
             AND ($2::VARCHAR IS NULL OR payload->>'equivalent' = $2) \
             AND ($3::TIMESTAMPTZ IS NULL OR created_at >= $3) \
             ORDER BY created_at DESC LIMIT $4 OFFSET $5",
        )
        .bind(participant_id)
        .bind(equivalent_code)
        .bind(from_date)
        .bind(limit)
        .bind(offset)
        .fetch_all(&mut *conn)
        .await?
    } else {
        sqlx::query(
            "SELECT * FROM transactions WHERE type = 'PAYMENT' AND initiator_id != $1 \
             AND payload->>'to' = $1::text \
             AND ($2::VARCHAR IS NULL OR payload->>'equivalent' = $2) \
             AND ($3::TIMESTAMPTZ IS NULL OR created_at >= $3) \
             ORDER BY created_at DESC LIMIT $4 OFFSET $5",
        )
        .bind(participant_id)
        .bind(equivalent_code)
        .bind(from_date)
        .bind(limit)
        .bind(offset)
        .fetch_all(&mut *conn)
        .await?
    };
    rows.iter().map(row_to_transaction).collect()
}

pub async fn find_stale_active_tx_ids(
    conn: &mut PgConnection,
    tx_type: TransactionType,
    cutoff: DateTime<Utc>,
) -> LedgerResult<Vec<String>> {
    let rows = sqlx::query(
        "SELECT tx_id FROM transactions WHERE type = $1 \
         AND state IN ('NEW', 'ROUTED', 'PREPARE_IN_PROGRESS', 'PREPARED', 'PROPOSED', 'WAITING') \
         AND updated_at < $2 ORDER BY updated_at ASC",
    )
    .bind(tx_type.as_str())
    .bind(cutoff)
    .fetch_all(&mut *conn)
    .await?;
    rows.iter().map(|r| Ok(r.try_get("tx_id")?)).collect()
}

fn row_to_prepare_lock(row: &sqlx::postgres::PgRow) -> LedgerResult<PrepareLock> {
    let effects: Value = row.try_get("effects")?;
    Ok(PrepareLock {
        id: row.try_get("id")?,
        tx_id: row.try_get("tx_id")?,
        participant_id: row.try_get("participant_id")?,
        effects: serde_json::from_value(effects).unwrap_or_default(),
        expires_at: row.try_get("expires_at")?,
        created_at: row.try_get("created_at")?,
    })
}

pub async fn get_prepare_locks_by_tx(
    conn: &mut PgConnection,
    tx_id: &str,
) -> LedgerResult<Vec<PrepareLock>> {
    let rows = sqlx::query("SELECT * FROM prepare_locks WHERE tx_id = $1")
        .bind(tx_id)
        .fetch_all(&mut *conn)
        .await?;
    rows.iter().map(row_to_prepare_lock).collect()
}

/// Active (non-expired) locks reserving capacity out of `participant_id`,
/// excluding `exclude_tx_id` (this prepare's own tx, §4.3.1).
pub async fn get_active_locks_for_participant(
    conn: &mut PgConnection,
    participant_id: Uuid,
    exclude_tx_id: &str,
) -> LedgerResult<Vec<PrepareLock>> {
    let rows = sqlx::query(
        "SELECT * FROM prepare_locks WHERE participant_id = $1 AND expires_at > now() AND tx_id != $2",
    )
    .bind(participant_id)
    .bind(exclude_tx_id)
    .fetch_all(&mut *conn)
    .await?;
    rows.iter().map(row_to_prepare_lock).collect()
}

pub async fn get_all_active_locks(conn: &mut PgConnection) -> LedgerResult<Vec<PrepareLock>> {
    let rows = sqlx::query("SELECT * FROM prepare_locks WHERE expires_at > now()")
        .fetch_all(&mut *conn)
        .await?;
    rows.iter().map(row_to_prepare_lock).collect()
}

pub async fn insert_prepare_lock(
    tx: &mut PgTransaction<'_, Postgres>,
    lock: &PrepareLock,
) -> LedgerResult<()> {
    sqlx::query(
        "INSERT INTO prepare_locks (id, tx_id, participant_id, effects, expires_at) VALUES ($1, $2, $3, $4, $5)",
    )
    .bind(lock.id)
    .bind(&lock.tx_id)
    .bind(lock.participant_id)
    .bind(serde_json::to_value(&lock.effects)?)
    .bind(lock.expires_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

pub async fn delete_prepare_locks_by_tx(
    tx: &mut PgTransaction<'_, Postgres>,
    tx_id: &str,
) -> LedgerResult<()> {
    sqlx::query("DELETE FROM prepare_locks WHERE tx_id = $1")
        .bind(tx_id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

pub async fn any_lock_expired(
    tx: &mut PgTransaction<'_, Postgres>,
    tx_id: &str,
) -> LedgerResult<bool> {
    let row = sqlx::query("SELECT id FROM prepare_locks WHERE tx_id = $1 AND expires_at <= now() LIMIT 1")
        .bind(tx_id)
        .fetch_optional(&mut **tx)
        .await?;
    Ok(row.is_some())
}

pub async fn expired_lock_tx_ids(conn: &mut PgConnection) -> LedgerResult<Vec<String>> {
    let rows = sqlx::query("SELECT DISTINCT tx_id FROM prepare_locks WHERE expires_at <= now()")
        .fetch_all(&mut *conn)
        .await?;
    rows.iter().map(|r| Ok(r.try_get("tx_id")?)).collect()
}

pub async fn delete_expired_prepare_locks(conn: &mut PgConnection) -> LedgerResult<u64> {
    let result = sqlx::query("DELETE FROM prepare_locks WHERE expires_at <= now()")
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected())
}

/// Postgres advisory transaction-scoped lock, keyed per segment (§4.3.1).
pub async fn acquire_advisory_xact_lock(
    tx: &mut PgTransaction<'_, Postgres>,
    key: i64,
) -> LedgerResult<()> {
    sqlx::query("SELECT pg_advisory_xact_lock($1)")
        .bind(key)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

pub async fn insert_integrity_audit_log(
    tx: &mut PgTransaction<'_, Postgres>,
    entry: &IntegrityAuditLogEntry,
) -> LedgerResult<()> {
    sqlx::query(
        "INSERT INTO integrity_audit_log \
         (id, operation_type, tx_id, equivalent_code, state_checksum_before, state_checksum_after, \
          affected_participants, invariants_checked, verification_passed, error_details) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
    )
    .bind(entry.id)
    .bind(&entry.operation_type)
    .bind(&entry.tx_id)
    .bind(&entry.equivalent_code)
    .bind(&entry.state_checksum_before)
    .bind(&entry.state_checksum_after)
    .bind(&entry.affected_participants)
    .bind(&entry.invariants_checked)
    .bind(entry.verification_passed)
    .bind(&entry.error_details)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

fn row_to_integrity_audit_log_entry(row: &sqlx::postgres::PgRow) -> LedgerResult<IntegrityAuditLogEntry> {
    Ok(IntegrityAuditLogEntry {
        id: row.try_get("id")?,
        timestamp: row.try_get("timestamp")?,
        operation_type: row.try_get("operation_type")?,
        tx_id: row.try_get("tx_id")?,
        equivalent_code: row.try_get("equivalent_code")?,
        state_checksum_before: row.try_get("state_checksum_before")?,
        state_checksum_after: row.try_get("state_checksum_after")?,
        affected_participants: row.try_get("affected_participants")?,
        invariants_checked: row.try_get("invariants_checked")?,
        verification_passed: row.try_get("verification_passed")?,
        error_details: row.try_get("error_details")?,
    })
}

/// Filters for the Integrity API's `auditLog(pagination, filters)` (spec
/// §6). Every field is optional; `None` means "don't filter on this".
#[derive(Debug, Clone, Default)]
pub struct IntegrityAuditLogFilters {
    pub equivalent_code: Option<String>,
    pub operation_type: Option<String>,
    pub tx_id: Option<String>,
    pub verification_passed: Option<bool>,
    pub from_date: Option<DateTime<Utc>>,
}

pub async fn list_integrity_audit_log(
    conn: &mut PgConnection,
    filters: &IntegrityAuditLogFilters,
    limit: i64,
    offset: i64,
) -> LedgerResult<Vec<IntegrityAuditLogEntry>> {
    let rows = sqlx::query(
        "SELECT * FROM integrity_audit_log WHERE \
         ($1::VARCHAR IS NULL OR equivalent_code = $1) \
         AND ($2::VARCHAR IS NULL OR operation_type = $2) \
         AND ($3::VARCHAR IS NULL OR tx_id = $3) \
         AND ($4::BOOLEAN IS NULL OR verification_passed = $4) \
         AND ($5::TIMESTAMPTZ IS NULL OR timestamp >= $5) \
         ORDER BY timestamp DESC LIMIT $6 OFFSET $7",
    )
    .bind(&filters.equivalent_code)
    .bind(&filters.operation_type)
    .bind(&filters.tx_id)
    .bind(filters.verification_passed)
    .bind(filters.from_date)
    .bind(limit)
    .bind(offset)
    .fetch_all(&mut *conn)
    .await?;
    rows.iter().map(row_to_integrity_audit_log_entry).collect()
}

pub async fn insert_audit_log_entry(
    conn: &mut PgConnection,
    entry: &AuditLogEntry,
) -> LedgerResult<()> {
    sqlx::query(
        "INSERT INTO audit_log \
         (id, actor_id, actor_role, action, object_type, object_id, reason, before_state, after_state, request_id) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
    )
    .bind(entry.id)
    .bind(entry.actor_id)
    .bind(&entry.actor_role)
    .bind(&entry.action)
    .bind(&entry.object_type)
    .bind(&entry.object_id)
    .bind(&entry.reason)
    .bind(&entry.before_state)
    .bind(&entry.after_state)
    .bind(&entry.request_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn insert_integrity_checkpoint(
    conn: &mut PgConnection,
    checkpoint: &IntegrityCheckpoint,
) -> LedgerResult<()> {
    sqlx::query(
        "INSERT INTO integrity_checkpoints (id, equivalent_id, checksum, invariants_status, computed_at) \
         VALUES ($1, $2, $3, $4, $5)",
    )
    .bind(Uuid::new_v4())
    .bind(checkpoint.equivalent_id)
    .bind(&checkpoint.checksum)
    .bind(serde_json::to_value(&checkpoint.invariants_status)?)
    .bind(checkpoint.computed_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trustline_policy_default_matches_schema_default() {
        let policy = TrustLinePolicy::default();
        assert!(policy.auto_clearing);
        assert!(policy.can_be_intermediate);
        assert!(policy.blocked_participants.is_empty());
    }

    #[test]
    fn parse_tx_state_roundtrip() {
        for state in [
            TransactionState::New,
            TransactionState::Prepared,
            TransactionState::Committed,
            TransactionState::Aborted,
        ] {
            assert_eq!(parse_tx_state(state.as_str()), state);
        }
    }
}
