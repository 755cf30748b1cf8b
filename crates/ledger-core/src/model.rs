//! Domain entities (spec §3). Transaction.state and Participant.status are
//! closed tagged enums mapped at the persistence boundary, not raw strings
//! (spec §9 Design Notes — Polymorphism).

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Equivalent {
    pub id: Uuid,
    pub code: String,
    pub symbol: Option<String>,
    pub description: Option<String>,
    pub precision: i16,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantType {
    Person,
    Business,
    Hub,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantStatus {
    Active,
    Suspended,
    Left,
    Deleted,
}

impl ParticipantStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ParticipantStatus::Active => "active",
            ParticipantStatus::Suspended => "suspended",
            ParticipantStatus::Left => "left",
            ParticipantStatus::Deleted => "deleted",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    pub id: Uuid,
    pub pid: String,
    pub display_name: String,
    pub public_key: String,
    pub kind: ParticipantType,
    pub status: ParticipantStatus,
    pub verification_level: i16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustLineStatus {
    Active,
    Frozen,
    Closed,
}

impl TrustLineStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TrustLineStatus::Active => "active",
            TrustLineStatus::Frozen => "frozen",
            TrustLineStatus::Closed => "closed",
        }
    }
}

/// Policy bag governing clearing consent and routing eligibility for a
/// trustline, mirroring the source schema's default JSON column.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustLinePolicy {
    #[serde(default = "default_true")]
    pub auto_clearing: bool,
    #[serde(default = "default_true")]
    pub can_be_intermediate: bool,
    #[serde(default)]
    pub max_hop_usage: Option<i32>,
    #[serde(default)]
    pub daily_limit: Option<Decimal>,
    #[serde(default)]
    pub blocked_participants: Vec<String>,
}

fn default_true() -> bool {
    true
}

impl Default for TrustLinePolicy {
    fn default() -> Self {
        Self {
            auto_clearing: true,
            can_be_intermediate: true,
            max_hop_usage: None,
            daily_limit: None,
            blocked_participants: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustLine {
    pub id: Uuid,
    pub from_participant_id: Uuid,
    pub to_participant_id: Uuid,
    pub equivalent_id: Uuid,
    pub limit: Decimal,
    pub policy: TrustLinePolicy,
    pub status: TrustLineStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Debt {
    pub id: Uuid,
    pub debtor_id: Uuid,
    pub creditor_id: Uuid,
    pub equivalent_id: Uuid,
    pub amount: Decimal,
    /// Optimistic-lock version (spec §5 Shared-resource policy).
    pub version: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionType {
    TrustLineCreate,
    TrustLineUpdate,
    TrustLineClose,
    Payment,
    Clearing,
    Compensation,
    CommodityRedemption,
}

impl TransactionType {
    pub fn as_str(self) -> &'static str {
        match self {
            TransactionType::TrustLineCreate => "TRUST_LINE_CREATE",
            TransactionType::TrustLineUpdate => "TRUST_LINE_UPDATE",
            TransactionType::TrustLineClose => "TRUST_LINE_CLOSE",
            TransactionType::Payment => "PAYMENT",
            TransactionType::Clearing => "CLEARING",
            TransactionType::Compensation => "COMPENSATION",
            TransactionType::CommodityRedemption => "COMMODITY_REDEMPTION",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionState {
    New,
    Routed,
    PrepareInProgress,
    Prepared,
    Committed,
    Aborted,
    Proposed,
    Waiting,
    Rejected,
}

impl TransactionState {
    pub fn as_str(self) -> &'static str {
        match self {
            TransactionState::New => "NEW",
            TransactionState::Routed => "ROUTED",
            TransactionState::PrepareInProgress => "PREPARE_IN_PROGRESS",
            TransactionState::Prepared => "PREPARED",
            TransactionState::Committed => "COMMITTED",
            TransactionState::Aborted => "ABORTED",
            TransactionState::Proposed => "PROPOSED",
            TransactionState::Waiting => "WAITING",
            TransactionState::Rejected => "REJECTED",
        }
    }

    /// States recovery treats as "active" and eligible for stale-transaction abort (§4.5).
    pub fn is_active(self) -> bool {
        matches!(
            self,
            TransactionState::New
                | TransactionState::Routed
                | TransactionState::PrepareInProgress
                | TransactionState::Prepared
                | TransactionState::Proposed
                | TransactionState::Waiting
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TransactionState::Committed | TransactionState::Aborted)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: Uuid,
    pub tx_id: String,
    pub idempotency_key: Option<String>,
    pub tx_type: TransactionType,
    pub initiator_id: Uuid,
    pub payload: Value,
    #[serde(default)]
    pub signatures: Vec<Value>,
    pub state: TransactionState,
    pub error: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Transaction {
    /// "Same key, different payload" replay check (SPEC_FULL §0.1).
    pub fn check_idempotent_replay(&self, payload: &Value) -> ReplayOutcome {
        if &self.payload == payload {
            ReplayOutcome::IdenticalReplay
        } else {
            ReplayOutcome::ConflictingReplay
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayOutcome {
    IdenticalReplay,
    ConflictingReplay,
}

/// A single directed flow within a prepare lock's effects bag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Flow {
    pub from: Uuid,
    pub to: Uuid,
    pub amount: Decimal,
    pub equivalent: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LockEffects {
    #[serde(default)]
    pub flows: Vec<Flow>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrepareLock {
    pub id: Uuid,
    pub tx_id: String,
    pub participant_id: Uuid,
    pub effects: LockEffects,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub actor_id: Option<Uuid>,
    pub actor_role: Option<String>,
    pub action: String,
    pub object_type: Option<String>,
    pub object_id: Option<String>,
    pub reason: Option<String>,
    pub before_state: Option<Value>,
    pub after_state: Option<Value>,
    pub request_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrityAuditLogEntry {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub operation_type: String,
    pub tx_id: String,
    pub equivalent_code: String,
    pub state_checksum_before: String,
    pub state_checksum_after: String,
    pub affected_participants: Value,
    pub invariants_checked: Value,
    pub verification_passed: bool,
    pub error_details: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntegrityStatus {
    Healthy,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantsStatus {
    pub passed: bool,
    pub status: IntegrityStatus,
    pub checks: Value,
    #[serde(default)]
    pub alerts: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrityCheckpoint {
    pub equivalent_id: Uuid,
    pub checksum: String,
    pub invariants_status: InvariantsStatus,
    pub computed_at: DateTime<Utc>,
}
