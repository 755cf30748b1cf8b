//! General audit trail (SPEC_FULL §0.1), distinct from the per-equivalent
//! `IntegrityAuditLog` in `integrity.rs`. Recovery-loop aborts and admin
//! repairs record through this instead, keyed by actor/action/object rather
//! than by equivalent checksum.

use crate::error::LedgerResult;
use crate::model::AuditLogEntry;
use crate::storage;
use chrono::Utc;
use serde_json::Value;
use sqlx::PgConnection;
use uuid::Uuid;

pub struct AuditLogWriter;

impl AuditLogWriter {
    #[allow(clippy::too_many_arguments)]
    pub async fn record(
        conn: &mut PgConnection,
        actor_id: Option<Uuid>,
        actor_role: Option<&str>,
        action: &str,
        object_type: Option<&str>,
        object_id: Option<&str>,
        reason: Option<&str>,
        before_state: Option<Value>,
        after_state: Option<Value>,
        request_id: Option<&str>,
    ) -> LedgerResult<()> {
        let entry = AuditLogEntry {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            actor_id,
            actor_role: actor_role.map(str::to_string),
            action: action.to_string(),
            object_type: object_type.map(str::to_string),
            object_id: object_id.map(str::to_string),
            reason: reason.map(str::to_string),
            before_state,
            after_state,
            request_id: request_id.map(str::to_string),
        };
        storage::insert_audit_log_entry(conn, &entry).await
    }
}
