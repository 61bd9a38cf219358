//! Audit trail models. Audit rows are immutable once written.

use beacon_core::types::{DbId, Timestamp};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A row from the `alert_events` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct AuditEventRow {
    pub id: DbId,
    pub tenant_id: Option<DbId>,
    pub event_type: String,
    pub entity_type: Option<String>,
    pub entity_id: Option<DbId>,
    pub actor_id: Option<DbId>,
    pub payload: serde_json::Value,
    pub occurred_at: Timestamp,
    pub created_at: Timestamp,
}

/// DTO for inserting an audit event.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateAuditEvent {
    pub tenant_id: Option<DbId>,
    pub event_type: String,
    pub entity_type: Option<String>,
    pub entity_id: Option<DbId>,
    pub actor_id: Option<DbId>,
    pub payload: serde_json::Value,
    pub occurred_at: Timestamp,
}
