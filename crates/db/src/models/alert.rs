//! Alert row model.

use beacon_core::alert::Alert;
use beacon_core::error::CoreError;
use beacon_core::types::{DbId, Timestamp};
use serde::Serialize;
use sqlx::FromRow;

use super::metadata_from_json;

/// A row from the `alerts` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct AlertRow {
    pub id: DbId,
    pub tenant_id: DbId,
    pub source_type: String,
    pub source_id: String,
    pub alert_type: String,
    pub title: String,
    pub message: String,
    pub severity: String,
    pub status: String,
    pub triggered_at: Timestamp,
    pub acknowledged_at: Option<Timestamp>,
    pub acknowledged_by: Option<DbId>,
    pub resolved_at: Option<Timestamp>,
    pub resolved_by: Option<DbId>,
    pub resolution_notes: Option<String>,
    pub auto_resolved: bool,
    pub escalation_level: i32,
    pub escalated_at: Option<Timestamp>,
    pub notified_level: i32,
    pub suppressed_until: Option<Timestamp>,
    pub recurrence_count: i32,
    pub last_occurrence: Timestamp,
    pub threshold_value: Option<f64>,
    pub current_value: Option<f64>,
    pub metadata: serde_json::Value,
    pub version: i32,
}

impl TryFrom<AlertRow> for Alert {
    type Error = CoreError;

    fn try_from(row: AlertRow) -> Result<Self, Self::Error> {
        Ok(Alert {
            id: row.id,
            tenant_id: row.tenant_id,
            source_type: row.source_type,
            source_id: row.source_id,
            alert_type: row.alert_type,
            title: row.title,
            message: row.message,
            severity: row.severity.parse()?,
            status: row.status.parse()?,
            triggered_at: row.triggered_at,
            acknowledged_at: row.acknowledged_at,
            acknowledged_by: row.acknowledged_by,
            resolved_at: row.resolved_at,
            resolved_by: row.resolved_by,
            resolution_notes: row.resolution_notes,
            auto_resolved: row.auto_resolved,
            escalation_level: row.escalation_level,
            escalated_at: row.escalated_at,
            notified_level: row.notified_level,
            suppressed_until: row.suppressed_until,
            recurrence_count: row.recurrence_count,
            last_occurrence: row.last_occurrence,
            threshold_value: row.threshold_value,
            current_value: row.current_value,
            metadata: metadata_from_json(row.metadata),
            version: row.version,
        })
    }
}
