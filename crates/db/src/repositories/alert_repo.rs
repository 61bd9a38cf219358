//! Repository for the `alerts` table.
//!
//! Updates are compare-and-swap on `version`: a write only lands if the row
//! still carries the version the caller read, and every successful write
//! bumps it.

use beacon_core::alert::{Alert, AlertFilter, AlertStatus, SourceKey};
use beacon_core::types::{DbId, Timestamp};
use sqlx::PgPool;

use crate::models::alert::AlertRow;

/// Column list for `alerts` queries.
const COLUMNS: &str = "\
    id, tenant_id, source_type, source_id, alert_type, title, message, \
    severity, status, triggered_at, acknowledged_at, acknowledged_by, \
    resolved_at, resolved_by, resolution_notes, auto_resolved, \
    escalation_level, escalated_at, notified_level, suppressed_until, \
    recurrence_count, last_occurrence, threshold_value, current_value, \
    metadata, version";

/// Column list for INSERT (excludes `id`, `version`, and timestamps with defaults).
const INSERT_COLUMNS: &str = "\
    tenant_id, source_type, source_id, alert_type, title, message, \
    severity, status, triggered_at, escalation_level, recurrence_count, \
    last_occurrence, threshold_value, current_value, metadata";

/// Provides persistence for alerts.
pub struct AlertRepo;

impl AlertRepo {
    /// Insert a freshly opened alert.
    ///
    /// Fails with a unique violation if another open alert already exists
    /// for the same dedup key (see `uq_alerts_open_source`).
    pub async fn insert(pool: &PgPool, alert: &Alert) -> Result<AlertRow, sqlx::Error> {
        let query = format!(
            "INSERT INTO alerts ({INSERT_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, AlertRow>(&query)
            .bind(alert.tenant_id)
            .bind(&alert.source_type)
            .bind(&alert.source_id)
            .bind(&alert.alert_type)
            .bind(&alert.title)
            .bind(&alert.message)
            .bind(alert.severity.as_str())
            .bind(alert.status.as_str())
            .bind(alert.triggered_at)
            .bind(alert.escalation_level)
            .bind(alert.recurrence_count)
            .bind(alert.last_occurrence)
            .bind(alert.threshold_value)
            .bind(alert.current_value)
            .bind(serde_json::Value::Object(alert.metadata.clone()))
            .fetch_one(pool)
            .await
    }

    /// Get an alert by id, scoped to a tenant.
    pub async fn find_by_id(
        pool: &PgPool,
        tenant_id: DbId,
        id: DbId,
    ) -> Result<Option<AlertRow>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM alerts WHERE id = $1 AND tenant_id = $2");
        sqlx::query_as::<_, AlertRow>(&query)
            .bind(id)
            .bind(tenant_id)
            .fetch_optional(pool)
            .await
    }

    /// Latest non-expired alert for a dedup key: the open alert if there is
    /// one, otherwise the most recently resolved.
    pub async fn find_latest_for_key(
        pool: &PgPool,
        tenant_id: DbId,
        key: &SourceKey,
    ) -> Result<Option<AlertRow>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM alerts \
             WHERE tenant_id = $1 AND source_type = $2 AND source_id = $3 \
               AND alert_type = $4 AND status <> 'EXPIRED' \
             ORDER BY id DESC \
             LIMIT 1"
        );
        sqlx::query_as::<_, AlertRow>(&query)
            .bind(tenant_id)
            .bind(&key.source_type)
            .bind(&key.source_id)
            .bind(&key.alert_type)
            .fetch_optional(pool)
            .await
    }

    /// Write every mutable field if `version` still matches.
    ///
    /// Returns `None` when the row was changed by someone else since it was
    /// read (or no longer exists).
    pub async fn update_versioned(
        pool: &PgPool,
        alert: &Alert,
    ) -> Result<Option<AlertRow>, sqlx::Error> {
        let query = format!(
            "UPDATE alerts SET \
                 title = $3, message = $4, severity = $5, status = $6, \
                 acknowledged_at = $7, acknowledged_by = $8, resolved_at = $9, \
                 resolved_by = $10, resolution_notes = $11, auto_resolved = $12, \
                 escalation_level = $13, escalated_at = $14, suppressed_until = $15, \
                 recurrence_count = $16, last_occurrence = $17, threshold_value = $18, \
                 current_value = $19, metadata = $20, notified_level = $22, \
                 version = version + 1, updated_at = NOW() \
             WHERE id = $1 AND tenant_id = $2 AND version = $21 \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, AlertRow>(&query)
            .bind(alert.id)
            .bind(alert.tenant_id)
            .bind(&alert.title)
            .bind(&alert.message)
            .bind(alert.severity.as_str())
            .bind(alert.status.as_str())
            .bind(alert.acknowledged_at)
            .bind(alert.acknowledged_by)
            .bind(alert.resolved_at)
            .bind(alert.resolved_by)
            .bind(&alert.resolution_notes)
            .bind(alert.auto_resolved)
            .bind(alert.escalation_level)
            .bind(alert.escalated_at)
            .bind(alert.suppressed_until)
            .bind(alert.recurrence_count)
            .bind(alert.last_occurrence)
            .bind(alert.threshold_value)
            .bind(alert.current_value)
            .bind(serde_json::Value::Object(alert.metadata.clone()))
            .bind(alert.version)
            .bind(alert.notified_level)
            .fetch_optional(pool)
            .await
    }

    /// List alerts for a tenant matching `filter`, newest first.
    ///
    /// Empty filter lists match everything; a `None` limit returns all rows.
    pub async fn list(
        pool: &PgPool,
        tenant_id: DbId,
        filter: &AlertFilter,
    ) -> Result<Vec<AlertRow>, sqlx::Error> {
        let statuses: Vec<String> = filter.statuses.iter().map(|s| s.as_str().to_string()).collect();
        let severities: Vec<String> = filter
            .severities
            .iter()
            .map(|s| s.as_str().to_string())
            .collect();
        let query = format!(
            "SELECT {COLUMNS} FROM alerts \
             WHERE tenant_id = $1 \
               AND (cardinality($2::TEXT[]) = 0 OR status = ANY($2)) \
               AND (cardinality($3::TEXT[]) = 0 OR severity = ANY($3)) \
               AND (cardinality($4::TEXT[]) = 0 OR alert_type = ANY($4)) \
               AND ($5::TIMESTAMPTZ IS NULL OR triggered_at >= $5) \
               AND ($6::TIMESTAMPTZ IS NULL OR triggered_at <= $6) \
             ORDER BY triggered_at DESC, id DESC \
             LIMIT $7 OFFSET $8"
        );
        sqlx::query_as::<_, AlertRow>(&query)
            .bind(tenant_id)
            .bind(&statuses)
            .bind(&severities)
            .bind(&filter.alert_types)
            .bind(filter.triggered_from)
            .bind(filter.triggered_to)
            .bind(filter.limit)
            .bind(filter.offset.unwrap_or(0))
            .fetch_all(pool)
            .await
    }

    /// Suppressed alerts whose deadline is strictly before `now`.
    pub async fn list_expired_suppressions(
        pool: &PgPool,
        tenant_id: DbId,
        now: Timestamp,
    ) -> Result<Vec<AlertRow>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM alerts \
             WHERE tenant_id = $1 AND status = $2 AND suppressed_until < $3 \
             ORDER BY id"
        );
        sqlx::query_as::<_, AlertRow>(&query)
            .bind(tenant_id)
            .bind(AlertStatus::Suppressed.as_str())
            .bind(now)
            .fetch_all(pool)
            .await
    }

    /// Active alerts triggered before `triggered_before` and below `max_level`.
    pub async fn list_escalation_candidates(
        pool: &PgPool,
        tenant_id: DbId,
        triggered_before: Timestamp,
        max_level: i32,
    ) -> Result<Vec<AlertRow>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM alerts \
             WHERE tenant_id = $1 AND status = $2 \
               AND triggered_at < $3 AND escalation_level < $4 \
             ORDER BY triggered_at, id"
        );
        sqlx::query_as::<_, AlertRow>(&query)
            .bind(tenant_id)
            .bind(AlertStatus::Active.as_str())
            .bind(triggered_before)
            .bind(max_level)
            .fetch_all(pool)
            .await
    }

    /// Tenants that currently have at least one open alert.
    pub async fn tenants_with_open_alerts(pool: &PgPool) -> Result<Vec<DbId>, sqlx::Error> {
        sqlx::query_scalar(
            "SELECT DISTINCT tenant_id FROM alerts \
             WHERE status IN ('ACTIVE', 'ACKNOWLEDGED', 'SUPPRESSED') \
             ORDER BY tenant_id",
        )
        .fetch_all(pool)
        .await
    }
}
