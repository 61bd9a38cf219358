//! Repository for the append-only `alert_events` table.

use beacon_core::types::DbId;
use sqlx::PgPool;

use crate::models::audit::{AuditEventRow, CreateAuditEvent};

/// Column list for `alert_events` queries.
const COLUMNS: &str = "\
    id, tenant_id, event_type, entity_type, entity_id, actor_id, \
    payload, occurred_at, created_at";

/// Provides insert and query operations for audit events.
pub struct AuditEventRepo;

impl AuditEventRepo {
    /// Insert an event, returning its id.
    pub async fn insert(pool: &PgPool, event: &CreateAuditEvent) -> Result<DbId, sqlx::Error> {
        sqlx::query_scalar(
            "INSERT INTO alert_events \
                 (tenant_id, event_type, entity_type, entity_id, actor_id, payload, occurred_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             RETURNING id",
        )
        .bind(event.tenant_id)
        .bind(&event.event_type)
        .bind(&event.entity_type)
        .bind(event.entity_id)
        .bind(event.actor_id)
        .bind(&event.payload)
        .bind(event.occurred_at)
        .fetch_one(pool)
        .await
    }

    /// Events recorded for one entity, newest first.
    pub async fn list_for_entity(
        pool: &PgPool,
        entity_type: &str,
        entity_id: DbId,
        limit: i64,
    ) -> Result<Vec<AuditEventRow>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM alert_events \
             WHERE entity_type = $1 AND entity_id = $2 \
             ORDER BY occurred_at DESC, id DESC \
             LIMIT $3"
        );
        sqlx::query_as::<_, AuditEventRow>(&query)
            .bind(entity_type)
            .bind(entity_id)
            .bind(limit)
            .fetch_all(pool)
            .await
    }
}
