//! Repository for the `notifications` table.
//!
//! Dispatch work is handed out through a lease: a claim sets `locked_until`
//! on the selected rows inside one `UPDATE ... FOR UPDATE SKIP LOCKED`, so
//! concurrent workers never pick the same row.

use beacon_core::notification::{NewNotification, Notification, NotificationFilter, NotificationStatus};
use beacon_core::types::{DbId, Timestamp};
use sqlx::PgPool;

use crate::models::notification::NotificationRow;

/// Column list for `notifications` queries.
const COLUMNS: &str = "\
    id, tenant_id, alert_id, setting_id, recipient_id, notification_type, \
    title, message, channel, status, priority_level, scheduled_at, expires_at, \
    retry_count, error_message, sent_at, delivered_at, read_at, \
    last_attempt_at, locked_until, metadata, created_at";

/// Column list for INSERT (excludes `id` and attempt-tracking columns).
const INSERT_COLUMNS: &str = "\
    tenant_id, alert_id, setting_id, recipient_id, notification_type, \
    title, message, channel, status, priority_level, scheduled_at, \
    expires_at, error_message, metadata, created_at";

/// Provides persistence and lease-based claiming for notifications.
pub struct NotificationRepo;

impl NotificationRepo {
    /// Insert a batch of notifications in one transaction, returning the rows
    /// in input order.
    pub async fn insert_batch(
        pool: &PgPool,
        batch: &[NewNotification],
    ) -> Result<Vec<NotificationRow>, sqlx::Error> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }
        let query = format!(
            "INSERT INTO notifications ({INSERT_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15) \
             RETURNING {COLUMNS}"
        );

        let mut tx = pool.begin().await?;
        let mut rows = Vec::with_capacity(batch.len());
        for n in batch {
            let row = sqlx::query_as::<_, NotificationRow>(&query)
                .bind(n.tenant_id)
                .bind(n.alert_id)
                .bind(n.setting_id)
                .bind(n.recipient_id)
                .bind(&n.notification_type)
                .bind(&n.title)
                .bind(&n.message)
                .bind(n.channel.as_str())
                .bind(n.status.as_str())
                .bind(n.priority_level)
                .bind(n.scheduled_at)
                .bind(n.expires_at)
                .bind(&n.error_message)
                .bind(serde_json::Value::Object(n.metadata.clone()))
                .bind(n.created_at)
                .fetch_one(&mut *tx)
                .await?;
            rows.push(row);
        }
        tx.commit().await?;
        Ok(rows)
    }

    /// Get a notification by id, scoped to a tenant.
    pub async fn find_by_id(
        pool: &PgPool,
        tenant_id: DbId,
        id: DbId,
    ) -> Result<Option<NotificationRow>, sqlx::Error> {
        let query =
            format!("SELECT {COLUMNS} FROM notifications WHERE id = $1 AND tenant_id = $2");
        sqlx::query_as::<_, NotificationRow>(&query)
            .bind(id)
            .bind(tenant_id)
            .fetch_optional(pool)
            .await
    }

    /// Lease up to `limit` due PENDING rows until `lease_until`.
    ///
    /// Due means scheduled at or before `now` (or unscheduled), not expired,
    /// and not leased by another worker. Rows are picked by priority, then
    /// schedule, then id.
    pub async fn claim_due(
        pool: &PgPool,
        now: Timestamp,
        lease_until: Timestamp,
        limit: i64,
    ) -> Result<Vec<NotificationRow>, sqlx::Error> {
        let query = format!(
            "UPDATE notifications SET locked_until = $2 \
             WHERE id IN ( \
                 SELECT id FROM notifications \
                 WHERE status = 'PENDING' \
                   AND (scheduled_at IS NULL OR scheduled_at <= $1) \
                   AND (expires_at IS NULL OR expires_at > $1) \
                   AND (locked_until IS NULL OR locked_until <= $1) \
                 ORDER BY priority_level, scheduled_at NULLS FIRST, id \
                 LIMIT $3 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, NotificationRow>(&query)
            .bind(now)
            .bind(lease_until)
            .bind(limit)
            .fetch_all(pool)
            .await
    }

    /// Lease specific PENDING rows (urgent hand-off right after enqueue).
    pub async fn claim_by_ids(
        pool: &PgPool,
        ids: &[DbId],
        now: Timestamp,
        lease_until: Timestamp,
    ) -> Result<Vec<NotificationRow>, sqlx::Error> {
        let query = format!(
            "UPDATE notifications SET locked_until = $3 \
             WHERE id IN ( \
                 SELECT id FROM notifications \
                 WHERE id = ANY($1) AND status = 'PENDING' \
                   AND (locked_until IS NULL OR locked_until <= $2) \
                 FOR UPDATE SKIP LOCKED \
             ) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, NotificationRow>(&query)
            .bind(ids)
            .bind(now)
            .bind(lease_until)
            .fetch_all(pool)
            .await
    }

    /// Lease FAILED rows eligible for another attempt: under `max_retries`,
    /// last attempted at or after `since`, and not past `expires_at`.
    pub async fn claim_retryable(
        pool: &PgPool,
        since: Timestamp,
        max_retries: i32,
        now: Timestamp,
        lease_until: Timestamp,
        limit: i64,
    ) -> Result<Vec<NotificationRow>, sqlx::Error> {
        let query = format!(
            "UPDATE notifications SET locked_until = $4 \
             WHERE id IN ( \
                 SELECT id FROM notifications \
                 WHERE status = 'FAILED' AND retry_count < $2 \
                   AND (last_attempt_at IS NULL OR last_attempt_at >= $1) \
                   AND (expires_at IS NULL OR expires_at > $3) \
                   AND (locked_until IS NULL OR locked_until <= $3) \
                 ORDER BY priority_level, last_attempt_at NULLS FIRST, id \
                 LIMIT $5 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, NotificationRow>(&query)
            .bind(since)
            .bind(max_retries)
            .bind(now)
            .bind(lease_until)
            .bind(limit)
            .fetch_all(pool)
            .await
    }

    /// Move a claimed row's lease to `in_flight_until` if it is still in
    /// `expected` and still carries the lease `claimed_until`.
    ///
    /// Returns `false` when another claimer has taken the row since.
    pub async fn begin_send(
        pool: &PgPool,
        id: DbId,
        expected: NotificationStatus,
        claimed_until: Timestamp,
        in_flight_until: Timestamp,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE notifications SET locked_until = $4 \
             WHERE id = $1 AND status = $2 AND locked_until = $3",
        )
        .bind(id)
        .bind(expected.as_str())
        .bind(claimed_until)
        .bind(in_flight_until)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Write the delivery-state columns if the row is still in `expected`.
    ///
    /// Returns `None` if the status changed underneath the caller.
    pub async fn update_state(
        pool: &PgPool,
        n: &Notification,
        expected: NotificationStatus,
    ) -> Result<Option<NotificationRow>, sqlx::Error> {
        let query = format!(
            "UPDATE notifications SET \
                 status = $3, retry_count = $4, error_message = $5, sent_at = $6, \
                 delivered_at = $7, read_at = $8, last_attempt_at = $9, locked_until = $10 \
             WHERE id = $1 AND tenant_id = $2 AND status = $11 \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, NotificationRow>(&query)
            .bind(n.id)
            .bind(n.tenant_id)
            .bind(n.status.as_str())
            .bind(n.retry_count)
            .bind(&n.error_message)
            .bind(n.sent_at)
            .bind(n.delivered_at)
            .bind(n.read_at)
            .bind(n.last_attempt_at)
            .bind(n.locked_until)
            .bind(expected.as_str())
            .fetch_optional(pool)
            .await
    }

    /// Cancel a PENDING row nobody holds a lease on.
    pub async fn cancel(
        pool: &PgPool,
        tenant_id: DbId,
        id: DbId,
        now: Timestamp,
    ) -> Result<Option<NotificationRow>, sqlx::Error> {
        let query = format!(
            "UPDATE notifications SET status = 'CANCELLED' \
             WHERE id = $1 AND tenant_id = $2 AND status = 'PENDING' \
               AND (locked_until IS NULL OR locked_until <= $3) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, NotificationRow>(&query)
            .bind(id)
            .bind(tenant_id)
            .bind(now)
            .fetch_optional(pool)
            .await
    }

    /// Move unleased PENDING rows whose `expires_at` has passed to EXPIRED.
    ///
    /// Returns the number of rows expired.
    pub async fn expire_stale(pool: &PgPool, now: Timestamp) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE notifications SET status = 'EXPIRED', locked_until = NULL \
             WHERE status = 'PENDING' AND expires_at <= $1 \
               AND (locked_until IS NULL OR locked_until <= $1)",
        )
        .bind(now)
        .execute(pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Count sends charged against `(setting, recipient)` since `since`.
    ///
    /// Sent-like rows count by `sent_at`; rows still queued count by
    /// `created_at`.
    pub async fn count_charged(
        pool: &PgPool,
        setting_id: DbId,
        recipient_id: DbId,
        since: Timestamp,
    ) -> Result<i64, sqlx::Error> {
        let count: Option<i64> = sqlx::query_scalar(
            "SELECT COUNT(*) FROM notifications \
             WHERE setting_id = $1 AND recipient_id = $2 \
               AND status IN ('PENDING', 'SENT', 'DELIVERED', 'READ') \
               AND COALESCE(sent_at, created_at) >= $3",
        )
        .bind(setting_id)
        .bind(recipient_id)
        .bind(since)
        .fetch_one(pool)
        .await?;
        Ok(count.unwrap_or(0))
    }

    /// List notifications for a tenant matching `filter`, newest first.
    pub async fn list(
        pool: &PgPool,
        tenant_id: DbId,
        filter: &NotificationFilter,
    ) -> Result<Vec<NotificationRow>, sqlx::Error> {
        let statuses: Vec<String> = filter.statuses.iter().map(|s| s.as_str().to_string()).collect();
        let channels: Vec<String> = filter.channels.iter().map(|c| c.as_str().to_string()).collect();
        let query = format!(
            "SELECT {COLUMNS} FROM notifications \
             WHERE tenant_id = $1 \
               AND ($2::BIGINT IS NULL OR recipient_id = $2) \
               AND ($3::BIGINT IS NULL OR alert_id = $3) \
               AND (cardinality($4::TEXT[]) = 0 OR status = ANY($4)) \
               AND (cardinality($5::TEXT[]) = 0 OR channel = ANY($5)) \
               AND ($6::TIMESTAMPTZ IS NULL OR created_at >= $6) \
               AND ($7::TIMESTAMPTZ IS NULL OR created_at <= $7) \
             ORDER BY created_at DESC, id DESC \
             LIMIT $8 OFFSET $9"
        );
        sqlx::query_as::<_, NotificationRow>(&query)
            .bind(tenant_id)
            .bind(filter.recipient_id)
            .bind(filter.alert_id)
            .bind(&statuses)
            .bind(&channels)
            .bind(filter.created_from)
            .bind(filter.created_to)
            .bind(filter.limit)
            .bind(filter.offset.unwrap_or(0))
            .fetch_all(pool)
            .await
    }

    /// Number of sent-but-unread notifications for a recipient.
    pub async fn unread_count(
        pool: &PgPool,
        tenant_id: DbId,
        recipient_id: DbId,
    ) -> Result<i64, sqlx::Error> {
        let count: Option<i64> = sqlx::query_scalar(
            "SELECT COUNT(*) FROM notifications \
             WHERE tenant_id = $1 AND recipient_id = $2 \
               AND status IN ('SENT', 'DELIVERED')",
        )
        .bind(tenant_id)
        .bind(recipient_id)
        .fetch_one(pool)
        .await?;
        Ok(count.unwrap_or(0))
    }

    /// Delete exhausted FAILED rows among `ids`. Other rows are left alone.
    pub async fn delete_dead_letters(
        pool: &PgPool,
        tenant_id: DbId,
        ids: &[DbId],
        max_retries: i32,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            "DELETE FROM notifications \
             WHERE tenant_id = $1 AND id = ANY($2) \
               AND status = 'FAILED' AND retry_count >= $3",
        )
        .bind(tenant_id)
        .bind(ids)
        .bind(max_retries)
        .execute(pool)
        .await?;
        Ok(result.rows_affected())
    }
}
