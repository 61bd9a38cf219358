//! Repository for the `notification_settings` table.

use beacon_core::settings::{CreateSetting, NotificationSetting};
use beacon_core::types::DbId;
use sqlx::PgPool;

use crate::models::setting::{channel_names, NotificationSettingRow};

/// Column list for `notification_settings` queries.
const COLUMNS: &str = "\
    id, tenant_id, scope_id, notification_type, name, description, \
    recipient_ids, channels, trigger_schedule, priority_level, max_retries, \
    retry_interval_secs, daily_limit, hourly_limit, is_active, \
    created_at, updated_at";

/// Column list for INSERT (excludes auto-generated columns).
const INSERT_COLUMNS: &str = "\
    tenant_id, scope_id, notification_type, name, description, \
    recipient_ids, channels, trigger_schedule, priority_level, max_retries, \
    retry_interval_secs, daily_limit, hourly_limit";

/// Provides CRUD operations for notification settings.
pub struct NotificationSettingRepo;

impl NotificationSettingRepo {
    pub async fn create(
        pool: &PgPool,
        tenant_id: DbId,
        dto: &CreateSetting,
    ) -> Result<NotificationSettingRow, sqlx::Error> {
        let query = format!(
            "INSERT INTO notification_settings ({INSERT_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, NotificationSettingRow>(&query)
            .bind(tenant_id)
            .bind(dto.scope_id)
            .bind(&dto.notification_type)
            .bind(&dto.name)
            .bind(&dto.description)
            .bind(&dto.recipient_ids)
            .bind(channel_names(&dto.channels))
            .bind(&dto.trigger_schedule)
            .bind(dto.priority_level)
            .bind(dto.max_retries)
            .bind(dto.retry_interval_secs)
            .bind(dto.daily_limit)
            .bind(dto.hourly_limit)
            .fetch_one(pool)
            .await
    }

    pub async fn find_by_id(
        pool: &PgPool,
        tenant_id: DbId,
        id: DbId,
    ) -> Result<Option<NotificationSettingRow>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM notification_settings WHERE id = $1 AND tenant_id = $2"
        );
        sqlx::query_as::<_, NotificationSettingRow>(&query)
            .bind(id)
            .bind(tenant_id)
            .fetch_optional(pool)
            .await
    }

    /// Persist an already-patched setting. Returns `None` if it no longer exists.
    pub async fn update(
        pool: &PgPool,
        setting: &NotificationSetting,
    ) -> Result<Option<NotificationSettingRow>, sqlx::Error> {
        let query = format!(
            "UPDATE notification_settings SET \
                 name = $3, description = $4, recipient_ids = $5, channels = $6, \
                 trigger_schedule = $7, priority_level = $8, max_retries = $9, \
                 retry_interval_secs = $10, daily_limit = $11, hourly_limit = $12, \
                 is_active = $13, updated_at = NOW() \
             WHERE id = $1 AND tenant_id = $2 \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, NotificationSettingRow>(&query)
            .bind(setting.id)
            .bind(setting.tenant_id)
            .bind(&setting.name)
            .bind(&setting.description)
            .bind(&setting.recipient_ids)
            .bind(channel_names(&setting.channels))
            .bind(&setting.trigger_schedule)
            .bind(setting.priority_level)
            .bind(setting.max_retries)
            .bind(setting.retry_interval_secs)
            .bind(setting.daily_limit)
            .bind(setting.hourly_limit)
            .bind(setting.is_active)
            .fetch_optional(pool)
            .await
    }

    /// Flip `is_active`. Returns the updated row, or `None` if not found.
    pub async fn toggle(
        pool: &PgPool,
        tenant_id: DbId,
        id: DbId,
    ) -> Result<Option<NotificationSettingRow>, sqlx::Error> {
        let query = format!(
            "UPDATE notification_settings \
             SET is_active = NOT is_active, updated_at = NOW() \
             WHERE id = $1 AND tenant_id = $2 \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, NotificationSettingRow>(&query)
            .bind(id)
            .bind(tenant_id)
            .fetch_optional(pool)
            .await
    }

    /// Delete a setting. Returns `true` if a row was removed.
    pub async fn delete(pool: &PgPool, tenant_id: DbId, id: DbId) -> Result<bool, sqlx::Error> {
        let result =
            sqlx::query("DELETE FROM notification_settings WHERE id = $1 AND tenant_id = $2")
                .bind(id)
                .bind(tenant_id)
                .execute(pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Active settings for a notification type, lowest priority level first.
    pub async fn list_active_by_type(
        pool: &PgPool,
        tenant_id: DbId,
        notification_type: &str,
    ) -> Result<Vec<NotificationSettingRow>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM notification_settings \
             WHERE tenant_id = $1 AND notification_type = $2 AND is_active \
             ORDER BY priority_level, id"
        );
        sqlx::query_as::<_, NotificationSettingRow>(&query)
            .bind(tenant_id)
            .bind(notification_type)
            .fetch_all(pool)
            .await
    }
}
