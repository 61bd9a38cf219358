//! Notification setting row model.

use beacon_core::error::CoreError;
use beacon_core::notification::Channel;
use beacon_core::settings::NotificationSetting;
use beacon_core::types::{DbId, Timestamp};
use serde::Serialize;
use sqlx::FromRow;

/// A row from the `notification_settings` table. `channels` is a `TEXT[]`.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct NotificationSettingRow {
    pub id: DbId,
    pub tenant_id: DbId,
    pub scope_id: Option<DbId>,
    pub notification_type: String,
    pub name: String,
    pub description: Option<String>,
    pub recipient_ids: Vec<DbId>,
    pub channels: Vec<String>,
    pub trigger_schedule: Option<String>,
    pub priority_level: i32,
    pub max_retries: i32,
    pub retry_interval_secs: i32,
    pub daily_limit: Option<i32>,
    pub hourly_limit: Option<i32>,
    pub is_active: bool,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl TryFrom<NotificationSettingRow> for NotificationSetting {
    type Error = CoreError;

    fn try_from(row: NotificationSettingRow) -> Result<Self, Self::Error> {
        let channels = row
            .channels
            .iter()
            .map(|c| c.parse::<Channel>())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(NotificationSetting {
            id: row.id,
            tenant_id: row.tenant_id,
            scope_id: row.scope_id,
            notification_type: row.notification_type,
            name: row.name,
            description: row.description,
            recipient_ids: row.recipient_ids,
            channels,
            trigger_schedule: row.trigger_schedule,
            priority_level: row.priority_level,
            max_retries: row.max_retries,
            retry_interval_secs: row.retry_interval_secs,
            daily_limit: row.daily_limit,
            hourly_limit: row.hourly_limit,
            is_active: row.is_active,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Text form of a channel set for binding to a `TEXT[]` column.
pub fn channel_names(channels: &[Channel]) -> Vec<String> {
    channels.iter().map(|c| c.as_str().to_string()).collect()
}
