//! Notification row model.

use beacon_core::error::CoreError;
use beacon_core::notification::Notification;
use beacon_core::types::{DbId, Timestamp};
use serde::Serialize;
use sqlx::FromRow;

use super::metadata_from_json;

/// A row from the `notifications` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct NotificationRow {
    pub id: DbId,
    pub tenant_id: DbId,
    pub alert_id: Option<DbId>,
    pub setting_id: Option<DbId>,
    pub recipient_id: DbId,
    pub notification_type: String,
    pub title: String,
    pub message: String,
    pub channel: String,
    pub status: String,
    pub priority_level: i32,
    pub scheduled_at: Option<Timestamp>,
    pub expires_at: Option<Timestamp>,
    pub retry_count: i32,
    pub error_message: Option<String>,
    pub sent_at: Option<Timestamp>,
    pub delivered_at: Option<Timestamp>,
    pub read_at: Option<Timestamp>,
    pub last_attempt_at: Option<Timestamp>,
    pub locked_until: Option<Timestamp>,
    pub metadata: serde_json::Value,
    pub created_at: Timestamp,
}

impl TryFrom<NotificationRow> for Notification {
    type Error = CoreError;

    fn try_from(row: NotificationRow) -> Result<Self, Self::Error> {
        Ok(Notification {
            id: row.id,
            tenant_id: row.tenant_id,
            alert_id: row.alert_id,
            setting_id: row.setting_id,
            recipient_id: row.recipient_id,
            notification_type: row.notification_type,
            title: row.title,
            message: row.message,
            channel: row.channel.parse()?,
            status: row.status.parse()?,
            priority_level: row.priority_level,
            scheduled_at: row.scheduled_at,
            expires_at: row.expires_at,
            retry_count: row.retry_count,
            error_message: row.error_message,
            sent_at: row.sent_at,
            delivered_at: row.delivered_at,
            read_at: row.read_at,
            last_attempt_at: row.last_attempt_at,
            locked_until: row.locked_until,
            metadata: metadata_from_json(row.metadata),
            created_at: row.created_at,
        })
    }
}
