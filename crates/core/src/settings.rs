//! Notification settings: who gets notified, over which channels, and how often.

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::notification::{Channel, DEFAULT_MAX_RETRIES, PRIORITY_NORMAL};
use crate::types::{DbId, TenantId, Timestamp};

/// Default seconds between retries of a failed notification.
pub const DEFAULT_RETRY_INTERVAL_SECS: i32 = 300;

/// A row from the `notification_settings` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationSetting {
    pub id: DbId,
    pub tenant_id: TenantId,
    /// Optional scope (e.g. a building). `None` applies tenant-wide.
    pub scope_id: Option<DbId>,
    pub notification_type: String,
    pub name: String,
    pub description: Option<String>,
    pub recipient_ids: Vec<DbId>,
    pub channels: Vec<Channel>,
    pub trigger_schedule: Option<String>,
    /// Priority of sends made under this setting. Also the lowest escalation
    /// level at which its recipients join the audience.
    pub priority_level: i32,
    pub max_retries: i32,
    pub retry_interval_secs: i32,
    pub daily_limit: Option<i32>,
    pub hourly_limit: Option<i32>,
    pub is_active: bool,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl NotificationSetting {
    /// Whether this setting applies to `scope_id`.
    pub fn applies_to(&self, scope_id: Option<DbId>) -> bool {
        match (self.scope_id, scope_id) {
            (None, _) => true,
            (Some(own), Some(requested)) => own == requested,
            (Some(_), None) => false,
        }
    }
}

/// DTO for creating a notification setting.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateSetting {
    pub scope_id: Option<DbId>,
    #[validate(length(min = 1, max = 50))]
    pub notification_type: String,
    #[validate(length(min = 1, max = 200))]
    pub name: String,
    pub description: Option<String>,
    #[validate(length(min = 1))]
    pub recipient_ids: Vec<DbId>,
    #[validate(length(min = 1))]
    pub channels: Vec<Channel>,
    pub trigger_schedule: Option<String>,
    #[validate(range(min = 1, max = 5))]
    #[serde(default = "default_priority")]
    pub priority_level: i32,
    #[validate(range(min = 0, max = 10))]
    #[serde(default = "default_max_retries")]
    pub max_retries: i32,
    #[validate(range(min = 0))]
    #[serde(default = "default_retry_interval")]
    pub retry_interval_secs: i32,
    #[validate(range(min = 1))]
    pub daily_limit: Option<i32>,
    #[validate(range(min = 1))]
    pub hourly_limit: Option<i32>,
}

fn default_priority() -> i32 {
    PRIORITY_NORMAL
}

fn default_max_retries() -> i32 {
    DEFAULT_MAX_RETRIES
}

fn default_retry_interval() -> i32 {
    DEFAULT_RETRY_INTERVAL_SECS
}

impl CreateSetting {
    pub fn new(
        notification_type: impl Into<String>,
        name: impl Into<String>,
        recipient_ids: Vec<DbId>,
        channels: Vec<Channel>,
    ) -> Self {
        Self {
            scope_id: None,
            notification_type: notification_type.into(),
            name: name.into(),
            description: None,
            recipient_ids,
            channels,
            trigger_schedule: None,
            priority_level: PRIORITY_NORMAL,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_interval_secs: DEFAULT_RETRY_INTERVAL_SECS,
            daily_limit: None,
            hourly_limit: None,
        }
    }
}

/// DTO for updating a notification setting. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct UpdateSetting {
    #[validate(length(min = 1, max = 200))]
    pub name: Option<String>,
    pub description: Option<String>,
    #[validate(length(min = 1))]
    pub recipient_ids: Option<Vec<DbId>>,
    #[validate(length(min = 1))]
    pub channels: Option<Vec<Channel>>,
    pub trigger_schedule: Option<String>,
    #[validate(range(min = 1, max = 5))]
    pub priority_level: Option<i32>,
    #[validate(range(min = 0, max = 10))]
    pub max_retries: Option<i32>,
    #[validate(range(min = 1))]
    pub daily_limit: Option<i32>,
    #[validate(range(min = 1))]
    pub hourly_limit: Option<i32>,
}

impl UpdateSetting {
    pub fn apply(&self, setting: &mut NotificationSetting) {
        if let Some(name) = &self.name {
            setting.name = name.clone();
        }
        if let Some(description) = &self.description {
            setting.description = Some(description.clone());
        }
        if let Some(recipients) = &self.recipient_ids {
            setting.recipient_ids = recipients.clone();
        }
        if let Some(channels) = &self.channels {
            setting.channels = channels.clone();
        }
        if let Some(schedule) = &self.trigger_schedule {
            setting.trigger_schedule = Some(schedule.clone());
        }
        if let Some(priority) = self.priority_level {
            setting.priority_level = priority;
        }
        if let Some(max_retries) = self.max_retries {
            setting.max_retries = max_retries;
        }
        if self.daily_limit.is_some() {
            setting.daily_limit = self.daily_limit;
        }
        if self.hourly_limit.is_some() {
            setting.hourly_limit = self.hourly_limit;
        }
    }
}

/// Active settings for `notification_type` that apply to `scope_id`.
pub fn matching<'a>(
    settings: &'a [NotificationSetting],
    notification_type: &str,
    scope_id: Option<DbId>,
) -> impl Iterator<Item = &'a NotificationSetting> + 'a {
    let notification_type = notification_type.to_string();
    settings.iter().filter(move |s| {
        s.is_active && s.notification_type == notification_type && s.applies_to(scope_id)
    })
}

/// De-duplicated recipients across `settings`, in first-seen order.
pub fn union_recipients<'a>(settings: impl IntoIterator<Item = &'a NotificationSetting>) -> Vec<DbId> {
    let mut out: Vec<DbId> = Vec::new();
    for setting in settings {
        for id in &setting.recipient_ids {
            if !out.contains(id) {
                out.push(*id);
            }
        }
    }
    out
}

/// De-duplicated channels across `settings`, in first-seen order.
pub fn union_channels<'a>(settings: impl IntoIterator<Item = &'a NotificationSetting>) -> Vec<Channel> {
    let mut out: Vec<Channel> = Vec::new();
    for setting in settings {
        for channel in &setting.channels {
            if !out.contains(channel) {
                out.push(*channel);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    fn setting(id: DbId, scope_id: Option<DbId>, recipients: Vec<DbId>) -> NotificationSetting {
        NotificationSetting {
            id,
            tenant_id: 1,
            scope_id,
            notification_type: "FACILITY_ALERT".into(),
            name: format!("setting {id}"),
            description: None,
            recipient_ids: recipients,
            channels: vec![Channel::Email],
            trigger_schedule: None,
            priority_level: PRIORITY_NORMAL,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_interval_secs: DEFAULT_RETRY_INTERVAL_SECS,
            daily_limit: None,
            hourly_limit: None,
            is_active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn tenant_wide_setting_applies_everywhere() {
        let s = setting(1, None, vec![1]);
        assert!(s.applies_to(None));
        assert!(s.applies_to(Some(5)));
    }

    #[test]
    fn scoped_setting_applies_only_to_its_scope() {
        let s = setting(1, Some(5), vec![1]);
        assert!(s.applies_to(Some(5)));
        assert!(!s.applies_to(Some(6)));
        assert!(!s.applies_to(None));
    }

    #[test]
    fn matching_skips_inactive_and_other_types() {
        let mut inactive = setting(2, None, vec![2]);
        inactive.is_active = false;
        let mut other = setting(3, None, vec![3]);
        other.notification_type = "PAYMENT_DUE".into();
        let all = vec![setting(1, None, vec![1]), inactive, other];
        let ids: Vec<DbId> = matching(&all, "FACILITY_ALERT", None).map(|s| s.id).collect();
        assert_eq!(ids, vec![1]);
    }

    #[test]
    fn recipient_union_is_deduplicated() {
        let all = vec![setting(1, None, vec![1, 2]), setting(2, None, vec![2, 3])];
        assert_eq!(union_recipients(&all), vec![1, 2, 3]);
    }

    #[test]
    fn update_applies_only_present_fields() {
        let mut s = setting(1, None, vec![1]);
        UpdateSetting {
            hourly_limit: Some(4),
            channels: Some(vec![Channel::Sms]),
            ..Default::default()
        }
        .apply(&mut s);
        assert_eq!(s.hourly_limit, Some(4));
        assert_eq!(s.channels, vec![Channel::Sms]);
        assert_eq!(s.name, "setting 1");
    }

    #[test]
    fn create_requires_recipients_and_channels() {
        let dto = CreateSetting::new("FACILITY_ALERT", "Boilers", vec![], vec![Channel::Sms]);
        assert!(dto.validate().is_err());
        let dto = CreateSetting::new("FACILITY_ALERT", "Boilers", vec![1], vec![Channel::Sms]);
        assert!(dto.validate().is_ok());
    }
}
