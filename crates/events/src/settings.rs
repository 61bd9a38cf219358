//! Settings, templates and rate-limit decisions.
//!
//! [`SettingsMatcher`] is the engine's view of `notification_settings` and
//! `notification_templates`: CRUD with validation, recipient/channel
//! resolution for a notification type, template selection and rendering,
//! and per-recipient rate checks.

use std::sync::Arc;

use beacon_core::error::CoreError;
use beacon_core::notification::{Channel, NotificationStatus};
use beacon_core::rate_limit::{self, RateCeiling, RateDecision, RateWindow, SendCounts};
use beacon_core::settings::{self, CreateSetting, NotificationSetting, UpdateSetting};
use beacon_core::template::{self, CreateTemplate, Template, Variables};
use beacon_core::types::{DbId, TenantId, Timestamp};
use validator::Validate;

use crate::error::EngineResult;
use crate::store::{NotificationStore, SettingStore};

/// Title and body ready to store on a notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedContent {
    pub title: String,
    pub message: String,
    /// Template used, if any.
    pub template_id: Option<DbId>,
}

impl RenderedContent {
    pub fn literal(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            message: message.into(),
            template_id: None,
        }
    }

    fn from_template(t: &Template, vars: &Variables, fallback_title: &str) -> Self {
        Self {
            title: t
                .render_subject(vars)
                .unwrap_or_else(|| fallback_title.to_string()),
            message: t.render_body(vars),
            template_id: Some(t.id),
        }
    }
}

/// Recipients and channels resolved for `(tenant, type, scope)`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Audience {
    pub settings: Vec<NotificationSetting>,
    pub recipient_ids: Vec<DbId>,
    pub channels: Vec<Channel>,
}

#[derive(Clone)]
pub struct SettingsMatcher {
    settings: Arc<dyn SettingStore>,
    notifications: Arc<dyn NotificationStore>,
    default_language: String,
}

impl SettingsMatcher {
    pub fn new(
        settings: Arc<dyn SettingStore>,
        notifications: Arc<dyn NotificationStore>,
        default_language: impl Into<String>,
    ) -> Self {
        Self {
            settings,
            notifications,
            default_language: default_language.into(),
        }
    }

    // -----------------------------------------------------------------------
    // Settings CRUD
    // -----------------------------------------------------------------------

    pub async fn create_setting(
        &self,
        tenant_id: TenantId,
        dto: &CreateSetting,
    ) -> EngineResult<NotificationSetting> {
        dto.validate()?;
        let setting = self.settings.create_setting(tenant_id, dto).await?;
        tracing::info!(
            tenant_id,
            setting_id = setting.id,
            notification_type = %setting.notification_type,
            "Notification setting created"
        );
        Ok(setting)
    }

    pub async fn get_setting(
        &self,
        tenant_id: TenantId,
        id: DbId,
    ) -> EngineResult<NotificationSetting> {
        self.settings
            .get_setting(tenant_id, id)
            .await?
            .ok_or_else(|| setting_not_found(id))
    }

    pub async fn update_setting(
        &self,
        tenant_id: TenantId,
        id: DbId,
        dto: &UpdateSetting,
    ) -> EngineResult<NotificationSetting> {
        dto.validate()?;
        let mut setting = self.get_setting(tenant_id, id).await?;
        dto.apply(&mut setting);
        self.settings
            .update_setting(&setting)
            .await?
            .ok_or_else(|| setting_not_found(id))
    }

    pub async fn toggle_setting(
        &self,
        tenant_id: TenantId,
        id: DbId,
    ) -> EngineResult<NotificationSetting> {
        let setting = self
            .settings
            .toggle_setting(tenant_id, id)
            .await?
            .ok_or_else(|| setting_not_found(id))?;
        tracing::info!(tenant_id, setting_id = id, is_active = setting.is_active, "Setting toggled");
        Ok(setting)
    }

    pub async fn delete_setting(&self, tenant_id: TenantId, id: DbId) -> EngineResult<()> {
        if !self.settings.delete_setting(tenant_id, id).await? {
            return Err(setting_not_found(id));
        }
        Ok(())
    }

    /// Active settings for a type, lowest priority level first.
    pub async fn active_settings(
        &self,
        tenant_id: TenantId,
        notification_type: &str,
    ) -> EngineResult<Vec<NotificationSetting>> {
        self.settings.active_settings(tenant_id, notification_type).await
    }

    /// Settings, recipients and channels that apply to `scope_id`.
    pub async fn audience(
        &self,
        tenant_id: TenantId,
        notification_type: &str,
        scope_id: Option<DbId>,
    ) -> EngineResult<Audience> {
        let active = self.active_settings(tenant_id, notification_type).await?;
        let applicable: Vec<NotificationSetting> =
            settings::matching(&active, notification_type, scope_id)
                .cloned()
                .collect();
        Ok(Audience {
            recipient_ids: settings::union_recipients(&applicable),
            channels: settings::union_channels(&applicable),
            settings: applicable,
        })
    }

    // -----------------------------------------------------------------------
    // Templates
    // -----------------------------------------------------------------------

    pub async fn create_template(
        &self,
        tenant_id: TenantId,
        dto: &CreateTemplate,
    ) -> EngineResult<Template> {
        dto.validate()?;
        self.settings.create_template(tenant_id, dto).await
    }

    pub async fn get_template(&self, tenant_id: TenantId, id: DbId) -> EngineResult<Template> {
        self.settings
            .get_template(tenant_id, id)
            .await?
            .ok_or_else(|| template_not_found(id))
    }

    /// Template for `(type, channel, language)`, falling back to the default
    /// for `(type, channel)`.
    pub async fn find_template(
        &self,
        tenant_id: TenantId,
        template_type: &str,
        channel: Channel,
        language: Option<&str>,
    ) -> EngineResult<Option<Template>> {
        let candidates = self
            .settings
            .templates_for(tenant_id, template_type, channel)
            .await?;
        let language = language.unwrap_or(self.default_language.as_str());
        Ok(template::select(&candidates, template_type, channel, language).cloned())
    }

    pub async fn set_default_template(
        &self,
        tenant_id: TenantId,
        id: DbId,
    ) -> EngineResult<Template> {
        self.settings
            .set_default_template(tenant_id, id)
            .await?
            .ok_or_else(|| template_not_found(id))
    }

    /// Render a specific template.
    pub async fn render_template(
        &self,
        tenant_id: TenantId,
        template_id: DbId,
        vars: &Variables,
    ) -> EngineResult<RenderedContent> {
        let t = self.get_template(tenant_id, template_id).await?;
        Ok(RenderedContent::from_template(&t, vars, &t.name))
    }

    /// Render the template selected for `(type, channel, language)`, or the
    /// literal title and message when none exists.
    pub async fn render_for(
        &self,
        tenant_id: TenantId,
        template_type: &str,
        channel: Channel,
        language: Option<&str>,
        vars: &Variables,
        fallback: RenderedContent,
    ) -> EngineResult<RenderedContent> {
        match self
            .find_template(tenant_id, template_type, channel, language)
            .await?
        {
            Some(t) => Ok(RenderedContent::from_template(&t, vars, &fallback.title)),
            None => {
                tracing::debug!(
                    tenant_id,
                    template_type,
                    channel = %channel,
                    "No template found, using literal text"
                );
                Ok(fallback)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Rate limiting
    // -----------------------------------------------------------------------

    /// Sends already charged against `(setting, recipient)` in the trailing
    /// hour and day.
    pub async fn send_counts(
        &self,
        setting: &NotificationSetting,
        recipient_id: DbId,
        now: Timestamp,
    ) -> EngineResult<SendCounts> {
        let ceiling = RateCeiling::from(setting);
        if ceiling.is_unlimited() {
            return Ok(SendCounts::default());
        }
        let last_hour = self
            .notifications
            .count_charged(setting.id, recipient_id, RateWindow::Hourly.start(now))
            .await?;
        let last_day = self
            .notifications
            .count_charged(setting.id, recipient_id, RateWindow::Daily.start(now))
            .await?;
        Ok(SendCounts {
            last_hour,
            last_day,
        })
    }

    /// Whether one more send to `recipient_id` under `setting` is allowed.
    pub async fn rate_decision(
        &self,
        setting: &NotificationSetting,
        recipient_id: DbId,
        now: Timestamp,
    ) -> EngineResult<RateDecision> {
        let counts = self.send_counts(setting, recipient_id, now).await?;
        Ok(rate_limit::check(RateCeiling::from(setting), counts))
    }
}

/// Status a new row gets under `decision`.
pub fn initial_status(decision: &RateDecision) -> NotificationStatus {
    if decision.is_allowed() {
        NotificationStatus::Pending
    } else {
        NotificationStatus::SuppressedByRateLimit
    }
}

fn setting_not_found(id: DbId) -> crate::error::EngineError {
    CoreError::NotFound {
        entity: "NotificationSetting",
        id,
    }
    .into()
}

fn template_not_found(id: DbId) -> crate::error::EngineError {
    CoreError::NotFound {
        entity: "NotificationTemplate",
        id,
    }
    .into()
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use beacon_core::notification::{NewNotification, PRIORITY_NORMAL};
    use beacon_core::types::Metadata;
    use chrono::{Duration, TimeZone, Utc};

    use super::*;
    use crate::store::MemoryStore;

    fn t0() -> Timestamp {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()
    }

    fn matcher() -> (SettingsMatcher, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (SettingsMatcher::new(store.clone(), store.clone(), "en"), store)
    }

    fn template_dto(language: &str, is_default: bool) -> CreateTemplate {
        CreateTemplate {
            name: format!("budget-{language}"),
            template_type: "BUDGET_THRESHOLD".into(),
            channel: Channel::Email,
            language_code: language.into(),
            subject_template: Some("Budget {{budget}} at {{usage}}%".into()),
            body_template: "[{{lang}}] {{budget}} reached {{usage}}%".into(),
            is_default,
        }
    }

    fn vars() -> Variables {
        [("budget", "HVAC"), ("usage", "85"), ("lang", "x")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn invalid_setting_is_rejected() {
        let (matcher, _) = matcher();
        let dto = CreateSetting::new("BUDGET_THRESHOLD", "Finance", vec![], vec![Channel::Email]);
        let err = matcher.create_setting(1, &dto).await.unwrap_err();
        assert_matches!(err, crate::error::EngineError::Core(CoreError::Validation(_)));
    }

    #[tokio::test]
    async fn update_toggle_and_delete_missing_setting_report_not_found() {
        let (matcher, _) = matcher();
        assert!(matcher.toggle_setting(1, 99).await.unwrap_err().is_not_found());
        assert!(matcher.delete_setting(1, 99).await.unwrap_err().is_not_found());
        assert!(matcher
            .update_setting(1, 99, &UpdateSetting::default())
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn toggled_setting_leaves_the_audience() {
        let (matcher, _) = matcher();
        let a = matcher
            .create_setting(
                1,
                &CreateSetting::new("BUDGET_THRESHOLD", "Finance", vec![1, 2], vec![Channel::Email]),
            )
            .await
            .unwrap();
        matcher
            .create_setting(
                1,
                &CreateSetting::new("BUDGET_THRESHOLD", "Ops", vec![2, 3], vec![Channel::Sms]),
            )
            .await
            .unwrap();

        let audience = matcher.audience(1, "BUDGET_THRESHOLD", None).await.unwrap();
        assert_eq!(audience.recipient_ids, vec![1, 2, 3]);
        assert_eq!(audience.channels, vec![Channel::Email, Channel::Sms]);

        matcher.toggle_setting(1, a.id).await.unwrap();
        let audience = matcher.audience(1, "BUDGET_THRESHOLD", None).await.unwrap();
        assert_eq!(audience.recipient_ids, vec![2, 3]);
    }

    #[tokio::test]
    async fn language_match_then_default_then_literal() {
        let (matcher, _) = matcher();
        let en = matcher.create_template(1, &template_dto("en", true)).await.unwrap();
        let ko = matcher.create_template(1, &template_dto("ko", false)).await.unwrap();

        let found = matcher
            .find_template(1, "BUDGET_THRESHOLD", Channel::Email, Some("ko"))
            .await
            .unwrap();
        assert_eq!(found.map(|t| t.id), Some(ko.id));

        let found = matcher
            .find_template(1, "BUDGET_THRESHOLD", Channel::Email, Some("fr"))
            .await
            .unwrap();
        assert_eq!(found.map(|t| t.id), Some(en.id));

        let rendered = matcher
            .render_for(
                1,
                "BUDGET_THRESHOLD",
                Channel::Sms,
                None,
                &vars(),
                RenderedContent::literal("Budget alert", "Usage high"),
            )
            .await
            .unwrap();
        assert_eq!(rendered, RenderedContent::literal("Budget alert", "Usage high"));

        let rendered = matcher
            .render_for(
                1,
                "BUDGET_THRESHOLD",
                Channel::Email,
                None,
                &vars(),
                RenderedContent::literal("Budget alert", "Usage high"),
            )
            .await
            .unwrap();
        assert_eq!(rendered.title, "Budget HVAC at 85%");
        assert_eq!(rendered.message, "[x] HVAC reached 85%");
        assert_eq!(rendered.template_id, Some(en.id));
    }

    #[tokio::test]
    async fn rate_decision_counts_recent_sends() {
        let (matcher, store) = matcher();
        let mut dto = CreateSetting::new("BUDGET_THRESHOLD", "Finance", vec![7], vec![Channel::Sms]);
        dto.hourly_limit = Some(2);
        let setting = matcher.create_setting(1, &dto).await.unwrap();

        let row = |created_at| NewNotification {
            tenant_id: 1,
            alert_id: None,
            setting_id: Some(setting.id),
            recipient_id: 7,
            notification_type: "BUDGET_THRESHOLD".into(),
            title: "t".into(),
            message: "m".into(),
            channel: Channel::Sms,
            status: NotificationStatus::Pending,
            priority_level: PRIORITY_NORMAL,
            scheduled_at: None,
            expires_at: None,
            error_message: None,
            metadata: Metadata::new(),
            created_at,
        };
        store
            .insert_notifications(&[row(t0() - Duration::hours(2)), row(t0() - Duration::minutes(10))])
            .await
            .unwrap();

        let decision = matcher.rate_decision(&setting, 7, t0()).await.unwrap();
        assert!(decision.is_allowed());

        store
            .insert_notifications(&[row(t0() - Duration::minutes(5))])
            .await
            .unwrap();
        let decision = matcher.rate_decision(&setting, 7, t0()).await.unwrap();
        assert_matches!(
            decision,
            RateDecision::Exceeded {
                window: RateWindow::Hourly,
                limit: 2,
                count: 2
            }
        );
        assert_eq!(initial_status(&decision), NotificationStatus::SuppressedByRateLimit);
    }
}
