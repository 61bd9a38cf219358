//! Postgres-backed stores over the `beacon-db` repositories.

use async_trait::async_trait;
use beacon_core::alert::{Alert, AlertFilter, SourceKey};
use beacon_core::error::CoreError;
use beacon_core::notification::{
    Channel, NewNotification, Notification, NotificationFilter, NotificationStatus,
};
use beacon_core::settings::{CreateSetting, NotificationSetting};
use beacon_core::template::{CreateTemplate, Template};
use beacon_core::types::{DbId, TenantId, Timestamp};
use beacon_db::repositories::{AlertRepo, NotificationRepo, NotificationSettingRepo, TemplateRepo};
use beacon_db::DbPool;

use super::{AlertStore, NotificationStore, SettingStore};
use crate::error::{EngineError, EngineResult};

pub struct PgStore {
    pool: DbPool,
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

/// Convert a batch of rows into domain records.
fn convert<R, T>(rows: Vec<R>) -> EngineResult<Vec<T>>
where
    T: TryFrom<R, Error = CoreError>,
{
    rows.into_iter()
        .map(|row| T::try_from(row).map_err(EngineError::from))
        .collect()
}

fn convert_opt<R, T>(row: Option<R>) -> EngineResult<Option<T>>
where
    T: TryFrom<R, Error = CoreError>,
{
    row.map(T::try_from).transpose().map_err(EngineError::from)
}

/// Map a unique violation on `uq_alerts_open_source` to a conflict.
fn open_alert_conflict(err: sqlx::Error, key: &SourceKey) -> EngineError {
    if beacon_db::is_unique_violation(&err) {
        CoreError::Conflict(format!("An open alert already exists for {key}")).into()
    } else {
        err.into()
    }
}

#[async_trait]
impl AlertStore for PgStore {
    async fn insert_alert(&self, alert: &Alert) -> EngineResult<Alert> {
        let row = AlertRepo::insert(&self.pool, alert)
            .await
            .map_err(|e| open_alert_conflict(e, &alert.key()))?;
        Ok(Alert::try_from(row)?)
    }

    async fn get_alert(&self, tenant_id: TenantId, id: DbId) -> EngineResult<Option<Alert>> {
        convert_opt(AlertRepo::find_by_id(&self.pool, tenant_id, id).await?)
    }

    async fn find_latest_for_key(
        &self,
        tenant_id: TenantId,
        key: &SourceKey,
    ) -> EngineResult<Option<Alert>> {
        convert_opt(AlertRepo::find_latest_for_key(&self.pool, tenant_id, key).await?)
    }

    async fn update_alert(&self, alert: &Alert) -> EngineResult<Option<Alert>> {
        let row = AlertRepo::update_versioned(&self.pool, alert)
            .await
            .map_err(|e| open_alert_conflict(e, &alert.key()))?;
        convert_opt(row)
    }

    async fn list_alerts(
        &self,
        tenant_id: TenantId,
        filter: &AlertFilter,
    ) -> EngineResult<Vec<Alert>> {
        convert(AlertRepo::list(&self.pool, tenant_id, filter).await?)
    }

    async fn list_expired_suppressions(
        &self,
        tenant_id: TenantId,
        now: Timestamp,
    ) -> EngineResult<Vec<Alert>> {
        convert(AlertRepo::list_expired_suppressions(&self.pool, tenant_id, now).await?)
    }

    async fn list_escalation_candidates(
        &self,
        tenant_id: TenantId,
        triggered_before: Timestamp,
        max_level: i32,
    ) -> EngineResult<Vec<Alert>> {
        convert(
            AlertRepo::list_escalation_candidates(&self.pool, tenant_id, triggered_before, max_level)
                .await?,
        )
    }

    async fn tenants_with_open_alerts(&self) -> EngineResult<Vec<TenantId>> {
        Ok(AlertRepo::tenants_with_open_alerts(&self.pool).await?)
    }
}

#[async_trait]
impl NotificationStore for PgStore {
    async fn insert_notifications(
        &self,
        batch: &[NewNotification],
    ) -> EngineResult<Vec<Notification>> {
        convert(NotificationRepo::insert_batch(&self.pool, batch).await?)
    }

    async fn get_notification(
        &self,
        tenant_id: TenantId,
        id: DbId,
    ) -> EngineResult<Option<Notification>> {
        convert_opt(NotificationRepo::find_by_id(&self.pool, tenant_id, id).await?)
    }

    async fn claim_due(
        &self,
        now: Timestamp,
        lease_until: Timestamp,
        limit: i64,
    ) -> EngineResult<Vec<Notification>> {
        convert(NotificationRepo::claim_due(&self.pool, now, lease_until, limit).await?)
    }

    async fn claim_by_ids(
        &self,
        ids: &[DbId],
        now: Timestamp,
        lease_until: Timestamp,
    ) -> EngineResult<Vec<Notification>> {
        convert(NotificationRepo::claim_by_ids(&self.pool, ids, now, lease_until).await?)
    }

    async fn claim_retryable(
        &self,
        since: Timestamp,
        max_retries: i32,
        now: Timestamp,
        lease_until: Timestamp,
        limit: i64,
    ) -> EngineResult<Vec<Notification>> {
        convert(
            NotificationRepo::claim_retryable(&self.pool, since, max_retries, now, lease_until, limit)
                .await?,
        )
    }

    async fn begin_send(
        &self,
        id: DbId,
        expected: NotificationStatus,
        claimed_until: Timestamp,
        in_flight_until: Timestamp,
    ) -> EngineResult<bool> {
        Ok(NotificationRepo::begin_send(&self.pool, id, expected, claimed_until, in_flight_until)
            .await?)
    }

    async fn update_notification(
        &self,
        notification: &Notification,
        expected: NotificationStatus,
    ) -> EngineResult<Option<Notification>> {
        convert_opt(NotificationRepo::update_state(&self.pool, notification, expected).await?)
    }

    async fn cancel_notification(
        &self,
        tenant_id: TenantId,
        id: DbId,
        now: Timestamp,
    ) -> EngineResult<Option<Notification>> {
        convert_opt(NotificationRepo::cancel(&self.pool, tenant_id, id, now).await?)
    }

    async fn expire_stale(&self, now: Timestamp) -> EngineResult<u64> {
        Ok(NotificationRepo::expire_stale(&self.pool, now).await?)
    }

    async fn count_charged(
        &self,
        setting_id: DbId,
        recipient_id: DbId,
        since: Timestamp,
    ) -> EngineResult<i64> {
        Ok(NotificationRepo::count_charged(&self.pool, setting_id, recipient_id, since).await?)
    }

    async fn list_notifications(
        &self,
        tenant_id: TenantId,
        filter: &NotificationFilter,
    ) -> EngineResult<Vec<Notification>> {
        convert(NotificationRepo::list(&self.pool, tenant_id, filter).await?)
    }

    async fn unread_count(&self, tenant_id: TenantId, recipient_id: DbId) -> EngineResult<i64> {
        Ok(NotificationRepo::unread_count(&self.pool, tenant_id, recipient_id).await?)
    }

    async fn delete_dead_letters(
        &self,
        tenant_id: TenantId,
        ids: &[DbId],
        max_retries: i32,
    ) -> EngineResult<u64> {
        Ok(NotificationRepo::delete_dead_letters(&self.pool, tenant_id, ids, max_retries).await?)
    }
}

#[async_trait]
impl SettingStore for PgStore {
    async fn create_setting(
        &self,
        tenant_id: TenantId,
        dto: &CreateSetting,
    ) -> EngineResult<NotificationSetting> {
        let row = NotificationSettingRepo::create(&self.pool, tenant_id, dto).await?;
        Ok(NotificationSetting::try_from(row)?)
    }

    async fn get_setting(
        &self,
        tenant_id: TenantId,
        id: DbId,
    ) -> EngineResult<Option<NotificationSetting>> {
        convert_opt(NotificationSettingRepo::find_by_id(&self.pool, tenant_id, id).await?)
    }

    async fn update_setting(
        &self,
        setting: &NotificationSetting,
    ) -> EngineResult<Option<NotificationSetting>> {
        convert_opt(NotificationSettingRepo::update(&self.pool, setting).await?)
    }

    async fn toggle_setting(
        &self,
        tenant_id: TenantId,
        id: DbId,
    ) -> EngineResult<Option<NotificationSetting>> {
        convert_opt(NotificationSettingRepo::toggle(&self.pool, tenant_id, id).await?)
    }

    async fn delete_setting(&self, tenant_id: TenantId, id: DbId) -> EngineResult<bool> {
        Ok(NotificationSettingRepo::delete(&self.pool, tenant_id, id).await?)
    }

    async fn active_settings(
        &self,
        tenant_id: TenantId,
        notification_type: &str,
    ) -> EngineResult<Vec<NotificationSetting>> {
        convert(
            NotificationSettingRepo::list_active_by_type(&self.pool, tenant_id, notification_type)
                .await?,
        )
    }

    async fn create_template(
        &self,
        tenant_id: TenantId,
        dto: &CreateTemplate,
    ) -> EngineResult<Template> {
        let row = TemplateRepo::create(&self.pool, tenant_id, dto).await?;
        Ok(Template::try_from(row)?)
    }

    async fn get_template(&self, tenant_id: TenantId, id: DbId) -> EngineResult<Option<Template>> {
        convert_opt(TemplateRepo::find_by_id(&self.pool, tenant_id, id).await?)
    }

    async fn templates_for(
        &self,
        tenant_id: TenantId,
        template_type: &str,
        channel: Channel,
    ) -> EngineResult<Vec<Template>> {
        convert(TemplateRepo::list_for(&self.pool, tenant_id, template_type, channel).await?)
    }

    async fn set_default_template(
        &self,
        tenant_id: TenantId,
        id: DbId,
    ) -> EngineResult<Option<Template>> {
        convert_opt(TemplateRepo::set_default(&self.pool, tenant_id, id).await?)
    }
}
