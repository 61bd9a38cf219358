//! Storage seams for the engine.
//!
//! The engine talks to storage only through these traits. [`PgStore`] backs
//! them with the `beacon-db` repositories; [`MemoryStore`] keeps everything in
//! process and backs the integration tests.
//!
//! Contract shared by both implementations:
//! - `update_alert` is a compare-and-swap on `Alert::version`; `Ok(None)` means
//!   the caller lost a race.
//! - Inserting or reopening an alert when another open alert exists for the
//!   same key fails with `CoreError::Conflict`.
//! - Claims set `locked_until` atomically; a row with a live lease is never
//!   handed to a second claimer.
//! - `begin_send` compares the claimer's lease before every send, so a row
//!   reclaimed after its lease lapsed is sent only by the newer claimer.

pub mod memory;
pub mod pg;

use std::sync::Arc;

use async_trait::async_trait;
use beacon_core::alert::{Alert, AlertFilter, SourceKey};
use beacon_core::notification::{
    Channel, NewNotification, Notification, NotificationFilter, NotificationStatus,
};
use beacon_core::settings::{CreateSetting, NotificationSetting};
use beacon_core::template::{CreateTemplate, Template};
use beacon_core::types::{DbId, TenantId, Timestamp};

use crate::error::EngineResult;

pub use memory::MemoryStore;
pub use pg::PgStore;

#[async_trait]
pub trait AlertStore: Send + Sync {
    /// Insert a new alert, assigning `id` and `version`.
    async fn insert_alert(&self, alert: &Alert) -> EngineResult<Alert>;

    async fn get_alert(&self, tenant_id: TenantId, id: DbId) -> EngineResult<Option<Alert>>;

    /// Latest non-expired alert for `key`.
    async fn find_latest_for_key(
        &self,
        tenant_id: TenantId,
        key: &SourceKey,
    ) -> EngineResult<Option<Alert>>;

    /// Compare-and-swap write. Returns the stored record with its new version.
    async fn update_alert(&self, alert: &Alert) -> EngineResult<Option<Alert>>;

    async fn list_alerts(&self, tenant_id: TenantId, filter: &AlertFilter)
        -> EngineResult<Vec<Alert>>;

    /// Suppressed alerts with `suppressed_until < now`.
    async fn list_expired_suppressions(
        &self,
        tenant_id: TenantId,
        now: Timestamp,
    ) -> EngineResult<Vec<Alert>>;

    /// Active alerts triggered before `triggered_before` and below `max_level`.
    async fn list_escalation_candidates(
        &self,
        tenant_id: TenantId,
        triggered_before: Timestamp,
        max_level: i32,
    ) -> EngineResult<Vec<Alert>>;

    async fn tenants_with_open_alerts(&self) -> EngineResult<Vec<TenantId>>;
}

#[async_trait]
pub trait NotificationStore: Send + Sync {
    /// Insert rows in order, returning them with ids assigned.
    async fn insert_notifications(&self, batch: &[NewNotification])
        -> EngineResult<Vec<Notification>>;

    async fn get_notification(
        &self,
        tenant_id: TenantId,
        id: DbId,
    ) -> EngineResult<Option<Notification>>;

    /// Lease due PENDING rows, most urgent first.
    async fn claim_due(
        &self,
        now: Timestamp,
        lease_until: Timestamp,
        limit: i64,
    ) -> EngineResult<Vec<Notification>>;

    /// Lease specific PENDING rows.
    async fn claim_by_ids(
        &self,
        ids: &[DbId],
        now: Timestamp,
        lease_until: Timestamp,
    ) -> EngineResult<Vec<Notification>>;

    /// Lease unexpired FAILED rows under `max_retries` last attempted at or
    /// after `since`.
    async fn claim_retryable(
        &self,
        since: Timestamp,
        max_retries: i32,
        now: Timestamp,
        lease_until: Timestamp,
        limit: i64,
    ) -> EngineResult<Vec<Notification>>;

    /// Confirm a claim right before sending.
    ///
    /// Succeeds only if the row is still in `expected` and still carries the
    /// lease `claimed_until` handed out by the claim; the lease then moves to
    /// `in_flight_until`. A claim whose lease lapsed and was taken by another
    /// pass fails here, so the row is sent by exactly one claimer.
    async fn begin_send(
        &self,
        id: DbId,
        expected: NotificationStatus,
        claimed_until: Timestamp,
        in_flight_until: Timestamp,
    ) -> EngineResult<bool>;

    /// Write delivery state if the row is still in `expected`.
    async fn update_notification(
        &self,
        notification: &Notification,
        expected: NotificationStatus,
    ) -> EngineResult<Option<Notification>>;

    /// `PENDING -> CANCELLED` for an unleased row.
    async fn cancel_notification(
        &self,
        tenant_id: TenantId,
        id: DbId,
        now: Timestamp,
    ) -> EngineResult<Option<Notification>>;

    /// Expire unleased PENDING rows whose `expires_at <= now`.
    async fn expire_stale(&self, now: Timestamp) -> EngineResult<u64>;

    /// Rows charged against `(setting, recipient)` since `since`.
    async fn count_charged(
        &self,
        setting_id: DbId,
        recipient_id: DbId,
        since: Timestamp,
    ) -> EngineResult<i64>;

    async fn list_notifications(
        &self,
        tenant_id: TenantId,
        filter: &NotificationFilter,
    ) -> EngineResult<Vec<Notification>>;

    async fn unread_count(&self, tenant_id: TenantId, recipient_id: DbId) -> EngineResult<i64>;

    /// Delete exhausted FAILED rows among `ids`.
    async fn delete_dead_letters(
        &self,
        tenant_id: TenantId,
        ids: &[DbId],
        max_retries: i32,
    ) -> EngineResult<u64>;
}

#[async_trait]
pub trait SettingStore: Send + Sync {
    async fn create_setting(
        &self,
        tenant_id: TenantId,
        dto: &CreateSetting,
    ) -> EngineResult<NotificationSetting>;

    async fn get_setting(
        &self,
        tenant_id: TenantId,
        id: DbId,
    ) -> EngineResult<Option<NotificationSetting>>;

    async fn update_setting(
        &self,
        setting: &NotificationSetting,
    ) -> EngineResult<Option<NotificationSetting>>;

    async fn toggle_setting(
        &self,
        tenant_id: TenantId,
        id: DbId,
    ) -> EngineResult<Option<NotificationSetting>>;

    async fn delete_setting(&self, tenant_id: TenantId, id: DbId) -> EngineResult<bool>;

    /// Active settings for a type, lowest priority level first.
    async fn active_settings(
        &self,
        tenant_id: TenantId,
        notification_type: &str,
    ) -> EngineResult<Vec<NotificationSetting>>;

    async fn create_template(&self, tenant_id: TenantId, dto: &CreateTemplate)
        -> EngineResult<Template>;

    async fn get_template(&self, tenant_id: TenantId, id: DbId) -> EngineResult<Option<Template>>;

    /// Active templates for `(template_type, channel)` in every language.
    async fn templates_for(
        &self,
        tenant_id: TenantId,
        template_type: &str,
        channel: Channel,
    ) -> EngineResult<Vec<Template>>;

    async fn set_default_template(
        &self,
        tenant_id: TenantId,
        id: DbId,
    ) -> EngineResult<Option<Template>>;
}

/// The three stores, shared by the engine components.
#[derive(Clone)]
pub struct Stores {
    pub alerts: Arc<dyn AlertStore>,
    pub notifications: Arc<dyn NotificationStore>,
    pub settings: Arc<dyn SettingStore>,
}

impl Stores {
    pub fn memory() -> Self {
        Self::from_shared(Arc::new(MemoryStore::default()))
    }

    pub fn postgres(pool: beacon_db::DbPool) -> Self {
        Self::from_shared(Arc::new(PgStore::new(pool)))
    }

    /// Use one value for all three stores.
    pub fn from_shared<S>(store: Arc<S>) -> Self
    where
        S: AlertStore + NotificationStore + SettingStore + 'static,
    {
        Self {
            alerts: store.clone(),
            notifications: store.clone(),
            settings: store,
        }
    }
}
