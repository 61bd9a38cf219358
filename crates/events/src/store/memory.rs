//! In-process store with the same contract as [`PgStore`](super::PgStore).
//!
//! All state lives behind one async mutex, so every claim and every
//! compare-and-swap is atomic with respect to other callers.

use std::collections::BTreeMap;

use async_trait::async_trait;
use beacon_core::alert::{Alert, AlertFilter, AlertStatus, SourceKey};
use beacon_core::error::CoreError;
use beacon_core::notification::{
    Channel, NewNotification, Notification, NotificationFilter, NotificationStatus,
};
use beacon_core::settings::{CreateSetting, NotificationSetting};
use beacon_core::template::{self, CreateTemplate, Template};
use beacon_core::types::{DbId, TenantId, Timestamp};
use chrono::Utc;
use tokio::sync::Mutex;

use super::{AlertStore, NotificationStore, SettingStore};
use crate::error::EngineResult;

#[derive(Default)]
struct State {
    next_id: DbId,
    alerts: BTreeMap<DbId, Alert>,
    notifications: BTreeMap<DbId, Notification>,
    settings: BTreeMap<DbId, NotificationSetting>,
    templates: BTreeMap<DbId, Template>,
}

impl State {
    fn allocate_id(&mut self) -> DbId {
        self.next_id += 1;
        self.next_id
    }

    /// Another open alert (not `except`) already holds `key`.
    fn open_alert_exists(&self, tenant_id: TenantId, key: &SourceKey, except: DbId) -> bool {
        self.alerts.values().any(|a| {
            a.id != except && a.tenant_id == tenant_id && a.is_open() && a.key() == *key
        })
    }

    fn clear_default_template(&mut self, tenant_id: TenantId, template_type: &str, channel: Channel) {
        let now = Utc::now();
        for t in self.templates.values_mut() {
            if t.tenant_id == tenant_id
                && t.template_type == template_type
                && t.channel == channel
                && t.is_default
            {
                t.is_default = false;
                t.updated_at = now;
            }
        }
    }
}

fn open_alert_conflict(key: &SourceKey) -> CoreError {
    CoreError::Conflict(format!("An open alert already exists for {key}"))
}

/// Apply `offset`/`limit` the way the SQL `LIMIT $n OFFSET $m` does.
fn page<T>(rows: Vec<T>, limit: Option<i64>, offset: Option<i64>) -> Vec<T> {
    let offset = offset.unwrap_or(0).max(0) as usize;
    let rows = rows.into_iter().skip(offset);
    match limit {
        Some(limit) => rows.take(limit.max(0) as usize).collect(),
        None => rows.collect(),
    }
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

// ---------------------------------------------------------------------------
// Alerts
// ---------------------------------------------------------------------------

#[async_trait]
impl AlertStore for MemoryStore {
    async fn insert_alert(&self, alert: &Alert) -> EngineResult<Alert> {
        let mut state = self.state.lock().await;
        let key = alert.key();
        if alert.is_open() && state.open_alert_exists(alert.tenant_id, &key, 0) {
            return Err(open_alert_conflict(&key).into());
        }
        let mut stored = alert.clone();
        stored.id = state.allocate_id();
        stored.version = 0;
        state.alerts.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn get_alert(&self, tenant_id: TenantId, id: DbId) -> EngineResult<Option<Alert>> {
        let state = self.state.lock().await;
        Ok(state
            .alerts
            .get(&id)
            .filter(|a| a.tenant_id == tenant_id)
            .cloned())
    }

    async fn find_latest_for_key(
        &self,
        tenant_id: TenantId,
        key: &SourceKey,
    ) -> EngineResult<Option<Alert>> {
        let state = self.state.lock().await;
        Ok(state
            .alerts
            .values()
            .rev()
            .find(|a| {
                a.tenant_id == tenant_id && a.status != AlertStatus::Expired && a.key() == *key
            })
            .cloned())
    }

    async fn update_alert(&self, alert: &Alert) -> EngineResult<Option<Alert>> {
        let mut state = self.state.lock().await;
        let current_version = match state.alerts.get(&alert.id) {
            Some(current) if current.tenant_id == alert.tenant_id => current.version,
            _ => return Ok(None),
        };
        if current_version != alert.version {
            return Ok(None);
        }
        let key = alert.key();
        if alert.is_open() && state.open_alert_exists(alert.tenant_id, &key, alert.id) {
            return Err(open_alert_conflict(&key).into());
        }
        let mut stored = alert.clone();
        stored.version += 1;
        state.alerts.insert(stored.id, stored.clone());
        Ok(Some(stored))
    }

    async fn list_alerts(
        &self,
        tenant_id: TenantId,
        filter: &AlertFilter,
    ) -> EngineResult<Vec<Alert>> {
        let state = self.state.lock().await;
        let mut rows: Vec<Alert> = state
            .alerts
            .values()
            .filter(|a| a.tenant_id == tenant_id && filter.matches(a))
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.triggered_at.cmp(&a.triggered_at).then(b.id.cmp(&a.id)));
        Ok(page(rows, filter.limit, filter.offset))
    }

    async fn list_expired_suppressions(
        &self,
        tenant_id: TenantId,
        now: Timestamp,
    ) -> EngineResult<Vec<Alert>> {
        let state = self.state.lock().await;
        Ok(state
            .alerts
            .values()
            .filter(|a| {
                a.tenant_id == tenant_id
                    && a.status == AlertStatus::Suppressed
                    && a.suppressed_until.is_some_and(|until| until < now)
            })
            .cloned()
            .collect())
    }

    async fn list_escalation_candidates(
        &self,
        tenant_id: TenantId,
        triggered_before: Timestamp,
        max_level: i32,
    ) -> EngineResult<Vec<Alert>> {
        let state = self.state.lock().await;
        let mut rows: Vec<Alert> = state
            .alerts
            .values()
            .filter(|a| {
                a.tenant_id == tenant_id
                    && a.status == AlertStatus::Active
                    && a.triggered_at < triggered_before
                    && a.escalation_level < max_level
            })
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.triggered_at.cmp(&b.triggered_at).then(a.id.cmp(&b.id)));
        Ok(rows)
    }

    async fn tenants_with_open_alerts(&self) -> EngineResult<Vec<TenantId>> {
        let state = self.state.lock().await;
        let mut tenants: Vec<TenantId> = state
            .alerts
            .values()
            .filter(|a| a.is_open())
            .map(|a| a.tenant_id)
            .collect();
        tenants.sort_unstable();
        tenants.dedup();
        Ok(tenants)
    }
}

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

fn materialize(id: DbId, n: &NewNotification) -> Notification {
    Notification {
        id,
        tenant_id: n.tenant_id,
        alert_id: n.alert_id,
        setting_id: n.setting_id,
        recipient_id: n.recipient_id,
        notification_type: n.notification_type.clone(),
        title: n.title.clone(),
        message: n.message.clone(),
        channel: n.channel,
        status: n.status,
        priority_level: n.priority_level,
        scheduled_at: n.scheduled_at,
        expires_at: n.expires_at,
        retry_count: 0,
        error_message: n.error_message.clone(),
        sent_at: None,
        delivered_at: None,
        read_at: None,
        last_attempt_at: None,
        locked_until: None,
        metadata: n.metadata.clone(),
        created_at: n.created_at,
    }
}

/// Lease every row in `ids` until `lease_until`, returning the leased copies.
fn lease(state: &mut State, ids: Vec<DbId>, lease_until: Timestamp) -> Vec<Notification> {
    ids.into_iter()
        .filter_map(|id| {
            let n = state.notifications.get_mut(&id)?;
            n.locked_until = Some(lease_until);
            Some(n.clone())
        })
        .collect()
}

#[async_trait]
impl NotificationStore for MemoryStore {
    async fn insert_notifications(
        &self,
        batch: &[NewNotification],
    ) -> EngineResult<Vec<Notification>> {
        let mut state = self.state.lock().await;
        let mut out = Vec::with_capacity(batch.len());
        for n in batch {
            let id = state.allocate_id();
            let row = materialize(id, n);
            state.notifications.insert(id, row.clone());
            out.push(row);
        }
        Ok(out)
    }

    async fn get_notification(
        &self,
        tenant_id: TenantId,
        id: DbId,
    ) -> EngineResult<Option<Notification>> {
        let state = self.state.lock().await;
        Ok(state
            .notifications
            .get(&id)
            .filter(|n| n.tenant_id == tenant_id)
            .cloned())
    }

    async fn claim_due(
        &self,
        now: Timestamp,
        lease_until: Timestamp,
        limit: i64,
    ) -> EngineResult<Vec<Notification>> {
        let mut state = self.state.lock().await;
        let mut due: Vec<&Notification> = state
            .notifications
            .values()
            .filter(|n| n.is_due(now) && !n.is_leased_at(now))
            .collect();
        // `None < Some(_)` gives NULLS FIRST.
        due.sort_by_key(|n| (n.priority_level, n.scheduled_at, n.id));
        let ids: Vec<DbId> = due
            .into_iter()
            .take(limit.max(0) as usize)
            .map(|n| n.id)
            .collect();
        Ok(lease(&mut state, ids, lease_until))
    }

    async fn claim_by_ids(
        &self,
        ids: &[DbId],
        now: Timestamp,
        lease_until: Timestamp,
    ) -> EngineResult<Vec<Notification>> {
        let mut state = self.state.lock().await;
        let claimable: Vec<DbId> = state
            .notifications
            .values()
            .filter(|n| {
                ids.contains(&n.id)
                    && n.status == NotificationStatus::Pending
                    && !n.is_leased_at(now)
            })
            .map(|n| n.id)
            .collect();
        Ok(lease(&mut state, claimable, lease_until))
    }

    async fn claim_retryable(
        &self,
        since: Timestamp,
        max_retries: i32,
        now: Timestamp,
        lease_until: Timestamp,
        limit: i64,
    ) -> EngineResult<Vec<Notification>> {
        let mut state = self.state.lock().await;
        let mut retryable: Vec<&Notification> = state
            .notifications
            .values()
            .filter(|n| {
                beacon_core::notification::transitions::can_retry(n, max_retries, since)
                    && !n.is_expired_at(now)
                    && !n.is_leased_at(now)
            })
            .collect();
        retryable.sort_by_key(|n| (n.priority_level, n.last_attempt_at, n.id));
        let ids: Vec<DbId> = retryable
            .into_iter()
            .take(limit.max(0) as usize)
            .map(|n| n.id)
            .collect();
        Ok(lease(&mut state, ids, lease_until))
    }

    async fn begin_send(
        &self,
        id: DbId,
        expected: NotificationStatus,
        claimed_until: Timestamp,
        in_flight_until: Timestamp,
    ) -> EngineResult<bool> {
        let mut state = self.state.lock().await;
        let Some(current) = state.notifications.get_mut(&id) else {
            return Ok(false);
        };
        if current.status != expected || current.locked_until != Some(claimed_until) {
            return Ok(false);
        }
        current.locked_until = Some(in_flight_until);
        Ok(true)
    }

    async fn update_notification(
        &self,
        notification: &Notification,
        expected: NotificationStatus,
    ) -> EngineResult<Option<Notification>> {
        let mut state = self.state.lock().await;
        let Some(current) = state.notifications.get_mut(&notification.id) else {
            return Ok(None);
        };
        if current.tenant_id != notification.tenant_id || current.status != expected {
            return Ok(None);
        }
        current.status = notification.status;
        current.retry_count = notification.retry_count;
        current.error_message = notification.error_message.clone();
        current.sent_at = notification.sent_at;
        current.delivered_at = notification.delivered_at;
        current.read_at = notification.read_at;
        current.last_attempt_at = notification.last_attempt_at;
        current.locked_until = notification.locked_until;
        Ok(Some(current.clone()))
    }

    async fn cancel_notification(
        &self,
        tenant_id: TenantId,
        id: DbId,
        now: Timestamp,
    ) -> EngineResult<Option<Notification>> {
        let mut state = self.state.lock().await;
        let Some(current) = state.notifications.get_mut(&id) else {
            return Ok(None);
        };
        if current.tenant_id != tenant_id {
            return Ok(None);
        }
        match beacon_core::notification::transitions::cancel(current, now) {
            Some(next) => {
                *current = next.clone();
                Ok(Some(next))
            }
            None => Ok(None),
        }
    }

    async fn expire_stale(&self, now: Timestamp) -> EngineResult<u64> {
        let mut state = self.state.lock().await;
        let mut expired = 0;
        for n in state.notifications.values_mut() {
            if n.is_leased_at(now) {
                continue;
            }
            if let Some(next) = beacon_core::notification::transitions::expire(n, now) {
                *n = next;
                expired += 1;
            }
        }
        Ok(expired)
    }

    async fn count_charged(
        &self,
        setting_id: DbId,
        recipient_id: DbId,
        since: Timestamp,
    ) -> EngineResult<i64> {
        let state = self.state.lock().await;
        let count = state
            .notifications
            .values()
            .filter(|n| {
                n.setting_id == Some(setting_id)
                    && n.recipient_id == recipient_id
                    && (n.status == NotificationStatus::Pending || n.status.is_sent_like())
                    && n.sent_at.unwrap_or(n.created_at) >= since
            })
            .count();
        Ok(count as i64)
    }

    async fn list_notifications(
        &self,
        tenant_id: TenantId,
        filter: &NotificationFilter,
    ) -> EngineResult<Vec<Notification>> {
        let state = self.state.lock().await;
        let mut rows: Vec<Notification> = state
            .notifications
            .values()
            .filter(|n| n.tenant_id == tenant_id && filter.matches(n))
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(page(rows, filter.limit, filter.offset))
    }

    async fn unread_count(&self, tenant_id: TenantId, recipient_id: DbId) -> EngineResult<i64> {
        let state = self.state.lock().await;
        let count = state
            .notifications
            .values()
            .filter(|n| {
                n.tenant_id == tenant_id
                    && n.recipient_id == recipient_id
                    && matches!(
                        n.status,
                        NotificationStatus::Sent | NotificationStatus::Delivered
                    )
            })
            .count();
        Ok(count as i64)
    }

    async fn delete_dead_letters(
        &self,
        tenant_id: TenantId,
        ids: &[DbId],
        max_retries: i32,
    ) -> EngineResult<u64> {
        let mut state = self.state.lock().await;
        let before = state.notifications.len();
        state.notifications.retain(|id, n| {
            !(ids.contains(id) && n.tenant_id == tenant_id && n.is_dead_letter(max_retries))
        });
        Ok((before - state.notifications.len()) as u64)
    }
}

// ---------------------------------------------------------------------------
// Settings and templates
// ---------------------------------------------------------------------------

#[async_trait]
impl SettingStore for MemoryStore {
    async fn create_setting(
        &self,
        tenant_id: TenantId,
        dto: &CreateSetting,
    ) -> EngineResult<NotificationSetting> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let setting = NotificationSetting {
            id: state.allocate_id(),
            tenant_id,
            scope_id: dto.scope_id,
            notification_type: dto.notification_type.clone(),
            name: dto.name.clone(),
            description: dto.description.clone(),
            recipient_ids: dto.recipient_ids.clone(),
            channels: dto.channels.clone(),
            trigger_schedule: dto.trigger_schedule.clone(),
            priority_level: dto.priority_level,
            max_retries: dto.max_retries,
            retry_interval_secs: dto.retry_interval_secs,
            daily_limit: dto.daily_limit,
            hourly_limit: dto.hourly_limit,
            is_active: true,
            created_at: now,
            updated_at: now,
        };
        state.settings.insert(setting.id, setting.clone());
        Ok(setting)
    }

    async fn get_setting(
        &self,
        tenant_id: TenantId,
        id: DbId,
    ) -> EngineResult<Option<NotificationSetting>> {
        let state = self.state.lock().await;
        Ok(state
            .settings
            .get(&id)
            .filter(|s| s.tenant_id == tenant_id)
            .cloned())
    }

    async fn update_setting(
        &self,
        setting: &NotificationSetting,
    ) -> EngineResult<Option<NotificationSetting>> {
        let mut state = self.state.lock().await;
        match state.settings.get_mut(&setting.id) {
            Some(current) if current.tenant_id == setting.tenant_id => {
                let created_at = current.created_at;
                *current = setting.clone();
                current.created_at = created_at;
                current.updated_at = Utc::now();
                Ok(Some(current.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn toggle_setting(
        &self,
        tenant_id: TenantId,
        id: DbId,
    ) -> EngineResult<Option<NotificationSetting>> {
        let mut state = self.state.lock().await;
        match state.settings.get_mut(&id) {
            Some(current) if current.tenant_id == tenant_id => {
                current.is_active = !current.is_active;
                current.updated_at = Utc::now();
                Ok(Some(current.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn delete_setting(&self, tenant_id: TenantId, id: DbId) -> EngineResult<bool> {
        let mut state = self.state.lock().await;
        let owned = state
            .settings
            .get(&id)
            .is_some_and(|s| s.tenant_id == tenant_id);
        if owned {
            state.settings.remove(&id);
        }
        Ok(owned)
    }

    async fn active_settings(
        &self,
        tenant_id: TenantId,
        notification_type: &str,
    ) -> EngineResult<Vec<NotificationSetting>> {
        let state = self.state.lock().await;
        let mut rows: Vec<NotificationSetting> = state
            .settings
            .values()
            .filter(|s| {
                s.tenant_id == tenant_id && s.is_active && s.notification_type == notification_type
            })
            .cloned()
            .collect();
        rows.sort_by_key(|s| (s.priority_level, s.id));
        Ok(rows)
    }

    async fn create_template(
        &self,
        tenant_id: TenantId,
        dto: &CreateTemplate,
    ) -> EngineResult<Template> {
        let mut state = self.state.lock().await;
        let mut variables = template::placeholders(&dto.body_template);
        if let Some(subject) = &dto.subject_template {
            variables.extend(template::placeholders(subject));
            variables.sort();
            variables.dedup();
        }
        if dto.is_default {
            state.clear_default_template(tenant_id, &dto.template_type, dto.channel);
        }
        let now = Utc::now();
        let created = Template {
            id: state.allocate_id(),
            tenant_id,
            name: dto.name.clone(),
            template_type: dto.template_type.clone(),
            channel: dto.channel,
            language_code: dto.language_code.clone(),
            subject_template: dto.subject_template.clone(),
            body_template: dto.body_template.clone(),
            variables,
            is_active: true,
            is_default: dto.is_default,
            created_at: now,
            updated_at: now,
        };
        state.templates.insert(created.id, created.clone());
        Ok(created)
    }

    async fn get_template(&self, tenant_id: TenantId, id: DbId) -> EngineResult<Option<Template>> {
        let state = self.state.lock().await;
        Ok(state
            .templates
            .get(&id)
            .filter(|t| t.tenant_id == tenant_id)
            .cloned())
    }

    async fn templates_for(
        &self,
        tenant_id: TenantId,
        template_type: &str,
        channel: Channel,
    ) -> EngineResult<Vec<Template>> {
        let state = self.state.lock().await;
        let mut rows: Vec<Template> = state
            .templates
            .values()
            .filter(|t| {
                t.tenant_id == tenant_id
                    && t.template_type == template_type
                    && t.channel == channel
                    && t.is_active
            })
            .cloned()
            .collect();
        rows.sort_by_key(|t| (!t.is_default, t.id));
        Ok(rows)
    }

    async fn set_default_template(
        &self,
        tenant_id: TenantId,
        id: DbId,
    ) -> EngineResult<Option<Template>> {
        let mut state = self.state.lock().await;
        let (template_type, channel) = match state.templates.get(&id) {
            Some(t) if t.tenant_id == tenant_id => (t.template_type.clone(), t.channel),
            _ => return Ok(None),
        };
        state.clear_default_template(tenant_id, &template_type, channel);
        match state.templates.get_mut(&id) {
            Some(t) => {
                t.is_default = true;
                t.updated_at = Utc::now();
                Ok(Some(t.clone()))
            }
            None => Ok(None),
        }
    }
}
