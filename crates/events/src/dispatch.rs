//! Notification dispatcher.
//!
//! Turns a [`NotificationRequest`] into one stored row per
//! `(recipient, channel)`, applying rate limits at enqueue time, and drives
//! rows through delivery:
//!
//! ```text
//! PENDING ──send ok──▶ SENT ──receipt──▶ DELIVERED ──read──▶ READ
//!    │  └──send err──▶ FAILED ──retry ok──▶ SENT
//!    ├──expires──▶ EXPIRED          └──retry err──▶ FAILED (retry_count+1)
//!    └──cancel──▶ CANCELLED
//! ```
//!
//! Every send happens on a leased row (see the store contract), concurrently
//! in a `JoinSet`, one task per row. A failure on one row never affects its
//! siblings.

use std::sync::Arc;

use beacon_core::error::CoreError;
use beacon_core::notification::{
    transitions, Channel, NewNotification, Notification, NotificationFilter, NotificationStatus,
    PRIORITY_NORMAL, PRIORITY_URGENT,
};
use beacon_core::rate_limit::{self, RateCeiling, RateDecision, SendCounts};
use beacon_core::stats::NotificationStatistics;
use beacon_core::template::Variables;
use beacon_core::types::{DbId, Metadata, TenantId, Timestamp};
use chrono::Duration;
use futures::future::try_join_all;
use tokio::task::JoinSet;
use tokio::time::Instant;
use validator::Validate;

use crate::bus::{
    EngineEvent, EventBus, NOTIFICATION_CANCELLED, NOTIFICATION_DEAD_LETTERS_CLEARED,
    NOTIFICATION_DELIVERED, NOTIFICATION_ENQUEUED, NOTIFICATION_EXPIRED, NOTIFICATION_FAILED,
    NOTIFICATION_RATE_LIMITED, NOTIFICATION_READ, NOTIFICATION_SENT,
};
use crate::config::EngineConfig;
use crate::delivery::SenderRegistry;
use crate::error::EngineResult;
use crate::settings::{initial_status, RenderedContent, SettingsMatcher};
use crate::store::NotificationStore;
use crate::transition::Transition;

/// Attempts at a status-guarded write before giving up with a conflict.
const MAX_WRITE_ATTEMPTS: usize = 5;

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// Where a notification's title and body come from.
#[derive(Debug, Clone, PartialEq)]
pub enum Content {
    Literal { title: String, message: String },
    /// Render a specific template.
    Template {
        template_id: DbId,
        variables: Variables,
    },
    /// Render the template selected per channel for the notification type,
    /// or fall back to the literal title and message.
    Typed {
        language: Option<String>,
        variables: Variables,
        title: String,
        message: String,
    },
}

impl Content {
    pub fn literal(title: impl Into<String>, message: impl Into<String>) -> Self {
        Content::Literal {
            title: title.into(),
            message: message.into(),
        }
    }

    fn check(&self) -> Result<(), CoreError> {
        match self {
            Content::Literal { title, .. } | Content::Typed { title, .. }
                if title.trim().is_empty() =>
            {
                Err(CoreError::Validation("title is required".into()))
            }
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Validate)]
pub struct NotificationRequest {
    #[validate(length(min = 1, max = 50))]
    pub notification_type: String,
    #[validate(length(min = 1))]
    pub recipient_ids: Vec<DbId>,
    #[validate(length(min = 1))]
    pub channels: Vec<Channel>,
    pub content: Content,
    #[validate(range(min = 1, max = 5))]
    pub priority_level: i32,
    pub alert_id: Option<DbId>,
    /// Setting whose rate limits apply to this send.
    pub setting_id: Option<DbId>,
    pub scheduled_at: Option<Timestamp>,
    pub expires_at: Option<Timestamp>,
    pub metadata: Metadata,
}

impl NotificationRequest {
    pub fn new(
        notification_type: impl Into<String>,
        recipient_ids: Vec<DbId>,
        channels: Vec<Channel>,
        content: Content,
    ) -> Self {
        Self {
            notification_type: notification_type.into(),
            recipient_ids,
            channels,
            content,
            priority_level: PRIORITY_NORMAL,
            alert_id: None,
            setting_id: None,
            scheduled_at: None,
            expires_at: None,
            metadata: Metadata::new(),
        }
    }

    pub fn priority(mut self, priority_level: i32) -> Self {
        self.priority_level = priority_level;
        self
    }

    pub fn for_alert(mut self, alert_id: DbId) -> Self {
        self.alert_id = Some(alert_id);
        self
    }

    pub fn under_setting(mut self, setting_id: DbId) -> Self {
        self.setting_id = Some(setting_id);
        self
    }

    pub fn scheduled_at(mut self, at: Timestamp) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    pub fn expires_at(mut self, at: Timestamp) -> Self {
        self.expires_at = Some(at);
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Keep the first occurrence of each element.
fn dedup_in_order<T: PartialEq + Copy>(items: &[T]) -> Vec<T> {
    let mut out: Vec<T> = Vec::with_capacity(items.len());
    for item in items {
        if !out.contains(item) {
            out.push(*item);
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Attempt {
    Sent,
    Failed,
    Expired,
    /// The row changed under us or a later claim took it over.
    Skipped,
}

/// Counts from one dispatch pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub claimed: usize,
    pub sent: usize,
    pub failed: usize,
    pub expired: usize,
    pub skipped: usize,
    /// Rows whose state could not be written back.
    pub errors: usize,
}

impl DispatchReport {
    fn record(&mut self, attempt: Attempt) {
        match attempt {
            Attempt::Sent => self.sent += 1,
            Attempt::Failed => self.failed += 1,
            Attempt::Expired => self.expired += 1,
            Attempt::Skipped => self.skipped += 1,
        }
    }
}

// ---------------------------------------------------------------------------
// NotificationDispatcher
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct NotificationDispatcher {
    notifications: Arc<dyn NotificationStore>,
    matcher: SettingsMatcher,
    senders: Arc<SenderRegistry>,
    bus: Arc<EventBus>,
    config: Arc<EngineConfig>,
}

impl NotificationDispatcher {
    pub fn new(
        notifications: Arc<dyn NotificationStore>,
        matcher: SettingsMatcher,
        senders: Arc<SenderRegistry>,
        bus: Arc<EventBus>,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            notifications,
            matcher,
            senders,
            bus,
            config,
        }
    }

    // -----------------------------------------------------------------------
    // Enqueue
    // -----------------------------------------------------------------------

    /// Store one row per `(recipient, channel)` without sending.
    ///
    /// With a setting, each recipient's trailing hour/day counts are checked
    /// before every row; rows over a ceiling are stored as
    /// `SUPPRESSED_BY_RATE_LIMIT` and never sent. Rows earlier in the same
    /// batch count against later ones.
    pub async fn enqueue(
        &self,
        tenant_id: TenantId,
        request: &NotificationRequest,
        now: Timestamp,
    ) -> EngineResult<Vec<Notification>> {
        request.validate()?;
        request.content.check()?;

        let setting = match request.setting_id {
            Some(id) => Some(self.matcher.get_setting(tenant_id, id).await?),
            None => None,
        };
        let recipients = dedup_in_order(&request.recipient_ids);
        let channels = dedup_in_order(&request.channels);

        let contents = try_join_all(
            channels
                .iter()
                .map(|channel| self.render(tenant_id, request, *channel)),
        )
        .await?;
        let rendered: Vec<_> = channels.iter().copied().zip(contents).collect();

        let mut batch = Vec::with_capacity(recipients.len() * channels.len());
        for recipient_id in recipients {
            let (ceiling, mut counts) = match &setting {
                Some(s) => (
                    RateCeiling::from(s),
                    self.matcher.send_counts(s, recipient_id, now).await?,
                ),
                None => (RateCeiling::default(), SendCounts::default()),
            };
            for (channel, content) in &rendered {
                let decision = rate_limit::check(ceiling, counts);
                if decision.is_allowed() {
                    counts.last_hour += 1;
                    counts.last_day += 1;
                }
                batch.push(self.new_row(
                    tenant_id,
                    request,
                    recipient_id,
                    *channel,
                    content,
                    &decision,
                    now,
                ));
            }
        }

        let rows = self.notifications.insert_notifications(&batch).await?;
        let suppressed = rows
            .iter()
            .filter(|n| n.status == NotificationStatus::SuppressedByRateLimit)
            .count();
        for n in &rows {
            let event_type = if n.status == NotificationStatus::SuppressedByRateLimit {
                NOTIFICATION_RATE_LIMITED
            } else {
                NOTIFICATION_ENQUEUED
            };
            self.publish(event_type, n, now);
        }
        tracing::info!(
            tenant_id,
            notification_type = %request.notification_type,
            alert_id = ?request.alert_id,
            rows = rows.len(),
            suppressed,
            "Notifications enqueued"
        );
        Ok(rows)
    }

    #[allow(clippy::too_many_arguments)]
    fn new_row(
        &self,
        tenant_id: TenantId,
        request: &NotificationRequest,
        recipient_id: DbId,
        channel: Channel,
        content: &RenderedContent,
        decision: &RateDecision,
        now: Timestamp,
    ) -> NewNotification {
        let mut metadata = request.metadata.clone();
        if let Some(template_id) = content.template_id {
            metadata.insert("template_id".into(), serde_json::json!(template_id));
        }
        NewNotification {
            tenant_id,
            alert_id: request.alert_id,
            setting_id: request.setting_id,
            recipient_id,
            notification_type: request.notification_type.clone(),
            title: content.title.clone(),
            message: content.message.clone(),
            channel,
            status: initial_status(decision),
            priority_level: request.priority_level,
            scheduled_at: request.scheduled_at,
            expires_at: request.expires_at,
            error_message: decision.reason(),
            metadata,
            created_at: now,
        }
    }

    async fn render(
        &self,
        tenant_id: TenantId,
        request: &NotificationRequest,
        channel: Channel,
    ) -> EngineResult<RenderedContent> {
        match &request.content {
            Content::Literal { title, message } => Ok(RenderedContent::literal(title, message)),
            Content::Template {
                template_id,
                variables,
            } => {
                self.matcher
                    .render_template(tenant_id, *template_id, variables)
                    .await
            }
            Content::Typed {
                language,
                variables,
                title,
                message,
            } => {
                self.matcher
                    .render_for(
                        tenant_id,
                        &request.notification_type,
                        channel,
                        language.as_deref(),
                        variables,
                        RenderedContent::literal(title, message),
                    )
                    .await
            }
        }
    }

    /// Enqueue, then send every row that is already due.
    ///
    /// Rows scheduled for later wait for [`dispatch_due`](Self::dispatch_due).
    /// Returns the ids of all rows created, including rate-limited ones.
    pub async fn send_notification(
        &self,
        tenant_id: TenantId,
        request: &NotificationRequest,
        now: Timestamp,
    ) -> EngineResult<Vec<DbId>> {
        let rows = self.enqueue(tenant_id, request, now).await?;
        let due: Vec<DbId> = rows.iter().filter(|n| n.is_due(now)).map(|n| n.id).collect();
        if !due.is_empty() {
            self.dispatch_ids(&due, now).await?;
        }
        Ok(rows.iter().map(|n| n.id).collect())
    }

    /// Send at the most urgent priority, immediately, ignoring any schedule.
    pub async fn send_urgent_alert(
        &self,
        tenant_id: TenantId,
        request: &NotificationRequest,
        now: Timestamp,
    ) -> EngineResult<Vec<DbId>> {
        let mut urgent = request.clone();
        urgent.priority_level = PRIORITY_URGENT;
        urgent.scheduled_at = None;
        self.send_notification(tenant_id, &urgent, now).await
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    /// Expire stale PENDING rows, then lease and send due ones, most urgent
    /// first.
    pub async fn dispatch_due(&self, now: Timestamp) -> EngineResult<DispatchReport> {
        let expired = self.expire_stale(now).await?;
        let rows = self
            .notifications
            .claim_due(now, now + self.config.lease(), self.config.dispatch_batch_size)
            .await?;
        let mut report = self.send_claimed(rows, now).await;
        report.expired += usize::try_from(expired).unwrap_or(usize::MAX);
        Ok(report)
    }

    /// Lease and send specific PENDING rows.
    pub async fn dispatch_ids(&self, ids: &[DbId], now: Timestamp) -> EngineResult<DispatchReport> {
        let rows = self
            .notifications
            .claim_by_ids(ids, now, now + self.config.lease())
            .await?;
        Ok(self.send_claimed(rows, now).await)
    }

    /// Re-attempt FAILED rows last tried within the retry window and still
    /// under the retry ceiling. Rows at the ceiling stay as dead letters.
    pub async fn retry_failed(&self, now: Timestamp) -> EngineResult<DispatchReport> {
        let since = now - Duration::hours(self.config.retry_window_hours);
        let rows = self
            .notifications
            .claim_retryable(
                since,
                self.config.max_retries,
                now,
                now + self.config.lease(),
                self.config.dispatch_batch_size,
            )
            .await?;
        Ok(self.send_claimed(rows, now).await)
    }

    async fn send_claimed(&self, rows: Vec<Notification>, now: Timestamp) -> DispatchReport {
        let mut report = DispatchReport {
            claimed: rows.len(),
            ..Default::default()
        };
        if rows.is_empty() {
            return report;
        }

        let started = Instant::now();
        let mut tasks = JoinSet::new();
        for row in rows {
            let this = self.clone();
            tasks.spawn(async move {
                let id = row.id;
                (id, this.attempt(row, now, started).await)
            });
        }
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(attempt))) => report.record(attempt),
                Ok((id, Err(e))) => {
                    report.errors += 1;
                    tracing::error!(notification_id = id, error = %e, "Failed to record delivery");
                }
                Err(e) => {
                    report.errors += 1;
                    tracing::error!(error = %e, "Delivery task panicked");
                }
            }
        }
        tracing::debug!(?report, "Dispatch pass complete");
        report
    }

    /// Send one leased row and write the outcome back.
    ///
    /// The claim is confirmed after the channel permit is taken. A row
    /// reclaimed by another pass while queued is skipped.
    async fn attempt(
        &self,
        row: Notification,
        now: Timestamp,
        started: Instant,
    ) -> EngineResult<Attempt> {
        if row.is_expired_at(now) {
            let Some(expired) = transitions::expire(&row, now) else {
                return Ok(Attempt::Skipped);
            };
            return match self.notifications.update_notification(&expired, row.status).await? {
                Some(stored) => {
                    self.publish(NOTIFICATION_EXPIRED, &stored, now);
                    Ok(Attempt::Expired)
                }
                None => Ok(Attempt::Skipped),
            };
        }

        let Some(claimed_until) = row.locked_until else {
            return Ok(Attempt::Skipped);
        };
        let slot = self.senders.reserve(row.channel).await;
        let elapsed = Duration::from_std(started.elapsed()).unwrap_or_else(|_| Duration::zero());
        let in_flight_until = now + elapsed + self.config.in_flight_lease();
        let confirmed = self
            .notifications
            .begin_send(row.id, row.status, claimed_until, in_flight_until)
            .await?;
        if !confirmed {
            tracing::debug!(notification_id = row.id, "Lease taken over before send, skipping");
            return Ok(Attempt::Skipped);
        }

        let outcome = slot.deliver(&row).await;
        let next = transitions::record_attempt(&row, &outcome, self.config.max_retries, now);
        match self.notifications.update_notification(&next, row.status).await? {
            Some(stored) if stored.status == NotificationStatus::Sent => {
                self.publish(NOTIFICATION_SENT, &stored, now);
                Ok(Attempt::Sent)
            }
            Some(stored) => {
                self.publish(NOTIFICATION_FAILED, &stored, now);
                if stored.is_dead_letter(self.config.max_retries) {
                    tracing::warn!(
                        notification_id = stored.id,
                        retry_count = stored.retry_count,
                        "Notification exhausted its retries"
                    );
                }
                Ok(Attempt::Failed)
            }
            None => {
                tracing::warn!(notification_id = row.id, "Notification changed during send");
                Ok(Attempt::Skipped)
            }
        }
    }

    /// Expire unleased PENDING rows past `expires_at`.
    pub async fn expire_stale(&self, now: Timestamp) -> EngineResult<u64> {
        let expired = self.notifications.expire_stale(now).await?;
        if expired > 0 {
            tracing::info!(expired, "Expired stale notifications");
            self.bus.publish(
                EngineEvent::new(NOTIFICATION_EXPIRED)
                    .with_payload(serde_json::json!({ "count": expired }))
                    .at(now),
            );
        }
        Ok(expired)
    }

    // -----------------------------------------------------------------------
    // Recipient-side transitions
    // -----------------------------------------------------------------------

    /// `SENT | DELIVERED -> READ`; a no-op for every other status.
    pub async fn mark_read(
        &self,
        tenant_id: TenantId,
        id: DbId,
        now: Timestamp,
    ) -> EngineResult<Transition<Notification>> {
        self.apply(tenant_id, id, NOTIFICATION_READ, now, |n| {
            transitions::mark_read(n, now)
        })
        .await
    }

    /// `SENT -> DELIVERED` on a provider receipt.
    pub async fn mark_delivered(
        &self,
        tenant_id: TenantId,
        id: DbId,
        now: Timestamp,
    ) -> EngineResult<Transition<Notification>> {
        self.apply(tenant_id, id, NOTIFICATION_DELIVERED, now, |n| {
            transitions::mark_delivered(n, now)
        })
        .await
    }

    /// `PENDING -> CANCELLED` unless a worker currently holds the row.
    pub async fn cancel(
        &self,
        tenant_id: TenantId,
        id: DbId,
        now: Timestamp,
    ) -> EngineResult<Transition<Notification>> {
        match self.notifications.cancel_notification(tenant_id, id, now).await? {
            Some(cancelled) => {
                self.publish(NOTIFICATION_CANCELLED, &cancelled, now);
                Ok(Transition::Changed(cancelled))
            }
            None => Ok(Transition::Unchanged(self.get(tenant_id, id).await?)),
        }
    }

    async fn apply<F>(
        &self,
        tenant_id: TenantId,
        id: DbId,
        event_type: &str,
        now: Timestamp,
        transition: F,
    ) -> EngineResult<Transition<Notification>>
    where
        F: Fn(&Notification) -> Option<Notification>,
    {
        for _ in 0..MAX_WRITE_ATTEMPTS {
            let current = self.get(tenant_id, id).await?;
            let Some(next) = transition(&current) else {
                return Ok(Transition::Unchanged(current));
            };
            if let Some(stored) = self
                .notifications
                .update_notification(&next, current.status)
                .await?
            {
                self.publish(event_type, &stored, now);
                return Ok(Transition::Changed(stored));
            }
        }
        Err(CoreError::Conflict(format!("Notification {id} kept changing during update")).into())
    }

    /// Delete exhausted FAILED rows among `ids`. The only deletion path.
    pub async fn clear_dead_letters(
        &self,
        tenant_id: TenantId,
        ids: &[DbId],
        now: Timestamp,
    ) -> EngineResult<u64> {
        let deleted = self
            .notifications
            .delete_dead_letters(tenant_id, ids, self.config.max_retries)
            .await?;
        tracing::info!(tenant_id, requested = ids.len(), deleted, "Dead letters cleared");
        self.bus.publish(
            EngineEvent::new(NOTIFICATION_DEAD_LETTERS_CLEARED)
                .for_tenant(tenant_id)
                .with_payload(serde_json::json!({ "ids": ids, "deleted": deleted }))
                .at(now),
        );
        Ok(deleted)
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub async fn get(&self, tenant_id: TenantId, id: DbId) -> EngineResult<Notification> {
        self.notifications
            .get_notification(tenant_id, id)
            .await?
            .ok_or_else(|| {
                CoreError::NotFound {
                    entity: "Notification",
                    id,
                }
                .into()
            })
    }

    pub async fn list(
        &self,
        tenant_id: TenantId,
        filter: &NotificationFilter,
    ) -> EngineResult<Vec<Notification>> {
        self.notifications.list_notifications(tenant_id, filter).await
    }

    pub async fn unread_count(&self, tenant_id: TenantId, recipient_id: DbId) -> EngineResult<i64> {
        self.notifications.unread_count(tenant_id, recipient_id).await
    }

    /// Delivery statistics for rows created in `[from, to]`.
    pub async fn statistics(
        &self,
        tenant_id: TenantId,
        from: Timestamp,
        to: Timestamp,
    ) -> EngineResult<NotificationStatistics> {
        let filter = NotificationFilter {
            created_from: Some(from),
            created_to: Some(to),
            ..Default::default()
        };
        let rows = self.notifications.list_notifications(tenant_id, &filter).await?;
        Ok(NotificationStatistics::summarize(&rows, self.config.max_retries))
    }

    fn publish(&self, event_type: &str, n: &Notification, now: Timestamp) {
        self.bus.publish(
            EngineEvent::new(event_type)
                .for_tenant(n.tenant_id)
                .with_entity("notification", n.id)
                .with_payload(serde_json::json!({
                    "alert_id": n.alert_id,
                    "recipient_id": n.recipient_id,
                    "channel": n.channel,
                    "status": n.status,
                    "retry_count": n.retry_count,
                    "error": n.error_message,
                }))
                .at(now),
        );
    }
}
