//! Escalation scheduler.
//!
//! [`EscalationScheduler`] runs as a background task. Every tick it lifts
//! expired suppressions, escalates overdue alerts one level and fans the
//! escalation out to the audience for the new level, then asks the
//! registered [`AutoResolveCheck`]s whether any open alert has cleared.
//! Separate intervals drive the dispatch, retry and expiry passes.
//!
//! Delivery is never awaited by a tick: notification batches are handed to
//! a [`TaskTracker`] so a slow channel cannot delay the next sweep.

use std::sync::Arc;

use async_trait::async_trait;
use beacon_core::alert::{state_machine, Alert};
use beacon_core::escalation::EscalationPolicy;
use beacon_core::notification::PRIORITY_URGENT;
use beacon_core::settings::{self, NotificationSetting};
use beacon_core::template::Variables;
use beacon_core::types::{DbId, Metadata, TenantId, Timestamp};
use chrono::Utc;
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::EngineConfig;
use crate::dispatch::{Content, DispatchReport, NotificationDispatcher, NotificationRequest};
use crate::error::EngineResult;
use crate::lifecycle::AlertManager;
use crate::settings::SettingsMatcher;
use crate::transition::Transition;

/// Producer-supplied test for whether an open alert's condition has cleared.
#[async_trait]
pub trait AutoResolveCheck: Send + Sync {
    /// The reason the alert may be auto-resolved, or `None` while the
    /// condition still holds.
    async fn cleared(&self, alert: &Alert) -> Option<String>;
}

/// Counts from one scheduler tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub restored: usize,
    pub escalated: usize,
    pub auto_resolved: usize,
    /// Notification rows created for escalations, including rate-limited ones.
    pub enqueued: usize,
}

impl TickReport {
    pub fn is_empty(&self) -> bool {
        *self == TickReport::default()
    }
}

// ---------------------------------------------------------------------------
// EscalationScheduler
// ---------------------------------------------------------------------------

pub struct EscalationScheduler {
    manager: Arc<AlertManager>,
    dispatcher: NotificationDispatcher,
    matcher: SettingsMatcher,
    config: Arc<EngineConfig>,
    checks: Vec<Arc<dyn AutoResolveCheck>>,
    tracker: TaskTracker,
    /// Set once `run` starts shutting down; the tracker stays closed after.
    stopping: Mutex<bool>,
}

impl EscalationScheduler {
    pub fn new(
        manager: Arc<AlertManager>,
        dispatcher: NotificationDispatcher,
        matcher: SettingsMatcher,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            manager,
            dispatcher,
            matcher,
            config,
            checks: Vec::new(),
            tracker: TaskTracker::new(),
            stopping: Mutex::new(false),
        }
    }

    pub fn with_check(mut self, check: Arc<dyn AutoResolveCheck>) -> Self {
        self.checks.push(check);
        self
    }

    /// Tracker holding the delivery work handed off by ticks and passes.
    pub fn tracker(&self) -> &TaskTracker {
        &self.tracker
    }

    /// Wait for every delivery handed off so far.
    ///
    /// The tracker is reopened afterwards unless [`run`](Self::run) has begun
    /// shutting down in the meantime.
    pub async fn wait_idle(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        let stopping = self.stopping.lock().await;
        if !*stopping {
            self.tracker.reopen();
        }
    }

    /// Run all periodic jobs until `cancel` fires, then wait for in-flight
    /// deliveries to finish.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut sweep = tokio::time::interval(self.config.scheduler_tick);
        let mut dispatch = tokio::time::interval(self.config.dispatch_interval);
        let mut retry = tokio::time::interval(self.config.retry_interval);
        let mut expire = tokio::time::interval(self.config.expire_interval);
        for interval in [&mut sweep, &mut dispatch, &mut retry, &mut expire] {
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        }

        tracing::info!(
            tick_secs = self.config.scheduler_tick.as_secs(),
            threshold_minutes = self.manager.policy().threshold_minutes,
            max_level = self.manager.policy().max_level,
            "Escalation scheduler started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Escalation scheduler cancelled");
                    break;
                }
                _ = sweep.tick() => {
                    match self.tick(Utc::now()).await {
                        Ok(report) if !report.is_empty() => {
                            tracing::info!(?report, "Escalation sweep complete");
                        }
                        Ok(_) => tracing::debug!("Escalation sweep found nothing to do"),
                        Err(e) => tracing::error!(error = %e, "Escalation sweep failed"),
                    }
                }
                _ = dispatch.tick() => {
                    let dispatcher = self.dispatcher.clone();
                    self.tracker.spawn(async move {
                        log_pass("due", dispatcher.dispatch_due(Utc::now()).await);
                    });
                }
                _ = retry.tick() => {
                    let dispatcher = self.dispatcher.clone();
                    self.tracker.spawn(async move {
                        log_pass("retry", dispatcher.retry_failed(Utc::now()).await);
                    });
                }
                _ = expire.tick() => {
                    if let Err(e) = self.dispatcher.expire_stale(Utc::now()).await {
                        tracing::error!(error = %e, "Failed to expire stale notifications");
                    }
                }
            }
        }

        {
            let mut stopping = self.stopping.lock().await;
            *stopping = true;
            self.tracker.close();
        }
        self.tracker.wait().await;
        tracing::info!("Escalation scheduler stopped");
    }

    /// One sweep over every tenant with open alerts.
    ///
    /// Safe to run concurrently with itself: escalation is a version CAS
    /// guarded by the recency window, so an alert climbs at most one level
    /// per threshold window however many ticks race.
    pub async fn tick(&self, now: Timestamp) -> EngineResult<TickReport> {
        let mut report = TickReport::default();
        for tenant_id in self.manager.tenants_with_open_alerts().await? {
            if let Err(e) = self.tick_tenant(tenant_id, now, &mut report).await {
                tracing::error!(tenant_id, error = %e, "Escalation sweep failed for tenant");
            }
        }
        Ok(report)
    }

    async fn tick_tenant(
        &self,
        tenant_id: TenantId,
        now: Timestamp,
        report: &mut TickReport,
    ) -> EngineResult<()> {
        report.restored += self
            .manager
            .restore_expired_suppressions(tenant_id, now)
            .await?
            .len();

        for alert in self.manager.find_alerts_needing_escalation(tenant_id, now).await? {
            match self.manager.escalate_if_due(tenant_id, alert.id, now).await {
                Ok(Transition::Changed(_)) => report.escalated += 1,
                Ok(Transition::Unchanged(_)) => {}
                Err(e) => {
                    tracing::warn!(tenant_id, alert_id = alert.id, error = %e, "Escalation failed");
                }
            }
        }

        // Covers levels reached this tick and levels whose batch failed to
        // enqueue on an earlier one.
        let open = self.manager.open_alerts(tenant_id).await?;
        for alert in open.iter().filter(|a| state_machine::awaits_notification(a)) {
            report.enqueued += self.announce(alert, now).await;
        }

        if !self.checks.is_empty() {
            report.auto_resolved += self.run_checks(tenant_id, &open, now).await;
        }
        Ok(())
    }

    /// Claim the alert's current level and enqueue its batch. A failed
    /// enqueue hands the claim back so the next tick retries the level.
    async fn announce(&self, alert: &Alert, now: Timestamp) -> usize {
        let tenant_id = alert.tenant_id;
        let claimed = match self.manager.claim_notification(tenant_id, alert.id, now).await {
            Ok(Transition::Changed(claimed)) => claimed,
            Ok(Transition::Unchanged(_)) => return 0,
            Err(e) => {
                tracing::warn!(
                    tenant_id,
                    alert_id = alert.id,
                    error = %e,
                    "Failed to claim escalation notice"
                );
                return 0;
            }
        };

        match self.notify_escalation(&claimed, now).await {
            Ok(enqueued) => enqueued,
            Err(e) => {
                tracing::error!(
                    tenant_id,
                    alert_id = claimed.id,
                    escalation_level = claimed.escalation_level,
                    error = %e,
                    "Failed to enqueue escalation notifications, retrying next tick"
                );
                let released = self
                    .manager
                    .release_notification(
                        tenant_id,
                        claimed.id,
                        claimed.notified_level,
                        alert.notified_level,
                        now,
                    )
                    .await;
                if let Err(e) = released {
                    tracing::error!(
                        tenant_id,
                        alert_id = claimed.id,
                        error = %e,
                        "Failed to release escalation notice"
                    );
                }
                0
            }
        }
    }

    /// Enqueue the escalation batch for the alert's new level and hand the
    /// due rows to the tracker. Returns the number of rows created.
    async fn notify_escalation(&self, alert: &Alert, now: Timestamp) -> EngineResult<usize> {
        let candidates = self
            .matcher
            .active_settings(alert.tenant_id, &alert.alert_type)
            .await?;
        let requests = escalation_requests(self.manager.policy(), alert, &candidates);
        if requests.is_empty() {
            tracing::warn!(
                tenant_id = alert.tenant_id,
                alert_id = alert.id,
                escalation_level = alert.escalation_level,
                "No recipients configured for escalation level"
            );
            return Ok(0);
        }

        let mut created = 0;
        let mut due = Vec::new();
        for request in &requests {
            let rows = self.dispatcher.enqueue(alert.tenant_id, request, now).await?;
            created += rows.len();
            due.extend(rows.iter().filter(|n| n.is_due(now)).map(|n| n.id));
        }

        if !due.is_empty() {
            let dispatcher = self.dispatcher.clone();
            let alert_id = alert.id;
            self.tracker.spawn(async move {
                match dispatcher.dispatch_ids(&due, now).await {
                    Ok(report) => tracing::info!(
                        alert_id,
                        sent = report.sent,
                        failed = report.failed,
                        "Escalation notifications delivered"
                    ),
                    Err(e) => tracing::error!(
                        alert_id,
                        error = %e,
                        "Failed to dispatch escalation notifications"
                    ),
                }
            });
        }
        Ok(created)
    }

    async fn run_checks(&self, tenant_id: TenantId, open: &[Alert], now: Timestamp) -> usize {
        let mut resolved = 0;
        for alert in open {
            for check in &self.checks {
                let Some(reason) = check.cleared(alert).await else {
                    continue;
                };
                match self.manager.auto_resolve(tenant_id, alert.id, &reason, now).await {
                    Ok(result) if result.changed() => resolved += 1,
                    Ok(_) => {}
                    Err(e) => tracing::warn!(
                        tenant_id,
                        alert_id = alert.id,
                        error = %e,
                        "Auto-resolve failed"
                    ),
                }
                break;
            }
        }
        resolved
    }
}

fn log_pass(pass: &'static str, result: EngineResult<DispatchReport>) {
    match result {
        Ok(report) if report.claimed > 0 => tracing::info!(
            pass,
            claimed = report.claimed,
            sent = report.sent,
            failed = report.failed,
            expired = report.expired,
            "Dispatch pass complete"
        ),
        Ok(_) => {}
        Err(e) => tracing::error!(pass, error = %e, "Dispatch pass failed"),
    }
}

/// Notification batches for an alert that just reached its current level.
///
/// The audience is every active setting for the alert type whose priority
/// level is at or below the escalation level. Each recipient is sent once,
/// under the first setting that lists it, so that setting's rate limits
/// apply. Numeric source ids double as the setting scope.
pub(crate) fn escalation_requests(
    policy: &EscalationPolicy,
    alert: &Alert,
    candidates: &[NotificationSetting],
) -> Vec<NotificationRequest> {
    let level = alert.escalation_level;
    let channels = policy.channels_for(level).to_vec();
    if channels.is_empty() {
        return Vec::new();
    }
    let scope_id = alert.source_id.parse::<DbId>().ok();
    let eligible: Vec<&NotificationSetting> =
        settings::matching(candidates, &alert.alert_type, scope_id)
            .filter(|s| s.priority_level <= level)
            .collect();

    let mut groups: Vec<(DbId, Vec<DbId>)> = Vec::new();
    for recipient_id in policy.recipients_for(level, eligible.iter().copied()) {
        let Some(owner) = eligible.iter().find(|s| s.recipient_ids.contains(&recipient_id)) else {
            continue;
        };
        match groups.iter_mut().find(|(id, _)| *id == owner.id) {
            Some((_, recipients)) => recipients.push(recipient_id),
            None => groups.push((owner.id, vec![recipient_id])),
        }
    }

    let mut variables = Variables::new();
    variables.insert("alert_title".into(), alert.title.clone());
    variables.insert("alert_message".into(), alert.message.clone());
    variables.insert("alert_type".into(), alert.alert_type.clone());
    variables.insert("source_id".into(), alert.source_id.clone());
    variables.insert("severity".into(), alert.severity.to_string());
    variables.insert("escalation_level".into(), level.to_string());

    let mut metadata = Metadata::new();
    metadata.insert("escalation_level".into(), serde_json::json!(level));

    groups
        .into_iter()
        .map(|(setting_id, recipients)| {
            NotificationRequest::new(
                alert.alert_type.clone(),
                recipients,
                channels.clone(),
                Content::Typed {
                    language: None,
                    variables: variables.clone(),
                    title: policy.title_for(level, &alert.title),
                    message: policy.message_for(level, &alert.message),
                },
            )
            .priority(PRIORITY_URGENT)
            .for_alert(alert.id)
            .under_setting(setting_id)
            .with_metadata(metadata.clone())
        })
        .collect()
}
