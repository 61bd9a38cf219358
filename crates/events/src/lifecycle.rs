//! Alert lifecycle manager.
//!
//! Applies the pure transitions from [`beacon_core::alert::state_machine`] to
//! stored alerts. Every write is a compare-and-swap on `version`: when
//! another writer got there first, the alert is reloaded and the transition
//! re-applied to the fresh state, up to [`MAX_CAS_ATTEMPTS`] times. A
//! transition that does not apply to the current state is a no-op and
//! returns [`Transition::Unchanged`].

use std::sync::Arc;

use beacon_core::alert::{
    state_machine, Alert, AlertFilter, AlertStatus, RaiseAlert, SourceKey,
};
use beacon_core::error::CoreError;
use beacon_core::escalation::EscalationPolicy;
use beacon_core::stats::AlertDashboard;
use beacon_core::types::{DbId, TenantId, Timestamp};
use chrono::Duration;
use validator::Validate;

use crate::bus::{
    EngineEvent, EventBus, ALERT_ACKNOWLEDGED, ALERT_AUTO_RESOLVED, ALERT_ESCALATED,
    ALERT_EXPIRED, ALERT_NOTIFIED, ALERT_NOTIFY_RELEASED, ALERT_RAISED, ALERT_RECURRED,
    ALERT_REOPENED, ALERT_RESOLVED, ALERT_RESTORED, ALERT_SUPPRESSED,
};
use crate::error::{EngineError, EngineResult};
use crate::store::AlertStore;
use crate::transition::Transition;

/// Write attempts before a transition gives up with a conflict.
pub const MAX_CAS_ATTEMPTS: usize = 5;

/// What `raise` did with the incoming trigger.
#[derive(Debug, Clone, PartialEq)]
pub enum RaiseOutcome {
    Created(Alert),
    /// Counted against an alert that was still open.
    Recurred(Alert),
    /// A resolved alert for the same key came back to `ACTIVE`.
    Reopened(Alert),
}

impl RaiseOutcome {
    pub fn alert(&self) -> &Alert {
        match self {
            RaiseOutcome::Created(a) | RaiseOutcome::Recurred(a) | RaiseOutcome::Reopened(a) => a,
        }
    }

    pub fn id(&self) -> DbId {
        self.alert().id
    }
}

pub struct AlertManager {
    alerts: Arc<dyn AlertStore>,
    bus: Arc<EventBus>,
    policy: EscalationPolicy,
}

impl AlertManager {
    pub fn new(alerts: Arc<dyn AlertStore>, bus: Arc<EventBus>, policy: EscalationPolicy) -> Self {
        Self {
            alerts,
            bus,
            policy,
        }
    }

    pub fn policy(&self) -> &EscalationPolicy {
        &self.policy
    }

    // -----------------------------------------------------------------------
    // Producer side
    // -----------------------------------------------------------------------

    /// Record a trigger for `input.key()`.
    ///
    /// An open or resolved alert for the key absorbs the trigger as a
    /// recurrence (a resolved one is reopened). Otherwise, including when the
    /// latest alert for the key has expired, a new `ACTIVE` alert is created.
    pub async fn raise(
        &self,
        tenant_id: TenantId,
        input: RaiseAlert,
        now: Timestamp,
    ) -> EngineResult<RaiseOutcome> {
        input.validate()?;
        let key = input.key();

        for _ in 0..MAX_CAS_ATTEMPTS {
            match self.alerts.find_latest_for_key(tenant_id, &key).await? {
                Some(existing) => {
                    let Some(next) = state_machine::recur(&existing, &input, now) else {
                        // Expired between lookup and transition; look again.
                        continue;
                    };
                    let reopened = existing.status == AlertStatus::Resolved;
                    match self.alerts.update_alert(&next).await {
                        Ok(Some(stored)) => {
                            let (event_type, outcome) = if reopened {
                                (ALERT_REOPENED, RaiseOutcome::Reopened(stored))
                            } else {
                                (ALERT_RECURRED, RaiseOutcome::Recurred(stored))
                            };
                            self.publish(event_type, outcome.alert(), None, now);
                            tracing::info!(
                                tenant_id,
                                alert_id = outcome.id(),
                                key = %key,
                                recurrence_count = outcome.alert().recurrence_count,
                                reopened,
                                "Alert recurred"
                            );
                            return Ok(outcome);
                        }
                        Ok(None) => continue,
                        Err(e) if e.is_conflict() => continue,
                        Err(e) => return Err(e),
                    }
                }
                None => {
                    let fresh = state_machine::open(tenant_id, input.clone(), now);
                    match self.alerts.insert_alert(&fresh).await {
                        Ok(stored) => {
                            self.publish(ALERT_RAISED, &stored, None, now);
                            tracing::info!(
                                tenant_id,
                                alert_id = stored.id,
                                key = %key,
                                severity = %stored.severity,
                                "Alert raised"
                            );
                            return Ok(RaiseOutcome::Created(stored));
                        }
                        // Another producer opened it first; recur on theirs.
                        Err(e) if e.is_conflict() => continue,
                        Err(e) => return Err(e),
                    }
                }
            }
        }
        Err(CoreError::Conflict(format!("Alert for {key} kept changing while raising")).into())
    }

    /// Auto-resolve the open alert for `key`, if there is one.
    pub async fn try_auto_resolve(
        &self,
        tenant_id: TenantId,
        key: &SourceKey,
        reason: &str,
        now: Timestamp,
    ) -> EngineResult<Option<Alert>> {
        let Some(latest) = self.alerts.find_latest_for_key(tenant_id, key).await? else {
            return Ok(None);
        };
        if !latest.is_open() {
            return Ok(None);
        }
        let result = self.auto_resolve(tenant_id, latest.id, reason, now).await?;
        Ok(result.changed().then(|| result.into_inner()))
    }

    // -----------------------------------------------------------------------
    // Operator side
    // -----------------------------------------------------------------------

    pub async fn acknowledge(
        &self,
        tenant_id: TenantId,
        id: DbId,
        by: Option<DbId>,
        now: Timestamp,
    ) -> EngineResult<Transition<Alert>> {
        self.apply(tenant_id, id, ALERT_ACKNOWLEDGED, by, now, |a| {
            Ok(state_machine::acknowledge(a, by, now))
        })
        .await
    }

    pub async fn resolve(
        &self,
        tenant_id: TenantId,
        id: DbId,
        by: Option<DbId>,
        notes: Option<String>,
        now: Timestamp,
    ) -> EngineResult<Transition<Alert>> {
        self.apply(tenant_id, id, ALERT_RESOLVED, by, now, |a| {
            Ok(state_machine::resolve(a, by, notes.clone(), now))
        })
        .await
    }

    pub async fn auto_resolve(
        &self,
        tenant_id: TenantId,
        id: DbId,
        reason: &str,
        now: Timestamp,
    ) -> EngineResult<Transition<Alert>> {
        self.apply(tenant_id, id, ALERT_AUTO_RESOLVED, None, now, |a| {
            Ok(state_machine::auto_resolve(a, reason, now))
        })
        .await
    }

    /// Suppress for `minutes`; a non-positive duration is a validation error.
    pub async fn suppress(
        &self,
        tenant_id: TenantId,
        id: DbId,
        minutes: i64,
        by: Option<DbId>,
        now: Timestamp,
    ) -> EngineResult<Transition<Alert>> {
        self.apply(tenant_id, id, ALERT_SUPPRESSED, by, now, |a| {
            state_machine::suppress(a, minutes, now)
        })
        .await
    }

    pub async fn expire(
        &self,
        tenant_id: TenantId,
        id: DbId,
        by: Option<DbId>,
        now: Timestamp,
    ) -> EngineResult<Transition<Alert>> {
        self.apply(tenant_id, id, ALERT_EXPIRED, by, now, |a| {
            Ok(state_machine::expire(a))
        })
        .await
    }

    /// Escalate one level regardless of how long the alert has been open.
    pub async fn escalate(
        &self,
        tenant_id: TenantId,
        id: DbId,
        by: Option<DbId>,
        now: Timestamp,
    ) -> EngineResult<Transition<Alert>> {
        let max_level = self.policy.max_level;
        self.apply(tenant_id, id, ALERT_ESCALATED, by, now, |a| {
            Ok(state_machine::escalate(a, max_level, now))
        })
        .await
    }

    /// Escalate one level if the alert is overdue and was not escalated
    /// within the threshold window. Both checks run against the state being
    /// swapped, so concurrent sweeps escalate at most once.
    pub async fn escalate_if_due(
        &self,
        tenant_id: TenantId,
        id: DbId,
        now: Timestamp,
    ) -> EngineResult<Transition<Alert>> {
        let policy = &self.policy;
        self.apply(tenant_id, id, ALERT_ESCALATED, None, now, |a| {
            let (threshold, max_level) = (policy.threshold_minutes, policy.max_level);
            if !state_machine::needs_escalation(a, threshold, max_level, now)
                || state_machine::escalated_within(a, threshold, now)
            {
                return Ok(None);
            }
            Ok(state_machine::escalate(a, max_level, now))
        })
        .await
    }

    /// Claim the announcement of the alert's current escalation level.
    ///
    /// Only one caller wins the claim for a level; the winner enqueues the
    /// batch and hands the claim back with
    /// [`release_notification`](Self::release_notification) if that fails.
    pub async fn claim_notification(
        &self,
        tenant_id: TenantId,
        id: DbId,
        now: Timestamp,
    ) -> EngineResult<Transition<Alert>> {
        self.apply(tenant_id, id, ALERT_NOTIFIED, None, now, |a| {
            Ok(state_machine::claim_notification(a))
        })
        .await
    }

    /// Return a claim on `level` to `previous`, so the next sweep retries it.
    pub async fn release_notification(
        &self,
        tenant_id: TenantId,
        id: DbId,
        level: i32,
        previous: i32,
        now: Timestamp,
    ) -> EngineResult<Transition<Alert>> {
        self.apply(tenant_id, id, ALERT_NOTIFY_RELEASED, None, now, |a| {
            Ok(state_machine::release_notification(a, level, previous))
        })
        .await
    }

    // -----------------------------------------------------------------------
    // Sweeps
    // -----------------------------------------------------------------------

    /// Reactivate every suppressed alert whose deadline has passed.
    pub async fn restore_expired_suppressions(
        &self,
        tenant_id: TenantId,
        now: Timestamp,
    ) -> EngineResult<Vec<Alert>> {
        let due = self.alerts.list_expired_suppressions(tenant_id, now).await?;
        let mut restored = Vec::with_capacity(due.len());
        for alert in due {
            match self
                .apply(tenant_id, alert.id, ALERT_RESTORED, None, now, |a| {
                    Ok(state_machine::restore_suppression(a, now))
                })
                .await
            {
                Ok(Transition::Changed(a)) => restored.push(a),
                Ok(Transition::Unchanged(_)) => {}
                Err(e) => {
                    tracing::warn!(
                        tenant_id,
                        alert_id = alert.id,
                        error = %e,
                        "Failed to restore suppressed alert"
                    );
                }
            }
        }
        if !restored.is_empty() {
            tracing::info!(tenant_id, restored = restored.len(), "Suppressions lifted");
        }
        Ok(restored)
    }

    /// Active alerts past the escalation threshold, below the level cap, and
    /// not escalated within the threshold window.
    pub async fn find_alerts_needing_escalation(
        &self,
        tenant_id: TenantId,
        now: Timestamp,
    ) -> EngineResult<Vec<Alert>> {
        let threshold = self.policy.threshold_minutes;
        let candidates = self
            .alerts
            .list_escalation_candidates(
                tenant_id,
                now - Duration::minutes(threshold),
                self.policy.max_level,
            )
            .await?;
        Ok(candidates
            .into_iter()
            .filter(|a| {
                state_machine::needs_escalation(a, threshold, self.policy.max_level, now)
                    && !state_machine::escalated_within(a, threshold, now)
            })
            .collect())
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub async fn get(&self, tenant_id: TenantId, id: DbId) -> EngineResult<Alert> {
        self.alerts
            .get_alert(tenant_id, id)
            .await?
            .ok_or_else(|| not_found(id))
    }

    pub async fn tenants_with_open_alerts(&self) -> EngineResult<Vec<TenantId>> {
        self.alerts.tenants_with_open_alerts().await
    }

    pub async fn list(&self, tenant_id: TenantId, filter: &AlertFilter) -> EngineResult<Vec<Alert>> {
        self.alerts.list_alerts(tenant_id, filter).await
    }

    /// Open alerts for a tenant, newest first.
    pub async fn open_alerts(&self, tenant_id: TenantId) -> EngineResult<Vec<Alert>> {
        let filter = AlertFilter {
            statuses: AlertStatus::OPEN.to_vec(),
            ..Default::default()
        };
        self.list(tenant_id, &filter).await
    }

    /// Dashboard over alerts triggered in `[from, to]`.
    pub async fn dashboard(
        &self,
        tenant_id: TenantId,
        from: Timestamp,
        to: Timestamp,
        now: Timestamp,
    ) -> EngineResult<AlertDashboard> {
        let filter = AlertFilter {
            triggered_from: Some(from),
            triggered_to: Some(to),
            ..Default::default()
        };
        let alerts = self.list(tenant_id, &filter).await?;
        Ok(AlertDashboard::summarize(&alerts, &self.policy, now))
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    async fn apply<F>(
        &self,
        tenant_id: TenantId,
        id: DbId,
        event_type: &str,
        actor_id: Option<DbId>,
        now: Timestamp,
        transition: F,
    ) -> EngineResult<Transition<Alert>>
    where
        F: Fn(&Alert) -> Result<Option<Alert>, CoreError>,
    {
        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let current = self.get(tenant_id, id).await?;
            let Some(next) = transition(&current)? else {
                return Ok(Transition::Unchanged(current));
            };
            if let Some(stored) = self.alerts.update_alert(&next).await? {
                self.publish(event_type, &stored, actor_id, now);
                tracing::info!(
                    tenant_id,
                    alert_id = id,
                    event_type,
                    status = %stored.status,
                    escalation_level = stored.escalation_level,
                    "Alert updated"
                );
                return Ok(Transition::Changed(stored));
            }
            tracing::debug!(tenant_id, alert_id = id, attempt, "Lost alert version race, retrying");
        }
        Err(CoreError::Conflict(format!("Alert {id} kept changing during update")).into())
    }

    fn publish(&self, event_type: &str, alert: &Alert, actor_id: Option<DbId>, now: Timestamp) {
        self.bus.publish(
            EngineEvent::new(event_type)
                .for_tenant(alert.tenant_id)
                .with_entity("alert", alert.id)
                .with_actor(actor_id)
                .with_payload(serde_json::json!({
                    "alert_type": alert.alert_type,
                    "source_type": alert.source_type,
                    "source_id": alert.source_id,
                    "status": alert.status,
                    "severity": alert.severity,
                    "escalation_level": alert.escalation_level,
                    "recurrence_count": alert.recurrence_count,
                }))
                .at(now),
        );
    }
}

fn not_found(id: DbId) -> EngineError {
    CoreError::NotFound { entity: "Alert", id }.into()
}
