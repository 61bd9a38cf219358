//! Read-side summaries over alerts and notifications.
//!
//! Both summarizers are pure folds so they can be computed from whatever a
//! store returns for a tenant and date range.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::alert::{state_machine, Alert, AlertStatus, Severity};
use crate::escalation::EscalationPolicy;
use crate::notification::{Channel, Notification, NotificationStatus};
use crate::types::Timestamp;

/// Number of critical open alerts surfaced on the dashboard.
pub const CRITICAL_OPEN_LIMIT: usize = 10;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResolutionTimes {
    pub average_minutes: Option<f64>,
    pub min_minutes: Option<f64>,
    pub max_minutes: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AlertDashboard {
    pub total: usize,
    pub open_by_severity: BTreeMap<Severity, usize>,
    pub by_status: BTreeMap<String, usize>,
    pub escalated: usize,
    pub recurring: usize,
    pub auto_resolved: usize,
    pub resolution: ResolutionTimes,
    /// Latest critical open alerts, newest first.
    pub critical_open: Vec<Alert>,
    pub pending_escalation: usize,
}

impl AlertDashboard {
    pub fn summarize(alerts: &[Alert], policy: &EscalationPolicy, now: Timestamp) -> Self {
        let mut dashboard = AlertDashboard {
            total: alerts.len(),
            ..Default::default()
        };
        let mut resolution_minutes = Vec::new();

        for alert in alerts {
            *dashboard
                .by_status
                .entry(alert.status.as_str().to_string())
                .or_default() += 1;
            if alert.is_open() {
                *dashboard.open_by_severity.entry(alert.severity).or_default() += 1;
            }
            if alert.escalation_level > 0 {
                dashboard.escalated += 1;
            }
            if alert.recurrence_count > 1 {
                dashboard.recurring += 1;
            }
            if alert.auto_resolved {
                dashboard.auto_resolved += 1;
            }
            if alert.status == AlertStatus::Resolved {
                if let Some(minutes) = alert.resolution_minutes() {
                    resolution_minutes.push(minutes);
                }
            }
            if state_machine::needs_escalation(
                alert,
                policy.threshold_minutes,
                policy.max_level,
                now,
            ) {
                dashboard.pending_escalation += 1;
            }
        }

        dashboard.resolution = resolution_times(&resolution_minutes);

        let mut critical: Vec<&Alert> = alerts
            .iter()
            .filter(|a| a.is_open() && a.severity == Severity::Critical)
            .collect();
        critical.sort_by(|a, b| b.triggered_at.cmp(&a.triggered_at));
        dashboard.critical_open = critical
            .into_iter()
            .take(CRITICAL_OPEN_LIMIT)
            .cloned()
            .collect();

        dashboard
    }
}

fn resolution_times(minutes: &[f64]) -> ResolutionTimes {
    if minutes.is_empty() {
        return ResolutionTimes::default();
    }
    let sum: f64 = minutes.iter().sum();
    ResolutionTimes {
        average_minutes: Some(sum / minutes.len() as f64),
        min_minutes: minutes.iter().copied().reduce(f64::min),
        max_minutes: minutes.iter().copied().reduce(f64::max),
    }
}

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NotificationStatistics {
    pub total: usize,
    pub by_status: BTreeMap<String, usize>,
    pub by_channel: BTreeMap<Channel, usize>,
    pub dead_letters: usize,
    /// delivered / sent
    pub delivery_rate: f64,
    /// read / delivered
    pub read_rate: f64,
    /// failed / (sent + failed)
    pub failure_rate: f64,
}

impl NotificationStatistics {
    /// `sent` counts every row that left the engine (SENT, DELIVERED, READ);
    /// `delivered` counts DELIVERED and READ.
    pub fn summarize(notifications: &[Notification], max_retries: i32) -> Self {
        let mut stats = NotificationStatistics {
            total: notifications.len(),
            ..Default::default()
        };
        let (mut sent, mut delivered, mut read, mut failed) = (0usize, 0usize, 0usize, 0usize);

        for n in notifications {
            *stats
                .by_status
                .entry(n.status.as_str().to_string())
                .or_default() += 1;
            *stats.by_channel.entry(n.channel).or_default() += 1;
            if n.status.is_sent_like() {
                sent += 1;
            }
            match n.status {
                NotificationStatus::Delivered => delivered += 1,
                NotificationStatus::Read => {
                    delivered += 1;
                    read += 1;
                }
                NotificationStatus::Failed => failed += 1,
                _ => {}
            }
            if n.is_dead_letter(max_retries) {
                stats.dead_letters += 1;
            }
        }

        stats.delivery_rate = ratio(delivered, sent);
        stats.read_rate = ratio(read, delivered);
        stats.failure_rate = ratio(failed, sent + failed);
        stats
    }
}

fn ratio(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};

    use super::*;
    use crate::alert::{RaiseAlert, SourceKey};
    use crate::notification::PRIORITY_NORMAL;
    use crate::types::Metadata;

    fn t0() -> Timestamp {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()
    }

    fn alert(source_id: &str, severity: Severity, at: Timestamp) -> Alert {
        state_machine::open(
            1,
            RaiseAlert::new(SourceKey::new("meter", source_id, "USAGE_SPIKE"), severity),
            at,
        )
    }

    fn notification(channel: Channel, status: NotificationStatus, retry_count: i32) -> Notification {
        Notification {
            id: 1,
            tenant_id: 1,
            alert_id: None,
            setting_id: None,
            recipient_id: 1,
            notification_type: "USAGE_SPIKE".into(),
            title: "t".into(),
            message: "m".into(),
            channel,
            status,
            priority_level: PRIORITY_NORMAL,
            scheduled_at: None,
            expires_at: None,
            retry_count,
            error_message: None,
            sent_at: None,
            delivered_at: None,
            read_at: None,
            last_attempt_at: None,
            locked_until: None,
            metadata: Metadata::new(),
            created_at: t0(),
        }
    }

    #[test]
    fn dashboard_counts_and_resolution_times() {
        let resolved_fast =
            state_machine::resolve(&alert("a", Severity::Low, t0()), None, None, t0() + Duration::minutes(10))
                .unwrap();
        let resolved_slow =
            state_machine::auto_resolve(&alert("b", Severity::Low, t0()), "ok", t0() + Duration::minutes(30))
                .unwrap();
        let mut recurring = alert("c", Severity::Critical, t0() + Duration::minutes(5));
        recurring.recurrence_count = 3;
        let stale = alert("d", Severity::Critical, t0() - Duration::hours(2));

        let dashboard = AlertDashboard::summarize(
            &[resolved_fast, resolved_slow, recurring, stale],
            &EscalationPolicy::default(),
            t0() + Duration::minutes(30),
        );

        assert_eq!(dashboard.total, 4);
        assert_eq!(dashboard.by_status.get("RESOLVED"), Some(&2));
        assert_eq!(dashboard.open_by_severity.get(&Severity::Critical), Some(&2));
        assert_eq!(dashboard.recurring, 1);
        assert_eq!(dashboard.auto_resolved, 1);
        assert_eq!(dashboard.resolution.average_minutes, Some(20.0));
        assert_eq!(dashboard.resolution.min_minutes, Some(10.0));
        assert_eq!(dashboard.resolution.max_minutes, Some(30.0));
        assert_eq!(dashboard.pending_escalation, 1);
        assert_eq!(dashboard.critical_open[0].source_id, "c");
    }

    #[test]
    fn empty_dashboard_has_no_resolution_times() {
        let dashboard = AlertDashboard::summarize(&[], &EscalationPolicy::default(), t0());
        assert_eq!(dashboard.resolution, ResolutionTimes::default());
        assert!(dashboard.critical_open.is_empty());
    }

    #[test]
    fn notification_rates() {
        let rows = vec![
            notification(Channel::Email, NotificationStatus::Sent, 0),
            notification(Channel::Email, NotificationStatus::Delivered, 0),
            notification(Channel::Sms, NotificationStatus::Read, 0),
            notification(Channel::Sms, NotificationStatus::Failed, 3),
            notification(Channel::Push, NotificationStatus::Pending, 0),
        ];
        let stats = NotificationStatistics::summarize(&rows, 3);
        assert_eq!(stats.total, 5);
        assert_eq!(stats.by_channel.get(&Channel::Sms), Some(&2));
        assert_eq!(stats.dead_letters, 1);
        assert!((stats.delivery_rate - 2.0 / 3.0).abs() < 1e-9);
        assert!((stats.read_rate - 0.5).abs() < 1e-9);
        assert!((stats.failure_rate - 0.25).abs() < 1e-9);
    }

    #[test]
    fn rates_are_zero_without_denominators() {
        let stats = NotificationStatistics::summarize(&[], 3);
        assert_eq!(stats.delivery_rate, 0.0);
        assert_eq!(stats.failure_rate, 0.0);
    }
}
