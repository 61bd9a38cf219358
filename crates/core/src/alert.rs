//! Alert domain types and the alert lifecycle state machine.
//!
//! This module lives in `core` (zero internal deps) so the transition rules
//! can be exercised without any storage. Every transition in
//! [`state_machine`] is a pure function: it takes the current [`Alert`] and
//! returns `Some(next)` when the record changes, or `None` when the requested
//! transition does not apply. Callers treat `None` as an idempotent no-op,
//! which is what makes repeated scheduler sweeps safe.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::error::CoreError;
use crate::types::{DbId, Metadata, TenantId, Timestamp};

/// Default maximum escalation level.
pub const DEFAULT_MAX_ESCALATION_LEVEL: i32 = 3;

// ---------------------------------------------------------------------------
// Severity
// ---------------------------------------------------------------------------

/// Alert severity, ordered `Low < Medium < High < Critical`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub const ALL: [Severity; 4] = [
        Severity::Low,
        Severity::Medium,
        Severity::High,
        Severity::Critical,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "LOW",
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
            Severity::Critical => "CRITICAL",
        }
    }

    /// One step up the severity order, saturating at `Critical`.
    pub fn escalated(self) -> Self {
        match self {
            Severity::Low => Severity::Medium,
            Severity::Medium => Severity::High,
            Severity::High | Severity::Critical => Severity::Critical,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "LOW" => Ok(Severity::Low),
            "MEDIUM" => Ok(Severity::Medium),
            "HIGH" => Ok(Severity::High),
            "CRITICAL" => Ok(Severity::Critical),
            other => Err(CoreError::Validation(format!(
                "Unknown alert severity: {other}"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// AlertStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertStatus {
    Active,
    Acknowledged,
    Resolved,
    Suppressed,
    Expired,
}

impl AlertStatus {
    pub const ALL: [AlertStatus; 5] = [
        AlertStatus::Active,
        AlertStatus::Acknowledged,
        AlertStatus::Resolved,
        AlertStatus::Suppressed,
        AlertStatus::Expired,
    ];

    /// Statuses that count towards the one-open-alert-per-key invariant.
    pub const OPEN: [AlertStatus; 3] = [
        AlertStatus::Active,
        AlertStatus::Acknowledged,
        AlertStatus::Suppressed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AlertStatus::Active => "ACTIVE",
            AlertStatus::Acknowledged => "ACKNOWLEDGED",
            AlertStatus::Resolved => "RESOLVED",
            AlertStatus::Suppressed => "SUPPRESSED",
            AlertStatus::Expired => "EXPIRED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, AlertStatus::Resolved | AlertStatus::Expired)
    }
}

impl fmt::Display for AlertStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AlertStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ACTIVE" => Ok(AlertStatus::Active),
            "ACKNOWLEDGED" => Ok(AlertStatus::Acknowledged),
            "RESOLVED" => Ok(AlertStatus::Resolved),
            "SUPPRESSED" => Ok(AlertStatus::Suppressed),
            "EXPIRED" => Ok(AlertStatus::Expired),
            other => Err(CoreError::Validation(format!("Unknown alert status: {other}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Alert
// ---------------------------------------------------------------------------

/// Deduplication key: one open alert per `(source_type, source_id, alert_type)`
/// within a tenant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceKey {
    pub source_type: String,
    pub source_id: String,
    pub alert_type: String,
}

impl SourceKey {
    pub fn new(
        source_type: impl Into<String>,
        source_id: impl Into<String>,
        alert_type: impl Into<String>,
    ) -> Self {
        Self {
            source_type: source_type.into(),
            source_id: source_id.into(),
            alert_type: alert_type.into(),
        }
    }
}

impl fmt::Display for SourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.source_type, self.source_id, self.alert_type)
    }
}

/// A detected threshold/anomaly condition requiring attention.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: DbId,
    pub tenant_id: TenantId,
    pub source_type: String,
    pub source_id: String,
    pub alert_type: String,
    pub title: String,
    pub message: String,
    pub severity: Severity,
    pub status: AlertStatus,
    pub triggered_at: Timestamp,
    pub acknowledged_at: Option<Timestamp>,
    pub acknowledged_by: Option<DbId>,
    pub resolved_at: Option<Timestamp>,
    pub resolved_by: Option<DbId>,
    pub resolution_notes: Option<String>,
    pub auto_resolved: bool,
    pub escalation_level: i32,
    pub escalated_at: Option<Timestamp>,
    /// Highest escalation level whose notification batch has been enqueued.
    pub notified_level: i32,
    pub suppressed_until: Option<Timestamp>,
    pub recurrence_count: i32,
    pub last_occurrence: Timestamp,
    pub threshold_value: Option<f64>,
    pub current_value: Option<f64>,
    pub metadata: Metadata,
    /// Optimistic-concurrency counter, bumped by the store on every write.
    pub version: i32,
}

impl Alert {
    pub fn key(&self) -> SourceKey {
        SourceKey::new(&self.source_type, &self.source_id, &self.alert_type)
    }

    pub fn is_open(&self) -> bool {
        !self.status.is_terminal()
    }

    /// Minutes between trigger and resolution, if resolved.
    pub fn resolution_minutes(&self) -> Option<f64> {
        self.resolved_at
            .map(|resolved| (resolved - self.triggered_at).num_seconds() as f64 / 60.0)
    }
}

/// Producer input for raising an alert.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct RaiseAlert {
    #[validate(length(min = 1, max = 50))]
    pub source_type: String,
    #[validate(length(min = 1, max = 100))]
    pub source_id: String,
    #[validate(length(min = 1, max = 50))]
    pub alert_type: String,
    pub severity: Severity,
    #[validate(length(max = 200))]
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub message: String,
    pub threshold_value: Option<f64>,
    pub current_value: Option<f64>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl RaiseAlert {
    pub fn new(key: SourceKey, severity: Severity) -> Self {
        Self {
            source_type: key.source_type,
            source_id: key.source_id,
            alert_type: key.alert_type,
            severity,
            title: String::new(),
            message: String::new(),
            threshold_value: None,
            current_value: None,
            metadata: Metadata::new(),
        }
    }

    pub fn with_values(mut self, threshold_value: f64, current_value: f64) -> Self {
        self.threshold_value = Some(threshold_value);
        self.current_value = Some(current_value);
        self
    }

    pub fn with_text(mut self, title: impl Into<String>, message: impl Into<String>) -> Self {
        self.title = title.into();
        self.message = message.into();
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn key(&self) -> SourceKey {
        SourceKey::new(&self.source_type, &self.source_id, &self.alert_type)
    }
}

/// Operator-side filter for listing alerts.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AlertFilter {
    #[serde(default)]
    pub statuses: Vec<AlertStatus>,
    #[serde(default)]
    pub severities: Vec<Severity>,
    #[serde(default)]
    pub alert_types: Vec<String>,
    pub triggered_from: Option<Timestamp>,
    pub triggered_to: Option<Timestamp>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl AlertFilter {
    pub fn matches(&self, alert: &Alert) -> bool {
        (self.statuses.is_empty() || self.statuses.contains(&alert.status))
            && (self.severities.is_empty() || self.severities.contains(&alert.severity))
            && (self.alert_types.is_empty() || self.alert_types.contains(&alert.alert_type))
            && self.triggered_from.map_or(true, |from| alert.triggered_at >= from)
            && self.triggered_to.map_or(true, |to| alert.triggered_at <= to)
    }
}

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

pub mod state_machine {
    use chrono::Duration;

    use super::*;

    /// Build a fresh `ACTIVE` alert for a first trigger. `id` and `version`
    /// are assigned by the store on insert.
    pub fn open(tenant_id: TenantId, input: RaiseAlert, now: Timestamp) -> Alert {
        Alert {
            id: 0,
            tenant_id,
            source_type: input.source_type,
            source_id: input.source_id,
            alert_type: input.alert_type,
            title: input.title,
            message: input.message,
            severity: input.severity,
            status: AlertStatus::Active,
            triggered_at: now,
            acknowledged_at: None,
            acknowledged_by: None,
            resolved_at: None,
            resolved_by: None,
            resolution_notes: None,
            auto_resolved: false,
            escalation_level: 0,
            escalated_at: None,
            notified_level: 0,
            suppressed_until: None,
            recurrence_count: 1,
            last_occurrence: now,
            threshold_value: input.threshold_value,
            current_value: input.current_value,
            metadata: input.metadata,
            version: 0,
        }
    }

    /// Re-trigger of an existing alert for the same key.
    ///
    /// Open alerts only count the recurrence; a `RESOLVED` alert is reopened
    /// to `ACTIVE` with its resolution cleared. Severity never decreases on
    /// recurrence. `EXPIRED` alerts are not recurrence targets and yield `None`.
    pub fn recur(alert: &Alert, input: &RaiseAlert, now: Timestamp) -> Option<Alert> {
        if alert.status == AlertStatus::Expired {
            return None;
        }
        let mut next = alert.clone();
        next.recurrence_count += 1;
        next.last_occurrence = now;
        next.severity = alert.severity.max(input.severity);
        if input.current_value.is_some() {
            next.current_value = input.current_value;
        }
        if input.threshold_value.is_some() {
            next.threshold_value = input.threshold_value;
        }
        for (k, v) in &input.metadata {
            next.metadata.insert(k.clone(), v.clone());
        }
        if alert.status == AlertStatus::Resolved {
            next.status = AlertStatus::Active;
            next.resolved_at = None;
            next.resolved_by = None;
            next.resolution_notes = None;
            next.auto_resolved = false;
        }
        Some(next)
    }

    /// `ACTIVE -> ACKNOWLEDGED`.
    pub fn acknowledge(alert: &Alert, by: Option<DbId>, now: Timestamp) -> Option<Alert> {
        if alert.status != AlertStatus::Active {
            return None;
        }
        let mut next = alert.clone();
        next.status = AlertStatus::Acknowledged;
        next.acknowledged_at = Some(now);
        next.acknowledged_by = by;
        Some(next)
    }

    /// `{ACTIVE, ACKNOWLEDGED} -> RESOLVED` by an operator.
    pub fn resolve(
        alert: &Alert,
        by: Option<DbId>,
        notes: Option<String>,
        now: Timestamp,
    ) -> Option<Alert> {
        if !matches!(alert.status, AlertStatus::Active | AlertStatus::Acknowledged) {
            return None;
        }
        let mut next = alert.clone();
        next.status = AlertStatus::Resolved;
        next.resolved_at = Some(now);
        next.resolved_by = by;
        next.resolution_notes = notes;
        next.auto_resolved = false;
        Some(next)
    }

    /// `{ACTIVE, ACKNOWLEDGED} -> RESOLVED` without an operator.
    pub fn auto_resolve(alert: &Alert, reason: &str, now: Timestamp) -> Option<Alert> {
        let mut next = resolve(alert, None, Some(format!("Auto-resolved: {reason}")), now)?;
        next.auto_resolved = true;
        Some(next)
    }

    /// `{ACTIVE, ACKNOWLEDGED} -> SUPPRESSED` until `now + minutes`.
    pub fn suppress(
        alert: &Alert,
        minutes: i64,
        now: Timestamp,
    ) -> Result<Option<Alert>, CoreError> {
        if minutes <= 0 {
            return Err(CoreError::Validation(format!(
                "Suppression duration must be positive, got {minutes} minutes"
            )));
        }
        if !matches!(alert.status, AlertStatus::Active | AlertStatus::Acknowledged) {
            return Ok(None);
        }
        let mut next = alert.clone();
        next.status = AlertStatus::Suppressed;
        next.suppressed_until = Some(now + Duration::minutes(minutes));
        Ok(Some(next))
    }

    /// `SUPPRESSED -> ACTIVE` once the suppression deadline has passed.
    pub fn restore_suppression(alert: &Alert, now: Timestamp) -> Option<Alert> {
        if alert.status != AlertStatus::Suppressed {
            return None;
        }
        if alert.suppressed_until.is_some_and(|until| until >= now) {
            return None;
        }
        let mut next = alert.clone();
        next.status = AlertStatus::Active;
        next.suppressed_until = None;
        Some(next)
    }

    /// Raise an `ACTIVE` alert one escalation level and one severity step.
    ///
    /// Returns `None` for non-active alerts and for alerts already at
    /// `max_level`, so levels never skip and never exceed the cap.
    pub fn escalate(alert: &Alert, max_level: i32, now: Timestamp) -> Option<Alert> {
        if alert.status != AlertStatus::Active || alert.escalation_level >= max_level {
            return None;
        }
        let mut next = alert.clone();
        next.escalation_level += 1;
        next.severity = alert.severity.escalated();
        next.escalated_at = Some(now);
        Some(next)
    }

    /// Any open status `-> EXPIRED`.
    pub fn expire(alert: &Alert) -> Option<Alert> {
        if alert.status.is_terminal() {
            return None;
        }
        let mut next = alert.clone();
        next.status = AlertStatus::Expired;
        next.suppressed_until = None;
        Some(next)
    }

    /// True iff the alert is `ACTIVE`, has been open longer than
    /// `threshold_minutes`, and is below `max_level`.
    pub fn needs_escalation(
        alert: &Alert,
        threshold_minutes: i64,
        max_level: i32,
        now: Timestamp,
    ) -> bool {
        alert.status == AlertStatus::Active
            && now - alert.triggered_at > Duration::minutes(threshold_minutes)
            && alert.escalation_level < max_level
    }

    /// True if the alert is `ACTIVE` and its current level has not been
    /// announced yet.
    pub fn awaits_notification(alert: &Alert) -> bool {
        alert.status == AlertStatus::Active && alert.notified_level < alert.escalation_level
    }

    /// Claim the announcement of the current level.
    pub fn claim_notification(alert: &Alert) -> Option<Alert> {
        if !awaits_notification(alert) {
            return None;
        }
        let mut next = alert.clone();
        next.notified_level = alert.escalation_level;
        Some(next)
    }

    /// Hand a claim on `level` back so a later sweep announces it again.
    pub fn release_notification(alert: &Alert, level: i32, previous: i32) -> Option<Alert> {
        if alert.notified_level != level {
            return None;
        }
        let mut next = alert.clone();
        next.notified_level = previous;
        Some(next)
    }

    /// True if the alert was escalated less than `window_minutes` ago.
    pub fn escalated_within(alert: &Alert, window_minutes: i64, now: Timestamp) -> bool {
        alert
            .escalated_at
            .is_some_and(|at| now - at < Duration::minutes(window_minutes))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
