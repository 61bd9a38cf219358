//! Notification domain types and delivery-state transitions.
//!
//! A [`Notification`] is one per-recipient, per-channel delivery attempt.
//! The transitions below mirror the alert state machine in
//! [`crate::alert`]: each returns `Some(next)` when the record changes and
//! `None` for a no-op.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::{DbId, Metadata, TenantId, Timestamp};

// ---------------------------------------------------------------------------
// Priority constants
// ---------------------------------------------------------------------------

/// Most urgent priority. Used by urgent alerts; dispatched before all others.
pub const PRIORITY_URGENT: i32 = 1;

/// Default priority for ordinary notifications.
pub const PRIORITY_NORMAL: i32 = 3;

/// Least urgent priority.
pub const PRIORITY_LOW: i32 = 5;

/// Default retry ceiling before a notification becomes a dead letter.
pub const DEFAULT_MAX_RETRIES: i32 = 3;

// ---------------------------------------------------------------------------
// Channel
// ---------------------------------------------------------------------------

/// Delivery medium.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Channel {
    Email,
    Sms,
    Push,
    InApp,
}

impl Channel {
    pub const ALL: [Channel; 4] = [Channel::Email, Channel::Sms, Channel::Push, Channel::InApp];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Email => "EMAIL",
            Channel::Sms => "SMS",
            Channel::Push => "PUSH",
            Channel::InApp => "IN_APP",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "EMAIL" => Ok(Channel::Email),
            "SMS" => Ok(Channel::Sms),
            "PUSH" => Ok(Channel::Push),
            "IN_APP" => Ok(Channel::InApp),
            other => Err(CoreError::Validation(format!("Unknown channel: {other}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// NotificationStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationStatus {
    Pending,
    Sent,
    Delivered,
    Failed,
    Read,
    Expired,
    Cancelled,
    SuppressedByRateLimit,
}

impl NotificationStatus {
    pub const ALL: [NotificationStatus; 8] = [
        NotificationStatus::Pending,
        NotificationStatus::Sent,
        NotificationStatus::Delivered,
        NotificationStatus::Failed,
        NotificationStatus::Read,
        NotificationStatus::Expired,
        NotificationStatus::Cancelled,
        NotificationStatus::SuppressedByRateLimit,
    ];

    /// Statuses that count as a successful send for rate limiting and stats.
    pub const SENT_LIKE: [NotificationStatus; 3] = [
        NotificationStatus::Sent,
        NotificationStatus::Delivered,
        NotificationStatus::Read,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationStatus::Pending => "PENDING",
            NotificationStatus::Sent => "SENT",
            NotificationStatus::Delivered => "DELIVERED",
            NotificationStatus::Failed => "FAILED",
            NotificationStatus::Read => "READ",
            NotificationStatus::Expired => "EXPIRED",
            NotificationStatus::Cancelled => "CANCELLED",
            NotificationStatus::SuppressedByRateLimit => "SUPPRESSED_BY_RATE_LIMIT",
        }
    }

    pub fn is_sent_like(&self) -> bool {
        Self::SENT_LIKE.contains(self)
    }
}

impl fmt::Display for NotificationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NotificationStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NotificationStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| CoreError::Validation(format!("Unknown notification status: {s}")))
    }
}

// ---------------------------------------------------------------------------
// Notification
// ---------------------------------------------------------------------------

/// One per-recipient, per-channel delivery attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: DbId,
    pub tenant_id: TenantId,
    pub alert_id: Option<DbId>,
    pub setting_id: Option<DbId>,
    pub recipient_id: DbId,
    pub notification_type: String,
    pub title: String,
    pub message: String,
    pub channel: Channel,
    pub status: NotificationStatus,
    pub priority_level: i32,
    pub scheduled_at: Option<Timestamp>,
    pub expires_at: Option<Timestamp>,
    pub retry_count: i32,
    pub error_message: Option<String>,
    pub sent_at: Option<Timestamp>,
    pub delivered_at: Option<Timestamp>,
    pub read_at: Option<Timestamp>,
    pub last_attempt_at: Option<Timestamp>,
    /// Dispatch lease; a row with a future lease belongs to one worker.
    pub locked_until: Option<Timestamp>,
    pub metadata: Metadata,
    pub created_at: Timestamp,
}

impl Notification {
    /// Due for a first delivery attempt at `now`.
    pub fn is_due(&self, now: Timestamp) -> bool {
        self.status == NotificationStatus::Pending
            && self.scheduled_at.map_or(true, |at| at <= now)
            && !self.is_expired_at(now)
    }

    pub fn is_expired_at(&self, now: Timestamp) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    pub fn is_leased_at(&self, now: Timestamp) -> bool {
        self.locked_until.is_some_and(|until| until > now)
    }

    /// Exhausted its retry budget while still failing.
    pub fn is_dead_letter(&self, max_retries: i32) -> bool {
        self.status == NotificationStatus::Failed && self.retry_count >= max_retries
    }
}

/// One row to be inserted by the dispatcher; the id is assigned by the store.
#[derive(Debug, Clone, PartialEq)]
pub struct NewNotification {
    pub tenant_id: TenantId,
    pub alert_id: Option<DbId>,
    pub setting_id: Option<DbId>,
    pub recipient_id: DbId,
    pub notification_type: String,
    pub title: String,
    pub message: String,
    pub channel: Channel,
    pub status: NotificationStatus,
    pub priority_level: i32,
    pub scheduled_at: Option<Timestamp>,
    pub expires_at: Option<Timestamp>,
    pub error_message: Option<String>,
    pub metadata: Metadata,
    pub created_at: Timestamp,
}

/// Result of a single channel send, recorded on the notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Sent,
    Failed(String),
}

/// Operator-side filter for listing notifications.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NotificationFilter {
    pub recipient_id: Option<DbId>,
    pub alert_id: Option<DbId>,
    #[serde(default)]
    pub statuses: Vec<NotificationStatus>,
    #[serde(default)]
    pub channels: Vec<Channel>,
    pub created_from: Option<Timestamp>,
    pub created_to: Option<Timestamp>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl NotificationFilter {
    pub fn matches(&self, n: &Notification) -> bool {
        self.recipient_id.map_or(true, |r| n.recipient_id == r)
            && self.alert_id.map_or(true, |a| n.alert_id == Some(a))
            && (self.statuses.is_empty() || self.statuses.contains(&n.status))
            && (self.channels.is_empty() || self.channels.contains(&n.channel))
            && self.created_from.map_or(true, |from| n.created_at >= from)
            && self.created_to.map_or(true, |to| n.created_at <= to)
    }
}

// ---------------------------------------------------------------------------
// Transitions
// ---------------------------------------------------------------------------

pub mod transitions {
    use super::*;

    /// Record a delivery attempt. Success moves to `SENT`; failure moves to
    /// `FAILED` and counts one retry, never past `max_retries`.
    pub fn record_attempt(
        n: &Notification,
        outcome: &DeliveryOutcome,
        max_retries: i32,
        now: Timestamp,
    ) -> Notification {
        let mut next = n.clone();
        next.last_attempt_at = Some(now);
        next.locked_until = None;
        match outcome {
            DeliveryOutcome::Sent => {
                next.status = NotificationStatus::Sent;
                next.sent_at = Some(now);
                next.error_message = None;
            }
            DeliveryOutcome::Failed(message) => {
                next.status = NotificationStatus::Failed;
                next.retry_count = (n.retry_count + 1).min(max_retries);
                next.error_message = Some(message.clone());
            }
        }
        next
    }

    /// Eligible for `retry_failed`: failed, under the retry ceiling, and
    /// last attempted at or after `since`.
    pub fn can_retry(n: &Notification, max_retries: i32, since: Timestamp) -> bool {
        n.status == NotificationStatus::Failed
            && n.retry_count < max_retries
            && n.last_attempt_at.map_or(true, |at| at >= since)
    }

    /// `PENDING -> EXPIRED` when `expires_at` has passed.
    pub fn expire(n: &Notification, now: Timestamp) -> Option<Notification> {
        if n.status != NotificationStatus::Pending || !n.is_expired_at(now) {
            return None;
        }
        let mut next = n.clone();
        next.status = NotificationStatus::Expired;
        next.locked_until = None;
        Some(next)
    }

    /// `{SENT, DELIVERED} -> READ`.
    pub fn mark_read(n: &Notification, now: Timestamp) -> Option<Notification> {
        if !matches!(
            n.status,
            NotificationStatus::Sent | NotificationStatus::Delivered
        ) {
            return None;
        }
        let mut next = n.clone();
        next.status = NotificationStatus::Read;
        next.read_at = Some(now);
        Some(next)
    }

    /// `SENT -> DELIVERED` on a provider receipt.
    pub fn mark_delivered(n: &Notification, now: Timestamp) -> Option<Notification> {
        if n.status != NotificationStatus::Sent {
            return None;
        }
        let mut next = n.clone();
        next.status = NotificationStatus::Delivered;
        next.delivered_at = Some(now);
        Some(next)
    }

    /// `PENDING -> CANCELLED`, only while no worker holds the lease.
    pub fn cancel(n: &Notification, now: Timestamp) -> Option<Notification> {
        if n.status != NotificationStatus::Pending || n.is_leased_at(now) {
            return None;
        }
        let mut next = n.clone();
        next.status = NotificationStatus::Cancelled;
        Some(next)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
