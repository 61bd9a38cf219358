//! Escalation policy: how long an alert may stay active before it escalates,
//! and which channels/audience each escalation level reaches.

use serde::{Deserialize, Serialize};

use crate::alert::DEFAULT_MAX_ESCALATION_LEVEL;
use crate::notification::Channel;
use crate::settings::{self, NotificationSetting};
use crate::types::DbId;

/// Default minutes an alert may stay `ACTIVE` before escalating.
pub const DEFAULT_ESCALATION_THRESHOLD_MINUTES: i64 = 60;

/// Channels used at one escalation level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationTier {
    pub level: i32,
    pub channels: Vec<Channel>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationPolicy {
    pub threshold_minutes: i64,
    pub max_level: i32,
    pub tiers: Vec<EscalationTier>,
}

impl Default for EscalationPolicy {
    /// Level 1: SMS + push. Level 2: SMS + email + push. Level 3: SMS + email.
    fn default() -> Self {
        Self {
            threshold_minutes: DEFAULT_ESCALATION_THRESHOLD_MINUTES,
            max_level: DEFAULT_MAX_ESCALATION_LEVEL,
            tiers: vec![
                EscalationTier {
                    level: 1,
                    channels: vec![Channel::Sms, Channel::Push],
                },
                EscalationTier {
                    level: 2,
                    channels: vec![Channel::Sms, Channel::Email, Channel::Push],
                },
                EscalationTier {
                    level: 3,
                    channels: vec![Channel::Sms, Channel::Email],
                },
            ],
        }
    }
}

impl EscalationPolicy {
    pub fn new(threshold_minutes: i64, max_level: i32) -> Self {
        Self {
            threshold_minutes,
            max_level,
            ..Default::default()
        }
    }

    /// Channels for `level`: the tier with the highest level not above it.
    pub fn channels_for(&self, level: i32) -> &[Channel] {
        self.tiers
            .iter()
            .filter(|tier| tier.level <= level)
            .max_by_key(|tier| tier.level)
            .map(|tier| tier.channels.as_slice())
            .unwrap_or(&[])
    }

    /// Recipients for `level`: every setting whose `priority_level` is at or
    /// below the level contributes its recipients, so the audience widens as
    /// the alert climbs.
    pub fn recipients_for<'a>(
        &self,
        level: i32,
        candidates: impl IntoIterator<Item = &'a NotificationSetting>,
    ) -> Vec<DbId> {
        settings::union_recipients(
            candidates
                .into_iter()
                .filter(|setting| setting.priority_level <= level),
        )
    }

    pub fn title_for(&self, level: i32, title: &str) -> String {
        format!("[Escalation {level}] {title}")
    }

    pub fn message_for(&self, level: i32, message: &str) -> String {
        format!("{message}\n\nThis notification is escalation level {level}.")
    }
}
