//! Per-recipient send-rate ceilings.
//!
//! The dispatcher counts what was already sent for a `(setting, recipient)`
//! pair in the trailing hour and day, then asks [`check`] whether another
//! send is allowed.

use chrono::Duration;
use serde::Serialize;

use crate::settings::NotificationSetting;
use crate::types::Timestamp;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RateWindow {
    Hourly,
    Daily,
}

impl RateWindow {
    pub fn duration(&self) -> Duration {
        match self {
            RateWindow::Hourly => Duration::hours(1),
            RateWindow::Daily => Duration::days(1),
        }
    }

    /// Start of the trailing window ending at `now`.
    pub fn start(&self, now: Timestamp) -> Timestamp {
        now - self.duration()
    }
}

/// Ceilings taken from a [`NotificationSetting`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RateCeiling {
    pub hourly: Option<i32>,
    pub daily: Option<i32>,
}

impl RateCeiling {
    pub fn is_unlimited(&self) -> bool {
        self.hourly.is_none() && self.daily.is_none()
    }
}

impl From<&NotificationSetting> for RateCeiling {
    fn from(setting: &NotificationSetting) -> Self {
        Self {
            hourly: setting.hourly_limit,
            daily: setting.daily_limit,
        }
    }
}

/// Sends already counted against a recipient.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendCounts {
    pub last_hour: i64,
    pub last_day: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allow,
    Exceeded {
        window: RateWindow,
        limit: i32,
        count: i64,
    },
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateDecision::Allow)
    }

    /// Explanation stored on a rate-limited notification.
    pub fn reason(&self) -> Option<String> {
        match self {
            RateDecision::Allow => None,
            RateDecision::Exceeded {
                window,
                limit,
                count,
            } => Some(format!(
                "Rate limit exceeded: {count} sent in the {} window (limit {limit})",
                match window {
                    RateWindow::Hourly => "hourly",
                    RateWindow::Daily => "daily",
                }
            )),
        }
    }
}

/// At or above either ceiling the send is refused. The hourly ceiling is
/// checked first.
pub fn check(ceiling: RateCeiling, counts: SendCounts) -> RateDecision {
    if let Some(limit) = ceiling.hourly {
        if counts.last_hour >= i64::from(limit) {
            return RateDecision::Exceeded {
                window: RateWindow::Hourly,
                limit,
                count: counts.last_hour,
            };
        }
    }
    if let Some(limit) = ceiling.daily {
        if counts.last_day >= i64::from(limit) {
            return RateDecision::Exceeded {
                window: RateWindow::Daily,
                limit,
                count: counts.last_day,
            };
        }
    }
    RateDecision::Allow
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unlimited_always_allows() {
        let decision = check(
            RateCeiling::default(),
            SendCounts {
                last_hour: 1_000,
                last_day: 10_000,
            },
        );
        assert!(decision.is_allowed());
    }

    #[test]
    fn at_hourly_ceiling_is_refused() {
        let ceiling = RateCeiling {
            hourly: Some(2),
            daily: Some(10),
        };
        assert!(check(ceiling, SendCounts { last_hour: 1, last_day: 1 }).is_allowed());
        assert_eq!(
            check(ceiling, SendCounts { last_hour: 2, last_day: 2 }),
            RateDecision::Exceeded {
                window: RateWindow::Hourly,
                limit: 2,
                count: 2
            }
        );
    }

    #[test]
    fn daily_ceiling_applies_when_hour_is_quiet() {
        let ceiling = RateCeiling {
            hourly: Some(5),
            daily: Some(3),
        };
        let decision = check(ceiling, SendCounts { last_hour: 0, last_day: 3 });
        assert_eq!(
            decision.reason().as_deref(),
            Some("Rate limit exceeded: 3 sent in the daily window (limit 3)")
        );
    }
}
