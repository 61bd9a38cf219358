use std::str::FromStr;
use std::time::Duration;

use beacon_core::alert::DEFAULT_MAX_ESCALATION_LEVEL;
use beacon_core::escalation::{EscalationPolicy, DEFAULT_ESCALATION_THRESHOLD_MINUTES};
use beacon_core::notification::DEFAULT_MAX_RETRIES;
use beacon_core::template::DEFAULT_LANGUAGE;

/// Engine configuration loaded from environment variables.
///
/// All fields have defaults suitable for local development.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Minutes an alert may stay `ACTIVE` before escalating.
    pub escalation_threshold_minutes: i64,
    pub escalation_max_level: i32,
    /// Escalation sweep interval.
    pub scheduler_tick: Duration,
    /// Interval of the due-notification dispatch loop.
    pub dispatch_interval: Duration,
    /// Interval of the failed-notification retry loop.
    pub retry_interval: Duration,
    /// Failed notifications older than this are no longer retried.
    pub retry_window_hours: i64,
    pub max_retries: i32,
    /// Concurrent sends allowed per channel.
    pub channel_concurrency: usize,
    /// Deadline for a single channel send.
    pub send_timeout: Duration,
    /// Rows claimed per dispatch pass.
    pub dispatch_batch_size: i64,
    /// How long a claimed row stays leased to one worker.
    pub dispatch_lease: Duration,
    /// Interval of the stale-notification expiry loop.
    pub expire_interval: Duration,
    pub default_language: String,
    pub sms_gateway_url: Option<String>,
    pub push_gateway_url: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            escalation_threshold_minutes: DEFAULT_ESCALATION_THRESHOLD_MINUTES,
            escalation_max_level: DEFAULT_MAX_ESCALATION_LEVEL,
            scheduler_tick: Duration::from_secs(60),
            dispatch_interval: Duration::from_secs(60),
            retry_interval: Duration::from_secs(300),
            retry_window_hours: 24,
            max_retries: DEFAULT_MAX_RETRIES,
            channel_concurrency: 8,
            send_timeout: Duration::from_secs(10),
            dispatch_batch_size: 200,
            dispatch_lease: Duration::from_secs(120),
            expire_interval: Duration::from_secs(3600),
            default_language: DEFAULT_LANGUAGE.to_string(),
            sms_gateway_url: None,
            push_gateway_url: None,
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// Unparseable values fall back to the default with a warning.
    ///
    /// | Env Var                        | Default |
    /// |--------------------------------|---------|
    /// | `ESCALATION_THRESHOLD_MINUTES` | `60`    |
    /// | `ESCALATION_MAX_LEVEL`         | `3`     |
    /// | `SCHEDULER_TICK_SECS`          | `60`    |
    /// | `DISPATCH_INTERVAL_SECS`       | `60`    |
    /// | `RETRY_INTERVAL_SECS`          | `300`   |
    /// | `RETRY_WINDOW_HOURS`           | `24`    |
    /// | `MAX_RETRIES`                  | `3`     |
    /// | `CHANNEL_CONCURRENCY`          | `8`     |
    /// | `SEND_TIMEOUT_SECS`            | `10`    |
    /// | `DISPATCH_BATCH_SIZE`          | `200`   |
    /// | `DISPATCH_LEASE_SECS`          | `120`   |
    /// | `EXPIRE_INTERVAL_SECS`         | `3600`  |
    /// | `DEFAULT_LANGUAGE`             | `en`    |
    /// | `SMS_GATEWAY_URL`              | unset   |
    /// | `PUSH_GATEWAY_URL`             | unset   |
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            escalation_threshold_minutes: env_or(
                "ESCALATION_THRESHOLD_MINUTES",
                defaults.escalation_threshold_minutes,
            ),
            escalation_max_level: env_or("ESCALATION_MAX_LEVEL", defaults.escalation_max_level),
            scheduler_tick: env_secs("SCHEDULER_TICK_SECS", defaults.scheduler_tick),
            dispatch_interval: env_secs("DISPATCH_INTERVAL_SECS", defaults.dispatch_interval),
            retry_interval: env_secs("RETRY_INTERVAL_SECS", defaults.retry_interval),
            retry_window_hours: env_or("RETRY_WINDOW_HOURS", defaults.retry_window_hours),
            max_retries: env_or("MAX_RETRIES", defaults.max_retries),
            channel_concurrency: env_or("CHANNEL_CONCURRENCY", defaults.channel_concurrency)
                .max(1),
            send_timeout: env_secs("SEND_TIMEOUT_SECS", defaults.send_timeout),
            dispatch_batch_size: env_or("DISPATCH_BATCH_SIZE", defaults.dispatch_batch_size),
            dispatch_lease: env_secs("DISPATCH_LEASE_SECS", defaults.dispatch_lease),
            expire_interval: env_secs("EXPIRE_INTERVAL_SECS", defaults.expire_interval),
            default_language: std::env::var("DEFAULT_LANGUAGE")
                .unwrap_or(defaults.default_language),
            sms_gateway_url: std::env::var("SMS_GATEWAY_URL").ok(),
            push_gateway_url: std::env::var("PUSH_GATEWAY_URL").ok(),
        }
    }

    pub fn escalation_policy(&self) -> EscalationPolicy {
        EscalationPolicy::new(self.escalation_threshold_minutes, self.escalation_max_level)
    }

    pub fn lease(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.dispatch_lease).unwrap_or(chrono::Duration::minutes(2))
    }

    /// Lease held while a send is in progress: the claim lease plus the send
    /// deadline, so a live send always outlasts its own timeout.
    pub fn in_flight_lease(&self) -> chrono::Duration {
        self.lease()
            + chrono::Duration::from_std(self.send_timeout).unwrap_or(chrono::Duration::minutes(1))
    }
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(var = name, value = %raw, "Invalid value, using default");
            default
        }),
        Err(_) => default,
    }
}

fn env_secs(name: &str, default: Duration) -> Duration {
    Duration::from_secs(env_or(name, default.as_secs()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = EngineConfig::default();
        assert_eq!(config.escalation_threshold_minutes, 60);
        assert_eq!(config.escalation_max_level, 3);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.retry_interval, Duration::from_secs(300));
        assert_eq!(config.default_language, "en");
        assert_eq!(config.lease(), chrono::Duration::seconds(120));
    }

    #[test]
    fn invalid_env_value_falls_back_to_default() {
        std::env::set_var("BEACON_TEST_BAD_NUMBER", "not-a-number");
        assert_eq!(env_or("BEACON_TEST_BAD_NUMBER", 7_i64), 7);
        std::env::set_var("BEACON_TEST_GOOD_NUMBER", " 42 ");
        assert_eq!(env_or("BEACON_TEST_GOOD_NUMBER", 7_i64), 42);
    }

    #[test]
    fn policy_uses_configured_threshold() {
        let config = EngineConfig {
            escalation_threshold_minutes: 15,
            ..Default::default()
        };
        assert_eq!(config.escalation_policy().threshold_minutes, 15);
    }
}
