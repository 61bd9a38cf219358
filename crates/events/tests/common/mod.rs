#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use beacon_core::alert::{RaiseAlert, Severity, SourceKey};
use beacon_core::notification::{Channel, Notification, NotificationFilter};
use beacon_core::types::{DbId, TenantId, Timestamp};
use beacon_events::{
    ChannelSender, DeliveryError, Engine, EngineConfig, EventBus, SenderRegistry, Stores,
};
use chrono::{TimeZone, Utc};

pub const TENANT: TenantId = 1;

/// Fixed start time so every test reads in absolute minutes.
pub fn t0() -> Timestamp {
    Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).unwrap()
}

pub fn minutes(n: i64) -> Timestamp {
    t0() + chrono::Duration::minutes(n)
}

/// What a [`ScriptedSender`] does with each notification.
pub enum Script {
    Succeed,
    Fail,
    /// Fail only for these recipients.
    FailFor(Vec<DbId>),
}

/// Channel sender that follows a fixed script and records what it was asked
/// to send.
pub struct ScriptedSender {
    channel: Channel,
    script: Script,
    sent: Mutex<Vec<DbId>>,
    calls: AtomicUsize,
    /// Time each send takes before it answers.
    delay: Option<Duration>,
}

impl ScriptedSender {
    pub fn new(channel: Channel, script: Script) -> Arc<Self> {
        Arc::new(Self {
            channel,
            script,
            sent: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
            delay: None,
        })
    }

    /// Succeeds, but only after `delay`.
    pub fn slow(channel: Channel, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            channel,
            script: Script::Succeed,
            sent: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
            delay: Some(delay),
        })
    }

    pub fn ok(channel: Channel) -> Arc<Self> {
        Self::new(channel, Script::Succeed)
    }

    pub fn failing(channel: Channel) -> Arc<Self> {
        Self::new(channel, Script::Fail)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Ids of notifications that were accepted.
    pub fn sent(&self) -> Vec<DbId> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChannelSender for ScriptedSender {
    fn channel(&self) -> Channel {
        self.channel
    }

    async fn send(&self, n: &Notification) -> Result<(), DeliveryError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let fail = match &self.script {
            Script::Succeed => false,
            Script::Fail => true,
            Script::FailFor(recipients) => recipients.contains(&n.recipient_id),
        };
        if fail {
            return Err(DeliveryError::Rejected("gateway said no".into()));
        }
        self.sent.lock().unwrap().push(n.id);
        Ok(())
    }
}

/// Engine over in-memory stores with the given scripted senders installed.
pub fn engine(senders: &[Arc<ScriptedSender>]) -> Engine {
    engine_with(EngineConfig::default(), senders)
}

pub fn engine_with(config: EngineConfig, senders: &[Arc<ScriptedSender>]) -> Engine {
    let registry = senders.iter().fold(
        SenderRegistry::new(config.channel_concurrency, config.send_timeout),
        |registry, sender| registry.register(sender.clone()),
    );
    Engine::new(Stores::memory(), registry, Arc::new(EventBus::default()), config)
}

pub fn budget_alert() -> RaiseAlert {
    RaiseAlert::new(
        SourceKey::new("budget", "budget-42", "BUDGET_THRESHOLD"),
        Severity::High,
    )
    .with_values(80.0, 85.0)
    .with_text("Budget threshold crossed", "Spend reached 85% of budget")
}

pub async fn notifications_for_alert(engine: &Engine, alert_id: DbId) -> Vec<Notification> {
    let filter = NotificationFilter {
        alert_id: Some(alert_id),
        ..Default::default()
    };
    engine.notifications.list(TENANT, &filter).await.unwrap()
}

pub async fn all_notifications(engine: &Engine) -> Vec<Notification> {
    engine
        .notifications
        .list(TENANT, &NotificationFilter::default())
        .await
        .unwrap()
}
