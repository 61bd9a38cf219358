//! In-process audit bus backed by a `tokio::sync::broadcast` channel.
//!
//! Every persisted alert or notification transition is published here as an
//! [`EngineEvent`]. The bus is shared via `Arc<EventBus>`; the
//! [`AuditPersistence`](crate::persistence::AuditPersistence) subscriber
//! writes events to the audit table.

use beacon_core::types::{DbId, TenantId, Timestamp};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

// ---------------------------------------------------------------------------
// Event names
// ---------------------------------------------------------------------------

pub const ALERT_RAISED: &str = "alert.raised";
pub const ALERT_RECURRED: &str = "alert.recurred";
pub const ALERT_REOPENED: &str = "alert.reopened";
pub const ALERT_ACKNOWLEDGED: &str = "alert.acknowledged";
pub const ALERT_RESOLVED: &str = "alert.resolved";
pub const ALERT_AUTO_RESOLVED: &str = "alert.auto_resolved";
pub const ALERT_SUPPRESSED: &str = "alert.suppressed";
pub const ALERT_RESTORED: &str = "alert.restored";
pub const ALERT_ESCALATED: &str = "alert.escalated";
pub const ALERT_EXPIRED: &str = "alert.expired";
pub const ALERT_NOTIFIED: &str = "alert.notified";
pub const ALERT_NOTIFY_RELEASED: &str = "alert.notify_released";

pub const NOTIFICATION_ENQUEUED: &str = "notification.enqueued";
pub const NOTIFICATION_RATE_LIMITED: &str = "notification.rate_limited";
pub const NOTIFICATION_SENT: &str = "notification.sent";
pub const NOTIFICATION_FAILED: &str = "notification.failed";
pub const NOTIFICATION_EXPIRED: &str = "notification.expired";
pub const NOTIFICATION_READ: &str = "notification.read";
pub const NOTIFICATION_DELIVERED: &str = "notification.delivered";
pub const NOTIFICATION_CANCELLED: &str = "notification.cancelled";
pub const NOTIFICATION_DEAD_LETTERS_CLEARED: &str = "notification.dead_letters_cleared";

// ---------------------------------------------------------------------------
// EngineEvent
// ---------------------------------------------------------------------------

/// Something the engine did, as recorded in the audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineEvent {
    /// Dot-separated event name, e.g. `"alert.escalated"`.
    pub event_type: String,
    pub tenant_id: Option<TenantId>,
    /// Entity kind (`"alert"`, `"notification"`).
    pub entity_type: Option<String>,
    pub entity_id: Option<DbId>,
    /// Operator that caused the event; `None` for the engine itself.
    pub actor_id: Option<DbId>,
    pub payload: serde_json::Value,
    pub timestamp: Timestamp,
}

impl EngineEvent {
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            tenant_id: None,
            entity_type: None,
            entity_id: None,
            actor_id: None,
            payload: serde_json::Value::Object(Default::default()),
            timestamp: Utc::now(),
        }
    }

    pub fn for_tenant(mut self, tenant_id: TenantId) -> Self {
        self.tenant_id = Some(tenant_id);
        self
    }

    pub fn with_entity(mut self, entity_type: impl Into<String>, entity_id: DbId) -> Self {
        self.entity_type = Some(entity_type.into());
        self.entity_id = Some(entity_id);
        self
    }

    pub fn with_actor(mut self, actor_id: Option<DbId>) -> Self {
        self.actor_id = actor_id;
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    /// Stamp the event with the engine's notion of `now`.
    pub fn at(mut self, timestamp: Timestamp) -> Self {
        self.timestamp = timestamp;
        self
    }
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Default buffer capacity for the broadcast channel.
const DEFAULT_CAPACITY: usize = 1024;

/// In-process fan-out bus.
///
/// When the buffer is full the oldest un-consumed events are dropped and slow
/// receivers observe `RecvError::Lagged`.
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish to all current subscribers. Dropped silently if there are none.
    pub fn publish(&self, event: EngineEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        bus.publish(
            EngineEvent::new(ALERT_ESCALATED)
                .for_tenant(3)
                .with_entity("alert", 42)
                .with_payload(serde_json::json!({"level": 1})),
        );

        let received = rx.recv().await.unwrap();
        assert_eq!(received.event_type, ALERT_ESCALATED);
        assert_eq!(received.tenant_id, Some(3));
        assert_eq!(received.entity_id, Some(42));
        assert_eq!(received.payload["level"], 1);
    }

    #[tokio::test]
    async fn every_subscriber_sees_every_event() {
        let bus = EventBus::default();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.publish(EngineEvent::new(NOTIFICATION_SENT));

        assert_eq!(a.recv().await.unwrap().event_type, NOTIFICATION_SENT);
        assert_eq!(b.recv().await.unwrap().event_type, NOTIFICATION_SENT);
    }

    #[test]
    fn publish_without_subscribers_does_not_panic() {
        EventBus::default().publish(EngineEvent::new(ALERT_RAISED));
    }

    #[tokio::test]
    async fn slow_receiver_observes_lag() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe();
        for _ in 0..4 {
            bus.publish(EngineEvent::new(ALERT_RECURRED));
        }
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(2))
        ));
    }
}
