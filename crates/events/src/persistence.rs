//! Durable audit persistence.
//!
//! [`AuditPersistence`] subscribes to the [`EventBus`](crate::bus::EventBus)
//! and writes every [`EngineEvent`] to the `alert_events` table. It runs as a
//! long-lived background task and stops when the bus is dropped.

use beacon_core::types::DbId;
use beacon_db::models::audit::CreateAuditEvent;
use beacon_db::repositories::AuditEventRepo;
use beacon_db::DbPool;
use tokio::sync::broadcast;

use crate::bus::EngineEvent;

pub struct AuditPersistence;

impl AuditPersistence {
    /// Run the persistence loop until the channel closes.
    pub async fn run(pool: DbPool, mut receiver: broadcast::Receiver<EngineEvent>) {
        loop {
            match receiver.recv().await {
                Ok(event) => {
                    if let Err(e) = Self::persist(&pool, &event).await {
                        tracing::error!(
                            error = %e,
                            event_type = %event.event_type,
                            "Failed to persist audit event"
                        );
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(
                        skipped = n,
                        "Audit persistence lagged, some events were not persisted"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => {
                    tracing::info!("Event bus closed, audit persistence shutting down");
                    break;
                }
            }
        }
    }

    async fn persist(pool: &DbPool, event: &EngineEvent) -> Result<DbId, sqlx::Error> {
        AuditEventRepo::insert(pool, &to_row(event)).await
    }
}

fn to_row(event: &EngineEvent) -> CreateAuditEvent {
    CreateAuditEvent {
        tenant_id: event.tenant_id,
        event_type: event.event_type.clone(),
        entity_type: event.entity_type.clone(),
        entity_id: event.entity_id,
        actor_id: event.actor_id,
        payload: event.payload.clone(),
        occurred_at: event.timestamp,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::ALERT_ACKNOWLEDGED;

    #[test]
    fn event_maps_onto_audit_row() {
        let event = EngineEvent::new(ALERT_ACKNOWLEDGED)
            .for_tenant(2)
            .with_entity("alert", 9)
            .with_actor(Some(5));
        let row = to_row(&event);
        assert_eq!(row.event_type, "alert.acknowledged");
        assert_eq!(row.tenant_id, Some(2));
        assert_eq!(row.entity_type.as_deref(), Some("alert"));
        assert_eq!(row.actor_id, Some(5));
        assert_eq!(row.occurred_at, event.timestamp);
    }
}
