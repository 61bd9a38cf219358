//! Push delivery through an HTTP gateway. The contact address is the
//! recipient's device token.

use std::sync::Arc;

use async_trait::async_trait;
use beacon_core::notification::{Channel, Notification, PRIORITY_URGENT};

use super::contacts::{require_address, ContactDirectory};
use super::gateway::GatewayClient;
use super::{ChannelSender, DeliveryError};

pub struct PushSender {
    gateway: GatewayClient,
    contacts: Arc<dyn ContactDirectory>,
}

impl PushSender {
    pub fn new(gateway: GatewayClient, contacts: Arc<dyn ContactDirectory>) -> Self {
        Self { gateway, contacts }
    }
}

fn payload(token: &str, n: &Notification) -> serde_json::Value {
    serde_json::json!({
        "token": token,
        "title": n.title,
        "body": n.message,
        "priority": if n.priority_level <= PRIORITY_URGENT { "high" } else { "normal" },
        "data": {
            "notification_id": n.id,
            "alert_id": n.alert_id,
            "type": n.notification_type,
        },
    })
}

#[async_trait]
impl ChannelSender for PushSender {
    fn channel(&self) -> Channel {
        Channel::Push
    }

    async fn send(&self, n: &Notification) -> Result<(), DeliveryError> {
        let token =
            require_address(self.contacts.as_ref(), n.tenant_id, n.recipient_id, Channel::Push)
                .await?;
        self.gateway.post(&payload(&token, n)).await
    }
}
