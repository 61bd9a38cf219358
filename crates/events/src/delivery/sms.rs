//! SMS delivery through an HTTP gateway.

use std::sync::Arc;

use async_trait::async_trait;
use beacon_core::notification::{Channel, Notification};

use super::contacts::{require_address, ContactDirectory};
use super::gateway::GatewayClient;
use super::{ChannelSender, DeliveryError};

/// Longest body sent in a single message; longer text is cut.
const MAX_SMS_CHARS: usize = 480;

pub struct SmsSender {
    gateway: GatewayClient,
    contacts: Arc<dyn ContactDirectory>,
}

impl SmsSender {
    pub fn new(gateway: GatewayClient, contacts: Arc<dyn ContactDirectory>) -> Self {
        Self { gateway, contacts }
    }
}

fn payload(to: &str, n: &Notification) -> serde_json::Value {
    let text = format!("{}: {}", n.title, n.message);
    let body: String = text.chars().take(MAX_SMS_CHARS).collect();
    serde_json::json!({
        "to": to,
        "body": body,
        "reference": n.id,
    })
}

#[async_trait]
impl ChannelSender for SmsSender {
    fn channel(&self) -> Channel {
        Channel::Sms
    }

    async fn send(&self, n: &Notification) -> Result<(), DeliveryError> {
        let to = require_address(self.contacts.as_ref(), n.tenant_id, n.recipient_id, Channel::Sms)
            .await?;
        self.gateway.post(&payload(&to, n)).await
    }
}
