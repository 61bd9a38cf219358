use async_trait::async_trait;
use beacon_core::notification::{Channel, Notification};

use super::{ChannelSender, DeliveryError};

/// In-app delivery. The stored notification row is the inbox entry, so
/// there is nothing to transmit.
pub struct InAppSender;

#[async_trait]
impl ChannelSender for InAppSender {
    fn channel(&self) -> Channel {
        Channel::InApp
    }

    async fn send(&self, _notification: &Notification) -> Result<(), DeliveryError> {
        Ok(())
    }
}
