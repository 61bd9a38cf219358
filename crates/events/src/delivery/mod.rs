//! Channel senders and the registry the dispatcher sends through.
//!
//! Every channel implements [`ChannelSender`]. The [`SenderRegistry`] holds
//! one sender per channel together with a semaphore that bounds concurrent
//! sends on that channel, and wraps every send in a deadline. Channels with
//! no configured transport get a [`NotConfiguredSender`] so their rows fail
//! with a recorded error instead of staying queued forever.

pub mod contacts;
pub mod email;
pub mod gateway;
pub mod in_app;
pub mod push;
pub mod sms;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use beacon_core::notification::{Channel, DeliveryOutcome, Notification};
use beacon_core::types::DbId;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use self::email::EmailError;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

/// Why a single send failed. The `Display` text is stored as the
/// notification's `error_message`.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("No sender configured for channel {0}")]
    NotConfigured(Channel),

    #[error("No {channel} address on file for recipient {recipient_id}")]
    NoAddress { recipient_id: DbId, channel: Channel },

    #[error("Send timed out after {0:?}")]
    Timeout(Duration),

    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Gateway returned HTTP {0}")]
    HttpStatus(u16),

    #[error(transparent)]
    Email(#[from] EmailError),

    #[error("Contact lookup failed: {0}")]
    Lookup(String),

    #[error("Rejected by provider: {0}")]
    Rejected(String),
}

// ---------------------------------------------------------------------------
// ChannelSender
// ---------------------------------------------------------------------------

#[async_trait]
pub trait ChannelSender: Send + Sync {
    fn channel(&self) -> Channel;

    /// One delivery attempt. Retrying is the dispatcher's job.
    async fn send(&self, notification: &Notification) -> Result<(), DeliveryError>;
}

/// Stand-in for a channel with no transport configured.
pub struct NotConfiguredSender(pub Channel);

#[async_trait]
impl ChannelSender for NotConfiguredSender {
    fn channel(&self) -> Channel {
        self.0
    }

    async fn send(&self, _notification: &Notification) -> Result<(), DeliveryError> {
        Err(DeliveryError::NotConfigured(self.0))
    }
}

// ---------------------------------------------------------------------------
// SenderRegistry
// ---------------------------------------------------------------------------

struct Lane {
    sender: Arc<dyn ChannelSender>,
    permits: Arc<Semaphore>,
}

pub struct SenderRegistry {
    lanes: HashMap<Channel, Lane>,
    concurrency: usize,
    send_timeout: Duration,
}

impl SenderRegistry {
    /// Registry with in-app delivery enabled and every other channel
    /// unconfigured until [`register`](Self::register) replaces it.
    pub fn new(concurrency: usize, send_timeout: Duration) -> Self {
        let registry = Self {
            lanes: HashMap::new(),
            concurrency: concurrency.max(1),
            send_timeout,
        };
        Channel::ALL.into_iter().fold(registry, |registry, channel| {
            let sender: Arc<dyn ChannelSender> = match channel {
                Channel::InApp => Arc::new(in_app::InAppSender),
                other => Arc::new(NotConfiguredSender(other)),
            };
            registry.register(sender)
        })
    }

    /// Install `sender` for its channel, replacing any previous one.
    pub fn register(mut self, sender: Arc<dyn ChannelSender>) -> Self {
        let lane = Lane {
            sender: sender.clone(),
            permits: Arc::new(Semaphore::new(self.concurrency)),
        };
        self.lanes.insert(sender.channel(), lane);
        self
    }

    /// Send through the notification's channel and report the outcome.
    ///
    /// Waits for a permit on that channel only, so a saturated channel does
    /// not hold up the others.
    pub async fn deliver(&self, notification: &Notification) -> DeliveryOutcome {
        self.reserve(notification.channel).await.deliver(notification).await
    }

    /// Wait for a send permit on `channel`. The permit is held by the
    /// returned slot until it is used or dropped.
    pub async fn reserve(&self, channel: Channel) -> SendSlot {
        let lane = match self.lanes.get(&channel) {
            Some(lane) => lane
                .permits
                .clone()
                .acquire_owned()
                .await
                .map(|permit| (lane.sender.clone(), permit))
                .map_err(|_| DeliveryError::NotConfigured(channel)),
            None => Err(DeliveryError::NotConfigured(channel)),
        };
        SendSlot {
            lane,
            send_timeout: self.send_timeout,
        }
    }
}

/// A reserved place on one channel's lane.
pub struct SendSlot {
    lane: Result<(Arc<dyn ChannelSender>, OwnedSemaphorePermit), DeliveryError>,
    send_timeout: Duration,
}

impl SendSlot {
    /// One send under the registry's deadline. Releases the permit.
    pub async fn deliver(self, notification: &Notification) -> DeliveryOutcome {
        let result = match self.lane {
            Ok((sender, _permit)) => {
                match tokio::time::timeout(self.send_timeout, sender.send(notification)).await {
                    Ok(sent) => sent,
                    Err(_) => Err(DeliveryError::Timeout(self.send_timeout)),
                }
            }
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => {
                tracing::debug!(
                    notification_id = notification.id,
                    channel = %notification.channel,
                    "Notification sent"
                );
                DeliveryOutcome::Sent
            }
            Err(e) => {
                tracing::warn!(
                    notification_id = notification.id,
                    channel = %notification.channel,
                    error = %e,
                    "Notification send failed"
                );
                DeliveryOutcome::Failed(e.to_string())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
