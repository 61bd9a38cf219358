//! Recipient address lookup for channels that need one (email, SMS, push).

use std::collections::HashMap;

use async_trait::async_trait;
use beacon_core::notification::Channel;
use beacon_core::types::{DbId, TenantId};
use beacon_db::repositories::ContactRepo;
use beacon_db::DbPool;

use super::DeliveryError;

#[async_trait]
pub trait ContactDirectory: Send + Sync {
    /// Address for `recipient_id` on `channel`, if one is known.
    async fn address(
        &self,
        tenant_id: TenantId,
        recipient_id: DbId,
        channel: Channel,
    ) -> Result<Option<String>, DeliveryError>;
}

/// Resolve an address or fail the send with [`DeliveryError::NoAddress`].
pub async fn require_address(
    contacts: &dyn ContactDirectory,
    tenant_id: TenantId,
    recipient_id: DbId,
    channel: Channel,
) -> Result<String, DeliveryError> {
    contacts
        .address(tenant_id, recipient_id, channel)
        .await?
        .ok_or(DeliveryError::NoAddress {
            recipient_id,
            channel,
        })
}

/// Addresses backed by the `recipient_contacts` table.
pub struct PgContacts {
    pool: DbPool,
}

impl PgContacts {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ContactDirectory for PgContacts {
    async fn address(
        &self,
        tenant_id: TenantId,
        recipient_id: DbId,
        channel: Channel,
    ) -> Result<Option<String>, DeliveryError> {
        ContactRepo::find_address(&self.pool, tenant_id, recipient_id, channel)
            .await
            .map_err(|e| DeliveryError::Lookup(e.to_string()))
    }
}

/// Fixed address book, keyed by recipient and channel. Ignores the tenant.
#[derive(Debug, Clone, Default)]
pub struct StaticContacts {
    entries: HashMap<(DbId, Channel), String>,
}

impl StaticContacts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, recipient_id: DbId, channel: Channel, address: impl Into<String>) -> Self {
        self.entries.insert((recipient_id, channel), address.into());
        self
    }
}

#[async_trait]
impl ContactDirectory for StaticContacts {
    async fn address(
        &self,
        _tenant_id: TenantId,
        recipient_id: DbId,
        channel: Channel,
    ) -> Result<Option<String>, DeliveryError> {
        Ok(self.entries.get(&(recipient_id, channel)).cloned())
    }
}
