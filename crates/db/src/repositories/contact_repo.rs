//! Repository for the `recipient_contacts` table.

use beacon_core::notification::Channel;
use beacon_core::types::DbId;
use sqlx::PgPool;

/// Looks up and records per-channel delivery addresses.
pub struct ContactRepo;

impl ContactRepo {
    /// Address for a recipient on a channel, if one is on file.
    pub async fn find_address(
        pool: &PgPool,
        tenant_id: DbId,
        recipient_id: DbId,
        channel: Channel,
    ) -> Result<Option<String>, sqlx::Error> {
        sqlx::query_scalar(
            "SELECT address FROM recipient_contacts \
             WHERE tenant_id = $1 AND recipient_id = $2 AND channel = $3",
        )
        .bind(tenant_id)
        .bind(recipient_id)
        .bind(channel.as_str())
        .fetch_optional(pool)
        .await
    }

    /// Insert or replace the address for `(recipient, channel)`.
    pub async fn upsert(
        pool: &PgPool,
        tenant_id: DbId,
        recipient_id: DbId,
        channel: Channel,
        address: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO recipient_contacts (tenant_id, recipient_id, channel, address) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (tenant_id, recipient_id, channel) \
             DO UPDATE SET address = EXCLUDED.address, updated_at = NOW()",
        )
        .bind(tenant_id)
        .bind(recipient_id)
        .bind(channel.as_str())
        .bind(address)
        .execute(pool)
        .await?;
        Ok(())
    }
}
