//! Repository for the `notification_templates` table.

use beacon_core::notification::Channel;
use beacon_core::template::{self, CreateTemplate};
use beacon_core::types::DbId;
use sqlx::PgPool;

use crate::models::template::TemplateRow;

/// Column list for `notification_templates` queries.
const COLUMNS: &str = "\
    id, tenant_id, name, template_type, channel, language_code, \
    subject_template, body_template, variables, is_active, is_default, \
    created_at, updated_at";

/// Provides CRUD operations for notification templates.
pub struct TemplateRepo;

impl TemplateRepo {
    /// Create a template. Declared variables are extracted from the subject
    /// and body. A new default replaces the previous one in the same
    /// transaction.
    pub async fn create(
        pool: &PgPool,
        tenant_id: DbId,
        dto: &CreateTemplate,
    ) -> Result<TemplateRow, sqlx::Error> {
        let mut variables = template::placeholders(&dto.body_template);
        if let Some(subject) = &dto.subject_template {
            variables.extend(template::placeholders(subject));
            variables.sort();
            variables.dedup();
        }

        let mut tx = pool.begin().await?;
        if dto.is_default {
            sqlx::query(
                "UPDATE notification_templates SET is_default = FALSE, updated_at = NOW() \
                 WHERE tenant_id = $1 AND template_type = $2 AND channel = $3 AND is_default",
            )
            .bind(tenant_id)
            .bind(&dto.template_type)
            .bind(dto.channel.as_str())
            .execute(&mut *tx)
            .await?;
        }
        let query = format!(
            "INSERT INTO notification_templates \
                 (tenant_id, name, template_type, channel, language_code, \
                  subject_template, body_template, variables, is_default) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
             RETURNING {COLUMNS}"
        );
        let row = sqlx::query_as::<_, TemplateRow>(&query)
            .bind(tenant_id)
            .bind(&dto.name)
            .bind(&dto.template_type)
            .bind(dto.channel.as_str())
            .bind(&dto.language_code)
            .bind(&dto.subject_template)
            .bind(&dto.body_template)
            .bind(&variables)
            .bind(dto.is_default)
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(row)
    }

    pub async fn find_by_id(
        pool: &PgPool,
        tenant_id: DbId,
        id: DbId,
    ) -> Result<Option<TemplateRow>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM notification_templates WHERE id = $1 AND tenant_id = $2"
        );
        sqlx::query_as::<_, TemplateRow>(&query)
            .bind(id)
            .bind(tenant_id)
            .fetch_optional(pool)
            .await
    }

    /// Active templates for `(template_type, channel)` in every language.
    pub async fn list_for(
        pool: &PgPool,
        tenant_id: DbId,
        template_type: &str,
        channel: Channel,
    ) -> Result<Vec<TemplateRow>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM notification_templates \
             WHERE tenant_id = $1 AND template_type = $2 AND channel = $3 AND is_active \
             ORDER BY is_default DESC, id"
        );
        sqlx::query_as::<_, TemplateRow>(&query)
            .bind(tenant_id)
            .bind(template_type)
            .bind(channel.as_str())
            .fetch_all(pool)
            .await
    }

    /// Make a template the default for its `(type, channel)`, clearing the
    /// previous default atomically. Returns `None` if the template does not
    /// exist.
    pub async fn set_default(
        pool: &PgPool,
        tenant_id: DbId,
        id: DbId,
    ) -> Result<Option<TemplateRow>, sqlx::Error> {
        let mut tx = pool.begin().await?;

        let query = format!(
            "SELECT {COLUMNS} FROM notification_templates \
             WHERE id = $1 AND tenant_id = $2 FOR UPDATE"
        );
        let Some(target) = sqlx::query_as::<_, TemplateRow>(&query)
            .bind(id)
            .bind(tenant_id)
            .fetch_optional(&mut *tx)
            .await?
        else {
            return Ok(None);
        };

        sqlx::query(
            "UPDATE notification_templates SET is_default = FALSE, updated_at = NOW() \
             WHERE tenant_id = $1 AND template_type = $2 AND channel = $3 \
               AND is_default AND id <> $4",
        )
        .bind(tenant_id)
        .bind(&target.template_type)
        .bind(&target.channel)
        .bind(id)
        .execute(&mut *tx)
        .await?;

        let query = format!(
            "UPDATE notification_templates SET is_default = TRUE, updated_at = NOW() \
             WHERE id = $1 \
             RETURNING {COLUMNS}"
        );
        let row = sqlx::query_as::<_, TemplateRow>(&query)
            .bind(id)
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(Some(row))
    }
}
