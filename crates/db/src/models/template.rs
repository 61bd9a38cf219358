//! Notification template row model.

use beacon_core::error::CoreError;
use beacon_core::template::Template;
use beacon_core::types::{DbId, Timestamp};
use serde::Serialize;
use sqlx::FromRow;

/// A row from the `notification_templates` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct TemplateRow {
    pub id: DbId,
    pub tenant_id: DbId,
    pub name: String,
    pub template_type: String,
    pub channel: String,
    pub language_code: String,
    pub subject_template: Option<String>,
    pub body_template: String,
    pub variables: Vec<String>,
    pub is_active: bool,
    pub is_default: bool,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl TryFrom<TemplateRow> for Template {
    type Error = CoreError;

    fn try_from(row: TemplateRow) -> Result<Self, Self::Error> {
        Ok(Template {
            id: row.id,
            tenant_id: row.tenant_id,
            name: row.name,
            template_type: row.template_type,
            channel: row.channel.parse()?,
            language_code: row.language_code,
            subject_template: row.subject_template,
            body_template: row.body_template,
            variables: row.variables,
            is_active: row.is_active,
            is_default: row.is_default,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}
