//! Repository layer.
//!
//! Each repository is a zero-sized struct providing async methods that
//! accept `&PgPool` as the first argument and return row models.

pub mod alert_repo;
pub mod audit_event_repo;
pub mod contact_repo;
pub mod notification_repo;
pub mod notification_setting_repo;
pub mod template_repo;

pub use alert_repo::AlertRepo;
pub use audit_event_repo::AuditEventRepo;
pub use contact_repo::ContactRepo;
pub use notification_repo::NotificationRepo;
pub use notification_setting_repo::NotificationSettingRepo;
pub use template_repo::TemplateRepo;
