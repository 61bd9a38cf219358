/// All database primary keys are PostgreSQL BIGSERIAL.
pub type DbId = i64;

/// Company / tenant identifier threaded through every engine call.
pub type TenantId = DbId;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Free-form JSON object attached to alerts and notifications.
pub type Metadata = serde_json::Map<String, serde_json::Value>;
