//! Row structs for the engine tables.
//!
//! Each submodule contains a `FromRow` struct matching the table and a
//! `TryFrom` conversion into the `beacon-core` domain type. Enum columns are
//! stored as text and parsed on the way out.

pub mod alert;
pub mod audit;
pub mod notification;
pub mod setting;
pub mod template;

use beacon_core::types::Metadata;

/// Unwrap a JSONB column into an object, treating anything else as empty.
pub(crate) fn metadata_from_json(value: serde_json::Value) -> Metadata {
    match value {
        serde_json::Value::Object(map) => map,
        _ => Metadata::new(),
    }
}
