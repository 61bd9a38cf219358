//! Domain types and pure logic for the alert and notification engine.
//!
//! Nothing in this crate touches storage, the network, or the clock: every
//! time-dependent function takes `now` explicitly.

pub mod alert;
pub mod error;
pub mod escalation;
pub mod notification;
pub mod rate_limit;
pub mod settings;
pub mod stats;
pub mod template;
pub mod types;
