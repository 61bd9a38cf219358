//! Beacon alerting engine.
//!
//! - [`lifecycle`]: alert state transitions over optimistic version CAS.
//! - [`scheduler`]: periodic suppression sweep, escalation and auto-resolve.
//! - [`dispatch`]: notification enqueue, leasing, delivery and retry.
//! - [`delivery`]: channel senders (email, SMS, push, in-app).
//! - [`settings`]: notification settings, templates and rate limits.
//! - [`store`]: storage traits with Postgres and in-memory backends.
//! - [`EventBus`] and [`AuditPersistence`]: audit events and their writer.

pub mod bus;
pub mod config;
pub mod delivery;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod persistence;
pub mod scheduler;
pub mod settings;
pub mod store;
pub mod transition;

pub use bus::{EngineEvent, EventBus};
pub use config::EngineConfig;
pub use delivery::{ChannelSender, DeliveryError, SenderRegistry};
pub use dispatch::{Content, DispatchReport, NotificationDispatcher, NotificationRequest};
pub use engine::Engine;
pub use error::{EngineError, EngineResult};
pub use lifecycle::{AlertManager, RaiseOutcome};
pub use persistence::AuditPersistence;
pub use scheduler::{AutoResolveCheck, EscalationScheduler, TickReport};
pub use settings::SettingsMatcher;
pub use store::{MemoryStore, PgStore, Stores};
pub use transition::Transition;
