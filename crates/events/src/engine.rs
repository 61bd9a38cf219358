//! Wiring for the engine components.

use std::sync::Arc;

use crate::bus::EventBus;
use crate::config::EngineConfig;
use crate::delivery::SenderRegistry;
use crate::dispatch::NotificationDispatcher;
use crate::lifecycle::AlertManager;
use crate::scheduler::EscalationScheduler;
use crate::settings::SettingsMatcher;
use crate::store::Stores;

/// Alert lifecycle, notification dispatch and settings, sharing one set of
/// stores and one event bus.
#[derive(Clone)]
pub struct Engine {
    pub alerts: Arc<AlertManager>,
    pub notifications: NotificationDispatcher,
    pub settings: SettingsMatcher,
    pub bus: Arc<EventBus>,
    pub config: Arc<EngineConfig>,
}

impl Engine {
    pub fn new(
        stores: Stores,
        senders: SenderRegistry,
        bus: Arc<EventBus>,
        config: EngineConfig,
    ) -> Self {
        let config = Arc::new(config);
        let settings = SettingsMatcher::new(
            stores.settings,
            stores.notifications.clone(),
            config.default_language.clone(),
        );
        let notifications = NotificationDispatcher::new(
            stores.notifications,
            settings.clone(),
            Arc::new(senders),
            bus.clone(),
            config.clone(),
        );
        let alerts = Arc::new(AlertManager::new(
            stores.alerts,
            bus.clone(),
            config.escalation_policy(),
        ));
        Self {
            alerts,
            notifications,
            settings,
            bus,
            config,
        }
    }

    /// Engine over in-memory stores with the registry built from `config`.
    pub fn in_memory(config: EngineConfig) -> Self {
        let senders = SenderRegistry::new(config.channel_concurrency, config.send_timeout);
        Self::new(Stores::memory(), senders, Arc::new(EventBus::default()), config)
    }

    pub fn scheduler(&self) -> EscalationScheduler {
        EscalationScheduler::new(
            self.alerts.clone(),
            self.notifications.clone(),
            self.settings.clone(),
            self.config.clone(),
        )
    }
}
