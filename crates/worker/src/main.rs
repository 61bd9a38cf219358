use std::sync::Arc;

use anyhow::Context;
use beacon_events::delivery::contacts::{ContactDirectory, PgContacts};
use beacon_events::delivery::email::{EmailConfig, EmailSender};
use beacon_events::delivery::gateway::GatewayClient;
use beacon_events::delivery::push::PushSender;
use beacon_events::delivery::sms::SmsSender;
use beacon_events::{AuditPersistence, Engine, EngineConfig, EventBus, SenderRegistry, Stores};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    // --- Configuration ---
    let config = EngineConfig::from_env();
    tracing::info!(
        threshold_minutes = config.escalation_threshold_minutes,
        max_level = config.escalation_max_level,
        tick_secs = config.scheduler_tick.as_secs(),
        "Loaded engine configuration"
    );

    // --- Database ---
    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let pool = beacon_db::create_pool(&database_url)
        .await
        .context("Failed to connect to database")?;
    beacon_db::health_check(&pool)
        .await
        .context("Database health check failed")?;
    beacon_db::run_migrations(&pool)
        .await
        .context("Failed to run database migrations")?;
    tracing::info!("Database ready");

    // --- Channel senders ---
    let contacts: Arc<dyn ContactDirectory> = Arc::new(PgContacts::new(pool.clone()));
    let senders = build_senders(&config, contacts)?;

    // --- Event bus + audit persistence ---
    let bus = Arc::new(EventBus::default());
    let persistence_handle = tokio::spawn(AuditPersistence::run(pool.clone(), bus.subscribe()));

    // --- Engine + scheduler ---
    let engine = Engine::new(Stores::postgres(pool), senders, bus, config);
    let scheduler = engine.scheduler();
    let cancel = CancellationToken::new();
    let scheduler_cancel = cancel.clone();
    let scheduler_handle = tokio::spawn(async move {
        scheduler.run(scheduler_cancel).await;
    });
    tracing::info!("Worker started");

    shutdown_signal().await;

    // --- Shutdown ---
    cancel.cancel();
    if let Err(e) = scheduler_handle.await {
        tracing::error!(error = %e, "Scheduler task ended abnormally");
    }
    // Dropping the engine closes the bus once the scheduler's clones are gone.
    drop(engine);
    if let Err(e) = persistence_handle.await {
        tracing::error!(error = %e, "Audit persistence task ended abnormally");
    }
    tracing::info!("Graceful shutdown complete");
    Ok(())
}

/// `RUST_LOG` filtering with a worker-level default; `LOG_FORMAT=json`
/// switches to JSON lines.
fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "beacon_worker=info,beacon_events=info".into());
    let json = std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Register a sender for every channel that has transport configuration.
/// The rest stay unconfigured and fail with a recorded error.
fn build_senders(
    config: &EngineConfig,
    contacts: Arc<dyn ContactDirectory>,
) -> anyhow::Result<SenderRegistry> {
    let mut registry = SenderRegistry::new(config.channel_concurrency, config.send_timeout);

    match EmailConfig::from_env() {
        Some(email) => {
            let host = email.smtp_host.clone();
            let sender = EmailSender::new(email, contacts.clone())
                .context("Failed to build SMTP transport")?;
            registry = registry.register(Arc::new(sender));
            tracing::info!(host = %host, "Email channel configured");
        }
        None => tracing::warn!("SMTP_HOST not set, email channel disabled"),
    }

    match &config.sms_gateway_url {
        Some(url) => {
            let gateway = GatewayClient::new(url.clone(), config.send_timeout)
                .context("Failed to build SMS gateway client")?;
            registry = registry.register(Arc::new(SmsSender::new(gateway, contacts.clone())));
            tracing::info!(url = %url, "SMS channel configured");
        }
        None => tracing::warn!("SMS_GATEWAY_URL not set, SMS channel disabled"),
    }

    match &config.push_gateway_url {
        Some(url) => {
            let gateway = GatewayClient::new(url.clone(), config.send_timeout)
                .context("Failed to build push gateway client")?;
            registry = registry.register(Arc::new(PushSender::new(gateway, contacts)));
            tracing::info!(url = %url, "Push channel configured");
        }
        None => tracing::warn!("PUSH_GATEWAY_URL not set, push channel disabled"),
    }

    Ok(registry)
}

/// Wait for SIGINT or, on Unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("Received SIGINT (Ctrl-C), shutting down"),
        () = terminate => tracing::info!("Received SIGTERM, shutting down"),
    }
}
