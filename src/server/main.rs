//! Entry point: loads configuration, connects to Postgres, runs migrations,
//! wires the executor/scheduler/sweeps background loops, and serves the
//! public ping endpoints until a shutdown signal arrives.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use cronbox_core::common::ids::WorkspaceId;
use cronbox_core::config::Config;
use cronbox_core::kernel::executor::{Executor, NotificationDirectory};
use cronbox_core::kernel::notifications::{Channel, NotificationEvent, Recipient};
use cronbox_core::kernel::scheduler::Scheduler;
use cronbox_core::kernel::sweeps::Sweeps;
use cronbox_core::server::build_app;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Workspace notification settings (enabled channels, address lists,
/// recipient language) live in the admin/billing surface, which spec.md §1
/// scopes out as an external collaborator. This reads one flat fallback
/// address list from the environment so the binary is runnable standalone;
/// a real deployment swaps this for a settings-table-backed implementation.
struct EnvNotificationDirectory {
    recipients: Vec<Recipient>,
    webhook_secrets: HashMap<String, String>,
}

impl EnvNotificationDirectory {
    fn from_env() -> Self {
        let mut recipients = Vec::new();
        if let Ok(addr) = std::env::var("NOTIFY_WEBHOOK_URL") {
            recipients.push(Recipient { channel: Channel::Webhook, address: addr, language: "en".to_string() });
        }
        if let Ok(chat_id) = std::env::var("NOTIFY_TELEGRAM_CHAT_ID") {
            recipients.push(Recipient { channel: Channel::Telegram, address: chat_id, language: "en".to_string() });
        }
        if let Ok(addr) = std::env::var("NOTIFY_EMAIL_ADDRESS") {
            recipients.push(Recipient { channel: Channel::Email, address: addr, language: "en".to_string() });
        }

        let mut webhook_secrets = HashMap::new();
        if let (Ok(url), Ok(secret)) = (std::env::var("NOTIFY_WEBHOOK_URL"), std::env::var("NOTIFY_WEBHOOK_SECRET")) {
            webhook_secrets.insert(url, secret);
        }

        Self { recipients, webhook_secrets }
    }
}

#[async_trait]
impl NotificationDirectory for EnvNotificationDirectory {
    async fn recipients_for(&self, _workspace_id: WorkspaceId, _event: NotificationEvent) -> Vec<Recipient> {
        self.recipients.clone()
    }

    fn webhook_secrets(&self) -> HashMap<String, String> {
        self.webhook_secrets.clone()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,cronbox_core=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting CronBox-core");

    let config = Config::from_env().context("Failed to load configuration")?;
    tracing::info!("Configuration loaded");

    tracing::info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(20)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;
    tracing::info!("Database connected");

    tracing::info!("Running database migrations...");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("Failed to run migrations")?;
    tracing::info!("Migrations complete");

    let directory: Arc<dyn NotificationDirectory> = Arc::new(EnvNotificationDirectory::from_env());
    let telegram_bot_token = std::env::var("TELEGRAM_BOT_TOKEN").ok();
    let email_api_url = std::env::var("EMAIL_API_URL").ok();

    let http = reqwest::Client::builder()
        .timeout(config.notification_webhook_timeout)
        .build()
        .context("Failed to build HTTP client")?;

    let (executor, job_receiver) = Executor::new(
        pool.clone(),
        http,
        config.clone(),
        directory,
        telegram_bot_token,
        email_api_url,
    );
    executor.clone().spawn_worker_pool(job_receiver, config.executor_pool_size);

    let scheduler = Scheduler::new(pool.clone(), executor.clone(), config.clone());
    scheduler.spawn_loops();

    let sweeps = Sweeps::new(pool.clone(), executor.clone(), config.clone());
    sweeps.spawn_loops();

    let app = build_app(pool, executor);

    let addr = format!("0.0.0.0:{}", config.port);
    tracing::info!("Starting server on {}", addr);
    tracing::info!("Health check: http://localhost:{}/health", config.port);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, app.into_make_service_with_connect_info::<std::net::SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, draining in-flight work");
}
