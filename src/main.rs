//! Delegate dispatch server

use clap::Parser;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use delegate_dispatch::config::DispatchConfig;
use delegate_dispatch::dispatch::sweeper;
use delegate_dispatch::AppState;

#[derive(Parser, Debug)]
#[command(name = "delegate-dispatch")]
#[command(about = "Dispatch tasks to a fleet of remote delegates")]
struct Args {
    /// Address to listen on
    #[arg(long, env = "DISPATCH_BIND", default_value = "0.0.0.0:3000")]
    bind: String,

    /// SQLite database URL
    #[arg(long, env = "DATABASE_URL", default_value = "sqlite:dispatch.db")]
    database_url: String,

    /// Re-queues allowed after a failed run
    #[arg(long, env = "DISPATCH_MAX_RETRIES")]
    max_retries: u32,

    /// Silence from an executing delegate after which its task fails over
    #[arg(long, env = "DISPATCH_EXECUTION_TIMEOUT_SECS")]
    execution_timeout_secs: u64,

    #[arg(long, env = "DISPATCH_HEARTBEAT_TIMEOUT_SECS", default_value_t = 90)]
    heartbeat_timeout_secs: u64,

    #[arg(long, env = "DISPATCH_DEFAULT_TASK_EXPIRY_SECS", default_value_t = 3600)]
    default_task_expiry_secs: u64,

    #[arg(long, env = "DISPATCH_SYNC_TASK_TIMEOUT_SECS", default_value_t = 300)]
    sync_task_timeout_secs: u64,

    #[arg(long, env = "DISPATCH_CAPABILITY_ALLOWED_SECS", default_value_t = 6 * 60 * 60)]
    capability_allowed_secs: u64,

    #[arg(long, env = "DISPATCH_CAPABILITY_DENIED_SECS", default_value_t = 600)]
    capability_denied_secs: u64,

    /// Silence after which a delegate is removed from the registry
    #[arg(long, env = "DISPATCH_DELEGATE_REAP_AFTER_SECS", default_value_t = 6 * 60 * 60)]
    delegate_reap_after_secs: u64,

    #[arg(long, env = "DISPATCH_SWEEP_INTERVAL_MS", default_value_t = 5000)]
    sweep_interval_ms: u64,

    /// Time an offered delegate gets before the task is offered to the next one
    #[arg(long, env = "DISPATCH_OFFER_TIMEOUT_SECS", default_value_t = 30)]
    offer_timeout_secs: u64,

    /// Require explicit approval of delegates first seen by heartbeat
    #[arg(long, env = "DISPATCH_REQUIRE_APPROVAL")]
    require_approval: bool,
}

impl Args {
    fn dispatch_config(&self) -> DispatchConfig {
        DispatchConfig::new(self.max_retries, Duration::from_secs(self.execution_timeout_secs))
            .with_heartbeat_timeout(Duration::from_secs(self.heartbeat_timeout_secs))
            .with_default_task_expiry(Duration::from_secs(self.default_task_expiry_secs))
            .with_sync_task_timeout(Duration::from_secs(self.sync_task_timeout_secs))
            .with_capability_validity(
                Duration::from_secs(self.capability_allowed_secs),
                Duration::from_secs(self.capability_denied_secs),
            )
            .with_delegate_reap_after(Duration::from_secs(self.delegate_reap_after_secs))
            .with_sweep_interval(Duration::from_millis(self.sweep_interval_ms))
            .with_offer_timeout(Duration::from_secs(self.offer_timeout_secs))
            .with_approve_on_heartbeat(!self.require_approval)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "delegate_dispatch=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = args.dispatch_config();

    let options = SqliteConnectOptions::from_str(&args.database_url)?.create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    // Run migrations
    sqlx::migrate!("./migrations").run(&pool).await?;

    let state = AppState::new(pool, config.clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper = sweeper::spawn(state.dispatcher.clone(), &config, shutdown_rx);

    let app = delegate_dispatch::router(state);

    let listener = tokio::net::TcpListener::bind(&args.bind).await?;
    tracing::info!("Server listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown requested");
        })
        .await?;

    let _ = shutdown_tx.send(true);
    let totals = sweeper.await?;
    tracing::info!(
        expired = totals.expired,
        requeued = totals.requeued,
        reoffered = totals.reoffered,
        reaped = totals.reaped,
        "Sweeper stopped"
    );

    Ok(())
}
