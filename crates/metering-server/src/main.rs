//! Credit metering gateway - Entry point.

mod config;

use crate::config::Config;
use anyhow::Context;
use metering::{
    api::{create_router, AppState},
    spawn_sweeper, ProviderRouter, Storage,
};
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_logging(&config.log.level);

    info!("Starting credit metering gateway");

    let meter = config.meter;

    // Initialize storage
    let storage = if meter.storage.persist {
        Storage::open(&meter.storage.path).with_context(|| {
            format!("Failed to open storage at {}", meter.storage.path.display())
        })?
    } else {
        info!("Persistence disabled, using in-memory storage");
        Storage::memory()
    };

    // Initialize providers
    let router = ProviderRouter::from_config(&meter).context("Failed to configure providers")?;
    if router.is_empty() {
        warn!("No completion providers configured; billed calls will fail");
    } else {
        info!("Providers in fallback order: {:?}", router.provider_names());
    }

    let addr = format!("{}:{}", meter.server.listen_addr, meter.server.port);
    let sweep = meter.dispatch.sweep_enabled.then(|| meter.dispatch.clone());

    // Create application state
    let state = AppState::new(meter, storage, router).context("Failed to build application")?;

    let sweeper = match sweep {
        Some(dispatch) => Some(spawn_sweeper(state.dispatcher.clone(), &dispatch)),
        None => {
            info!("Job sweep disabled; relying on the eager trigger and external schedulers");
            None
        }
    };

    let app = create_router(state);

    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    info!("Listening on {}", addr);

    serve(listener, app).await?;

    if let Some(handle) = sweeper {
        handle.abort();
    }
    info!("Shutdown complete");
    Ok(())
}

async fn serve(listener: TcpListener, app: axum::Router) -> anyhow::Result<()> {
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if signal::ctrl_c().await.is_ok() {
                info!("Shutdown signal received");
            }
        })
        .await
        .context("Server error")
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
