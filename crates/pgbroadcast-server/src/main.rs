//! pgbroadcast server binary.

use clap::Parser;
use pgbroadcast_core::{Broadcaster, BroadcasterConfig};
use pgbroadcast_server::{create_router, AppState, Args};
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments
    let args = Args::parse();

    // Initialize logging
    let log_filter = args.log_level.clone();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!(
                    "pgbroadcast_server={0},pgbroadcast_core={0},tower_http=info",
                    log_filter
                )
                .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = args.into_config();
    config.validate()?;

    info!(
        listen = %config.listen_addr,
        channels = ?config.channels,
        "Starting pgbroadcast server"
    );

    let Some((channel, extra_channels)) = config.channels.split_first() else {
        anyhow::bail!("no notification channel configured");
    };

    // Connect the upstream listener
    let broadcaster_config = BroadcasterConfig::default()
        .with_hub_capacity(config.hub_capacity)
        .with_upstream(config.upstream.clone());
    let broadcaster = Broadcaster::start(&config.database_url, channel, broadcaster_config).await?;
    for channel in extra_channels {
        broadcaster.listen(channel).await?;
    }

    // Create application state
    let state = AppState::new(broadcaster.hub(), broadcaster.upstream_state(), config.clone());

    // Create router
    let app = create_router(state);

    // Start server
    let listener = TcpListener::bind(&config.listen_addr).await?;
    info!("pgbroadcast listening on {}", config.listen_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down");
    drop(broadcaster);

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
}
