mod api;
mod archive;
mod config;
mod recorder;
mod ws;

use fog_common::Hub;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tower_http::cors::CorsLayer;

/// How often idle session channels are swept.
const PRUNE_INTERVAL: Duration = Duration::from_secs(60);

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .expect("failed to register SIGTERM handler");
    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT, shutting down..."),
        _ = sigterm.recv() => tracing::info!("Received SIGTERM, shutting down..."),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("fog_server=info".parse()?)
                .add_directive("fog_common=info".parse()?),
        )
        .init();

    let config = Arc::new(config::Config::from_env());
    tracing::info!("Starting fog server on {}", config.listen_addr);

    let valkey_client = redis::Client::open(config.valkey_url.as_str())?;
    let valkey_con = valkey_client.get_multiplexed_async_connection().await?;

    let hub = Arc::new(Hub::new(config.channel_capacity));
    let archive = Arc::new(Mutex::new(archive::FogArchive::new(
        valkey_con.clone(),
        config.archive_cache,
    )));

    let state = api::AppState {
        hub: hub.clone(),
        archive,
        valkey: valkey_con,
        config: config.clone(),
        recorders: Arc::new(recorder::RecorderRegistry::new()),
    };

    // Sweep channels nobody is connected to any more
    let prune_hub = hub.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(PRUNE_INTERVAL);
        loop {
            interval.tick().await;
            let pruned = prune_hub.prune();
            if pruned > 0 {
                tracing::debug!("Pruned {} idle fog channels", pruned);
            }
        }
    });

    let app = api::router(state)
        .layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    tracing::info!("Server listening on {}", config.listen_addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server stopped.");
    Ok(())
}
