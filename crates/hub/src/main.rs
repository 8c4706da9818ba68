//! MCPHub server binary

use std::sync::Arc;

use anyhow::Context;
use mcphub::mcp::{DefaultAdapterFactory, InMemoryToolSearch};
use mcphub::{routes::create_router, AppState, Config};
use mcphub_shared::MemoryConfigStore;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = Config::from_env()?;
    tracing::info!(
        bind = %config.bind_address,
        settings = %config.settings_path,
        "Starting MCPHub"
    );

    let store = Arc::new(
        MemoryConfigStore::load(&config.settings_path)
            .with_context(|| format!("failed to load {}", config.settings_path))?,
    );
    let factory = DefaultAdapterFactory::new(config.init_timeout(), config.request_timeout())?;
    let state = AppState::from_config(
        &config,
        store,
        Arc::new(factory),
        Arc::new(InMemoryToolSearch::new()),
    );

    state.spawn_change_fanout();
    state.start().await;
    state.manager.wait_until_settled(config.startup_settle()).await;

    let listener = tokio::net::TcpListener::bind(config.bind_address)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_address))?;
    tracing::info!(address = %config.bind_address, "Listening");

    axum::serve(listener, create_router(state.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Shutting down");
    state.shutdown().await;
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("mcphub=info,mcphub_shared=info,tower_http=info"));

    let json = std::env::var("LOG_FORMAT").is_ok_and(|format| format.eq_ignore_ascii_case("json"));
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
