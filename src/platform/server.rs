use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{Router, middleware::from_fn_with_state, routing::get};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use super::api::{self, AppState};
use super::db::{DbHandle, MemoryStore, PgStore, Store};
use super::pages;
use super::runtime::DockerRuntime;
use super::session;
use super::ws;
use crate::config::CloudxConfig;

/// Configuration for the HTTP server.
pub struct ServerConfig {
    pub config: CloudxConfig,
    /// Keep all data in process memory instead of PostgreSQL.
    pub in_memory: bool,
}

/// Build the full application router: API, pages and WebSocket behind the
/// session middleware and request tracing.
pub fn build_router(state: Arc<AppState>) -> Router {
    api::api_router()
        .merge(pages::pages_router())
        .route("/ws", get(ws::ws_handler))
        .layer(from_fn_with_state(state.clone(), session::ensure_session))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Open the configured store and make sure the schema exists.
pub async fn open_store(config: &CloudxConfig, in_memory: bool) -> Result<DbHandle> {
    if in_memory {
        info!("using in-memory store");
        return Ok(Arc::new(MemoryStore::new()));
    }
    let store = PgStore::connect(&config.database)
        .await
        .context("Failed to connect to PostgreSQL")?;
    store
        .init_schema()
        .await
        .context("Failed to initialize database schema")?;
    info!(
        host = %config.database.host,
        database = %config.database.name,
        "connected to PostgreSQL"
    );
    Ok(Arc::new(store))
}

/// Start the server and block until shutdown.
pub async fn start_server(server: ServerConfig) -> Result<()> {
    let config = server.config;
    let db = open_store(&config, server.in_memory).await?;
    let runtime = DockerRuntime::connect().context("Failed to configure Docker client")?;

    let state = Arc::new(AppState::new(
        db,
        Arc::new(runtime),
        config.workspace.clone(),
        config.secret_key(),
    ));

    if !state.provisioner.runtime_reachable().await {
        tracing::warn!("Docker is not reachable; workspace launches will fail until it is");
    }

    let reaper = state
        .provisioner
        .clone()
        .spawn_reaper(Duration::from_secs(config.workspace.reap_interval_secs.max(1)));

    let mut app = build_router(state);
    if config.server.debug {
        app = app.layer(CorsLayer::permissive());
    }

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    info!("CloudX running at http://{}", local_addr);

    let served = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("Server error");

    reaper.abort();
    served?;
    info!("server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutting down");
}
