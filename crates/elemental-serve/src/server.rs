// ABOUTME: Gateway server lifecycle - wires the core together and serves until shutdown.
// ABOUTME: Graceful exit on Ctrl+C or SIGTERM; the dispatch daemon stops at its next boundary.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal;
use tracing::info;

use elemental_core::{
    ChannelHub, DispatchDaemon, EventBus, OrchestratorConfig, ProviderRegistry, SessionManager,
    Spawner, TaskStore,
};

use crate::routes::{build_router, AppState};

#[derive(Debug, Clone)]
pub struct ServeConfig {
    /// Bind address, e.g. "127.0.0.1:7420".
    pub http_addr: String,
    pub orchestrator: OrchestratorConfig,
}

impl Default for ServeConfig {
    fn default() -> Self {
        Self {
            http_addr: "127.0.0.1:7420".to_string(),
            orchestrator: OrchestratorConfig::default(),
        }
    }
}

/// Run the gateway until a shutdown signal arrives.
pub async fn run(config: ServeConfig, store: Arc<dyn TaskStore>) -> Result<()> {
    info!("starting elemental gateway");
    info!("  HTTP address: {}", config.http_addr);
    info!("  provider: {}", config.orchestrator.provider);

    let registry = ProviderRegistry::with_defaults();
    let provider = registry
        .resolve(&config.orchestrator.provider)
        .context("resolving provider")?;

    let hub = Arc::new(ChannelHub::default());
    let bus = Arc::new(
        EventBus::new(config.orchestrator.subscriber_buffer).with_hub(hub.clone()),
    );
    let spawner = Arc::new(Spawner::new(provider, bus, config.orchestrator.clone()));
    let manager = Arc::new(SessionManager::new(spawner, store.clone(), hub.clone()));
    let daemon = Arc::new(DispatchDaemon::new(
        store,
        hub.clone(),
        config.orchestrator.dispatch.clone(),
    ));
    daemon.start().await;

    let state = Arc::new(AppState {
        manager,
        daemon: daemon.clone(),
        hub,
    });
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&config.http_addr)
        .await
        .with_context(|| format!("binding {}", config.http_addr))?;
    info!("gateway listening on {}", config.http_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running HTTP server")?;

    daemon.stop().await;
    info!("gateway shut down gracefully");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("received Ctrl+C, shutting down");
        }
        _ = terminate => {
            info!("received SIGTERM, shutting down");
        }
    }
}
