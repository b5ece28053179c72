//! Gateway server assembly
//!
//! Builds the shared state (event store, registry, broker, session core),
//! the axum router (`/ws`, `/health`, static UI fallback), and serves until
//! shutdown, at which point every live agent subprocess is killed.

use axum::{response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;
use std::sync::Arc;
use tower_http::services::ServeDir;

use crate::broker::Broker;
use crate::config::BridgeConfig;
use crate::error::Result;
use crate::events::EventStore;
use crate::gateway::handler::{ws_upgrade, GatewayState};
use crate::session::registry::RequestRegistry;
use crate::session::SessionCore;

/// The bridge service
pub struct Gateway {
    config: BridgeConfig,
    core: Arc<SessionCore>,
}

impl Gateway {
    /// Open the durable store and assemble the core.
    pub fn new(config: BridgeConfig) -> Result<Self> {
        let store = Arc::new(EventStore::open(&config.db_path())?);
        Self::with_store(config, store)
    }

    /// Assemble around an existing store (tests use the in-memory one).
    pub fn with_store(config: BridgeConfig, store: Arc<EventStore>) -> Result<Self> {
        let core = Arc::new(SessionCore::new(
            config.clone(),
            store,
            Arc::new(RequestRegistry::new()),
            Arc::new(Broker::new()),
        ));
        Ok(Self { config, core })
    }

    pub fn core(&self) -> &Arc<SessionCore> {
        &self.core
    }

    /// Build the router: WebSocket endpoint, health check, static UI files.
    pub fn router(&self) -> Router {
        let state = GatewayState {
            core: self.core.clone(),
        };
        Router::new()
            .route("/ws", get(ws_upgrade))
            .route("/health", get(health_check))
            .fallback_service(ServeDir::new(&self.config.static_dir))
            .with_state(state)
    }

    /// Bind and serve until Ctrl-C, then kill all live agents.
    pub async fn serve(&self) -> Result<()> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        tracing::info!(
            addr,
            agent_command = %self.config.agent_command,
            "Bridge listening"
        );

        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        tracing::info!("Shutting down");
        self.core.shutdown().await;
        Ok(())
    }
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

/// Health check response
#[derive(Debug, Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use tempfile::TempDir;

    fn make_gateway() -> (Gateway, TempDir) {
        let dir = TempDir::new().unwrap();
        let config = BridgeConfig {
            default_cwd: dir.path().to_path_buf(),
            data_dir: dir.path().to_path_buf(),
            static_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let store = Arc::new(EventStore::open_in_memory().unwrap());
        let gateway = Gateway::with_store(config, store).unwrap();
        (gateway, dir)
    }

    #[tokio::test]
    async fn router_builds() {
        let (gateway, _dir) = make_gateway();
        let _router = gateway.router();
    }

    #[tokio::test]
    async fn health_check_ok() {
        let response = health_check().await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn new_opens_store_under_data_dir() {
        let dir = TempDir::new().unwrap();
        let config = BridgeConfig {
            data_dir: dir.path().join("state"),
            ..Default::default()
        };
        let gateway = Gateway::new(config).unwrap();
        assert!(dir.path().join("state").join("bridge.db").exists());
        drop(gateway);
    }
}
