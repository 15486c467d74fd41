//! Read-only HTTP status endpoint.
//!
//! Exposes whether the bot has gone live and which timers are pending.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{Json, Router, extract::State, routing::get};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;

use crate::agent::{SyncGate, TimerInfo, TimerRegistry};
use crate::error::ChannelError;

/// Configuration for the status server.
pub struct StatusServerConfig {
    /// Address to bind the server to.
    pub addr: SocketAddr,
}

#[derive(Clone)]
struct StatusState {
    gate: Arc<SyncGate>,
    timers: Arc<TimerRegistry>,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    live: bool,
    cutoff: Option<DateTime<Utc>>,
}

/// Serves `/health` and `/timers` until shut down.
pub struct StatusServer {
    config: StatusServerConfig,
    state: StatusState,
    local_addr: Option<SocketAddr>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl StatusServer {
    pub fn new(config: StatusServerConfig, gate: Arc<SyncGate>, timers: Arc<TimerRegistry>) -> Self {
        Self {
            config,
            state: StatusState { gate, timers },
            local_addr: None,
            shutdown_tx: None,
            handle: None,
        }
    }

    fn routes(&self) -> Router {
        Router::new()
            .route("/health", get(health_handler))
            .route("/timers", get(timers_handler))
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Bind the listener and spawn the server.
    pub async fn start(&mut self) -> Result<(), ChannelError> {
        let listener = tokio::net::TcpListener::bind(self.config.addr)
            .await
            .map_err(|e| ChannelError::StartupFailed {
                name: "status_server".to_string(),
                reason: format!("Failed to bind to {}: {}", self.config.addr, e),
            })?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| ChannelError::StartupFailed {
                name: "status_server".to_string(),
                reason: e.to_string(),
            })?;

        tracing::info!("Status server listening on {}", local_addr);

        let app = self.routes();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                    tracing::info!("Status server shutting down");
                })
                .await
            {
                tracing::error!("Status server error: {}", e);
            }
        });

        self.local_addr = Some(local_addr);
        self.shutdown_tx = Some(shutdown_tx);
        self.handle = Some(handle);
        Ok(())
    }

    /// The bound address, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Signal graceful shutdown and wait for the server task to finish.
    pub async fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

async fn health_handler(State(state): State<StatusState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        live: state.gate.is_live(),
        cutoff: state.gate.cutoff(),
    })
}

async fn timers_handler(State(state): State<StatusState>) -> Json<Vec<TimerInfo>> {
    Json(state.timers.active())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingTransport;

    async fn get_json(addr: SocketAddr, path: &str) -> serde_json::Value {
        reqwest::get(format!("http://{addr}{path}"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_and_timers() {
        let gate = Arc::new(SyncGate::new());
        let timers = Arc::new(TimerRegistry::new(RecordingTransport::new(), None));
        let mut server = StatusServer::new(
            StatusServerConfig {
                addr: "127.0.0.1:0".parse().unwrap(),
            },
            Arc::clone(&gate),
            Arc::clone(&timers),
        );
        server.start().await.unwrap();
        let addr = server.local_addr().unwrap();

        let health = get_json(addr, "/health").await;
        assert_eq!(health["status"], "healthy");
        assert_eq!(health["live"], false);
        assert!(health["cutoff"].is_null());

        gate.mark_sync_complete();
        let id = timers.schedule(600, "!r:x").unwrap();

        let health = get_json(addr, "/health").await;
        assert_eq!(health["live"], true);
        assert!(health["cutoff"].is_string());

        let listed = get_json(addr, "/timers").await;
        let listed = listed.as_array().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0]["id"], id.as_str());
        assert_eq!(listed[0]["room_id"], "!r:x");
        assert_eq!(listed[0]["duration_seconds"], 600);

        server.shutdown().await;
    }
}
