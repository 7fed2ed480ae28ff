//! Read-only HTTP stats API
//!
//! Serves point-in-time snapshots of the counters; nothing here can mutate
//! accounting state. When a token is configured, the `/api` routes require
//! `Authorization: Bearer <token>`.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use serde_json::json;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::info;

use crate::error::{Error, Result};
use crate::stats::{format_bytes, ProxyStats, StatsManager};

#[derive(Clone)]
struct ApiState {
    manager: Arc<StatsManager>,
    token: Arc<str>,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub proxies: Vec<ProxyStatsResponse>,
}

#[derive(Debug, Serialize)]
pub struct ProxyStatsResponse {
    pub name: String,
    pub protocol: String,
    pub listen_port: u16,
    pub target_port: u16,
    pub total: TrafficData,
    pub monthly: MonthlyData,
}

#[derive(Debug, Serialize)]
pub struct TrafficData {
    pub upload: u64,
    pub download: u64,
    pub upload_human: String,
    pub download_human: String,
}

#[derive(Debug, Serialize)]
pub struct MonthlyData {
    pub month: String,
    pub upload: u64,
    pub download: u64,
    pub upload_human: String,
    pub download_human: String,
}

fn to_response(stats: &ProxyStats) -> ProxyStatsResponse {
    let info = stats.info();
    let total_upload = stats.total_upload();
    let total_download = stats.total_download();
    let monthly_upload = stats.monthly_upload();
    let monthly_download = stats.monthly_download();

    ProxyStatsResponse {
        name: stats.name().to_string(),
        protocol: info.protocol.to_string(),
        listen_port: info.listen_port,
        target_port: info.target_port,
        total: TrafficData {
            upload: total_upload,
            download: total_download,
            upload_human: format_bytes(total_upload),
            download_human: format_bytes(total_download),
        },
        monthly: MonthlyData {
            month: stats.current_month(),
            upload: monthly_upload,
            download: monthly_download,
            upload_human: format_bytes(monthly_upload),
            download_human: format_bytes(monthly_download),
        },
    }
}

async fn handle_health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

async fn handle_stats(State(state): State<ApiState>) -> Json<StatsResponse> {
    let proxies = state
        .manager
        .get_all()
        .iter()
        .map(|stats| to_response(stats))
        .collect();
    Json(StatsResponse { proxies })
}

async fn handle_stats_by_name(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> Response {
    match state.manager.get(&name) {
        Some(stats) => Json(to_response(&stats)).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "proxy not found"})),
        )
            .into_response(),
    }
}

async fn require_bearer(State(state): State<ApiState>, request: Request, next: Next) -> Response {
    let authorized = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split_once(' '))
        .map(|(scheme, token)| {
            scheme.eq_ignore_ascii_case("bearer") && token == state.token.as_ref()
        })
        .unwrap_or(false);

    if !authorized {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "invalid token"})),
        )
            .into_response();
    }
    next.run(request).await
}

fn build_router(manager: Arc<StatsManager>, token: &str) -> Router {
    let state = ApiState {
        manager,
        token: Arc::from(token),
    };

    let mut api = Router::new()
        .route("/stats", get(handle_stats))
        .route("/stats/:name", get(handle_stats_by_name));
    if !token.is_empty() {
        api = api.route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_bearer,
        ));
    }

    Router::new()
        .route("/health", get(handle_health))
        .nest("/api", api)
        .with_state(state)
}

/// HTTP server for the stats endpoints
pub struct ApiServer {
    port: u16,
    token: String,
    manager: Arc<StatsManager>,
    shutdown_tx: broadcast::Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl ApiServer {
    pub fn new(port: u16, token: &str, manager: Arc<StatsManager>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            port,
            token: token.to_string(),
            manager,
            shutdown_tx,
            handle: None,
        }
    }

    /// Bind and start serving. A bind failure is a startup error.
    pub async fn start(&mut self) -> Result<()> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|source| Error::Bind { addr, source })?;

        info!("API server listening on http://{}", listener.local_addr()?);

        let app = build_router(self.manager.clone(), &self.token);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        self.handle = Some(tokio::spawn(async move {
            let _ = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.recv().await;
                    info!("API server shutting down");
                })
                .await;
        }));
        Ok(())
    }

    pub async fn stop(&mut self) {
        let _ = self.shutdown_tx.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::Protocol;

    fn manager_with_one_proxy() -> Arc<StatsManager> {
        let manager = Arc::new(StatsManager::new());
        let stats = manager.register("web", Protocol::Both, 8001, 80, 0, 0);
        stats.add_upload(2048);
        stats.add_download(512);
        manager
    }

    #[test]
    fn test_response_conversion() {
        let manager = manager_with_one_proxy();
        let stats = manager.get("web").unwrap();

        let response = to_response(&stats);
        assert_eq!(response.name, "web");
        assert_eq!(response.protocol, "both");
        assert_eq!(response.listen_port, 8001);
        assert_eq!(response.total.upload, 2048);
        assert_eq!(response.total.upload_human, "2.00 KB");
        assert_eq!(response.total.download, 512);
        assert_eq!(response.total.download_human, "512 B");
        assert_eq!(response.monthly.upload, 2048);
        assert_eq!(response.monthly.month, stats.current_month());
    }

    #[test]
    fn test_response_serializes_expected_shape() {
        let manager = manager_with_one_proxy();
        let stats = manager.get("web").unwrap();

        let value = serde_json::to_value(to_response(&stats)).unwrap();
        assert_eq!(value["name"], "web");
        assert_eq!(value["total"]["upload"], 2048);
        assert_eq!(value["monthly"]["download_human"], "512 B");
    }

    #[tokio::test]
    async fn test_server_lifecycle() {
        let manager = manager_with_one_proxy();
        let mut server = ApiServer::new(0, "secret", manager);
        // Port 0 binds an ephemeral port; lifecycle must still be clean.
        server.start().await.unwrap();
        server.stop().await;
    }
}
