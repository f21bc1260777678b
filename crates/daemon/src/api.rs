// proxid - REST API Module
// Handles the HTTP control surface for the tunnel manager

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    response::IntoResponse,
    routing::{get, post},
    Form, Json, Router,
};
use serde::Deserialize;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use proxid_common::{ApiResponse, HostDirectory, HostRecord, TunnelStatusResponse};

use crate::tunnel::{TunnelManager, TunnelState};

/// Shared application state
pub struct AppState {
    pub tunnel_manager: TunnelManager,
    pub hosts: HostDirectory,
}

/// Parameters of `POST /start`, taken from the form body or the query string
#[derive(Debug, Default, Deserialize)]
struct StartForm {
    #[serde(default)]
    host: String,
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/start", post(start_tunnel))
        .route("/stop", post(stop_tunnel))
        .route("/info", get(list_hosts))
        .route("/status", get(tunnel_status))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check endpoint
async fn health() -> &'static str {
    "OK"
}

/// Start (or switch to) the tunnel for a named host
///
/// `host` is read from a urlencoded body first, then from the query string;
/// a request carrying neither is answered as an unknown (empty) host.
async fn start_tunnel(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StartForm>,
    form: Option<Form<StartForm>>,
) -> Json<ApiResponse> {
    let name = form
        .map(|Form(form)| form.host)
        .filter(|host| !host.is_empty())
        .unwrap_or(query.host);

    info!("API: Start tunnel request for '{}'", name);

    // Unknown hosts never reach the tunnel manager
    let Some(host) = state.hosts.get(&name) else {
        warn!("Rejected start for unknown host '{}'", name);
        return Json(ApiResponse::error_with(format!("invalid host '{}'", name)));
    };

    let started = state.tunnel_manager.start(host.clone()).await;
    Json(ApiResponse::from_success(started))
}

/// Stop the active tunnel, if any
async fn stop_tunnel(State(state): State<Arc<AppState>>) -> Json<ApiResponse> {
    info!("API: Stop tunnel request");

    let stopped = state.tunnel_manager.stop().await;
    Json(ApiResponse::from_success(stopped))
}

/// List every host of the directory
async fn list_hosts(State(state): State<Arc<AppState>>) -> Json<Vec<HostRecord>> {
    Json(state.hosts.hosts().cloned().collect())
}

/// Report which tunnel, if any, is running
async fn tunnel_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let socks_port = state.tunnel_manager.socks_port();

    let response = match state.tunnel_manager.status().await {
        Some(TunnelState::Active { host, pid, since }) => TunnelStatusResponse {
            active: true,
            host: Some(host),
            pid,
            socks_port,
            since: Some(since),
        },
        Some(TunnelState::Idle) | None => TunnelStatusResponse {
            active: false,
            host: None,
            pid: None,
            socks_port,
            since: None,
        },
    };

    Json(response)
}
