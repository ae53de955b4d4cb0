// crates/ecmaster-rs-panel/src/server.rs
//! JSON API over a [`BusSession`] using axum.
//!
//! Bus operations block for up to several seconds (open, discovery, latency
//! runs), so every handler hands its work to `spawn_blocking`.

use crate::error::PanelError;
use crate::session::BusSession;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use ecmaster_rs::MasterDocument;
use log::{error, info, trace};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;

type SharedSession = Arc<BusSession>;

#[derive(Debug, Default, Deserialize)]
struct ConnectRequest {
    adapter: Option<String>,
    cycle_ms: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
struct DiscoverQuery {
    adapter: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct LatencyRequest {
    #[serde(default)]
    slave: u16,
    samples: Option<usize>,
}

/// Builds the panel's routes around `session`.
pub fn router(session: SharedSession) -> Router {
    Router::new()
        .route("/", get(root_handler))
        .route("/api/adapters", get(adapters_handler))
        .route("/api/connect", post(connect_handler))
        .route("/api/disconnect", post(disconnect_handler))
        .route("/api/status", get(status_handler))
        .route("/api/discover", get(discover_handler))
        .route("/api/run_network_test", post(latency_handler))
        .route("/api/pdo_config", get(get_pdo_handler).post(post_pdo_handler))
        .with_state(session)
}

/// Binds `addr` and serves the panel until the server fails.
pub async fn serve(addr: SocketAddr, session: SharedSession) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
        error!("Failed to bind control panel to {}: {}", addr, e);
        e
    })?;
    info!("Control panel listening on http://{}", listener.local_addr()?);
    axum::serve(listener, router(session)).await
}

/// Runs `work` on the blocking pool and renders its outcome as JSON.
async fn blocking<T, F>(session: SharedSession, work: F) -> Response
where
    T: Serialize + Send + 'static,
    F: FnOnce(&BusSession) -> Result<T, PanelError> + Send + 'static,
{
    match tokio::task::spawn_blocking(move || work(&session)).await {
        Ok(Ok(value)) => Json(value).into_response(),
        Ok(Err(e)) => {
            trace!("Panel request failed: {e}");
            e.into_response()
        }
        Err(e) => {
            error!("Panel worker task failed: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "internal error" })),
            )
                .into_response()
        }
    }
}

async fn root_handler() -> impl IntoResponse {
    Html(include_str!("web/panel.html"))
}

async fn adapters_handler(State(session): State<SharedSession>) -> Response {
    blocking(session, |s| s.adapters()).await
}

async fn connect_handler(
    State(session): State<SharedSession>,
    body: Option<Json<ConnectRequest>>,
) -> Response {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    blocking(session, move |s| s.connect(request.adapter, request.cycle_ms)).await
}

async fn disconnect_handler(State(session): State<SharedSession>) -> Response {
    blocking(session, |s| {
        s.disconnect();
        Ok(json!({ "ok": true, "state": "IDLE" }))
    })
    .await
}

async fn status_handler(State(session): State<SharedSession>) -> Response {
    blocking(session, |s| Ok(s.status())).await
}

async fn discover_handler(
    State(session): State<SharedSession>,
    Query(query): Query<DiscoverQuery>,
) -> Response {
    blocking(session, move |s| {
        let adapter = query.adapter.clone();
        s.discover(query.adapter)
            .map(|slaves| json!({ "slaves": slaves, "adapter": adapter }))
    })
    .await
}

async fn latency_handler(
    State(session): State<SharedSession>,
    body: Option<Json<LatencyRequest>>,
) -> Response {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    blocking(session, move |s| {
        s.run_latency_probe(request.slave, request.samples)
    })
    .await
}

async fn get_pdo_handler(State(session): State<SharedSession>) -> Response {
    blocking(session, |s| s.pdo_document()).await
}

async fn post_pdo_handler(
    State(session): State<SharedSession>,
    Json(update): Json<MasterDocument>,
) -> Response {
    blocking(session, move |s| {
        s.update_pdo_document(update).map(|()| json!({ "ok": true }))
    })
    .await
}
