//! Public routes that don't require authentication

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;
use std::sync::Arc;

use crate::monitor::WatcherRegistry;
use crate::websocket::ConnectionHub;

#[derive(Clone)]
pub struct PublicState {
    pub watchers: Arc<WatcherRegistry>,
    pub hub: Arc<ConnectionHub>,
}

/// Liveness plus a rough picture of what the relay is serving.
#[derive(Debug, Serialize)]
struct PingResponse {
    status: &'static str,
    version: &'static str,
    environments: usize,
    clients: usize,
    progress_channels: usize,
}

pub fn public_router(watchers: Arc<WatcherRegistry>, hub: Arc<ConnectionHub>) -> Router {
    Router::new()
        .route("/api/public/ping", get(ping))
        .with_state(PublicState { watchers, hub })
}

async fn ping(State(state): State<PublicState>) -> Json<PingResponse> {
    Json(PingResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        environments: state.watchers.len(),
        clients: state.hub.total(),
        progress_channels: state.hub.progress().len(),
    })
}
