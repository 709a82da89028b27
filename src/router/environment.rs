//! Environment routes: connectivity status and re-watching.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{delete, get, post},
    Router,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::docker::{Environment, EnvironmentStatus};
use crate::monitor::{StatusBoard, WatcherRegistry, WatcherState};

#[derive(Clone)]
pub struct EnvironmentState {
    pub watchers: Arc<WatcherRegistry>,
    pub status: Arc<StatusBoard>,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Serialize)]
struct EnvironmentSummary {
    name: String,
    address: String,
    default: bool,
    state: Option<WatcherState>,
    status: Option<EnvironmentStatus>,
}

#[derive(Serialize)]
struct JoinResponse {
    name: String,
    watching: bool,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
}

pub fn environment_router(watchers: Arc<WatcherRegistry>, status: Arc<StatusBoard>) -> Router {
    let state = EnvironmentState { watchers, status };

    Router::new()
        .route("/api/environments", get(list_environments))
        .route("/api/environments", post(join_environment))
        .route("/api/environments/status", get(get_status))
        .route("/api/environments/:name", delete(leave_environment))
        .with_state(state)
}

async fn list_environments(State(state): State<EnvironmentState>) -> Json<Vec<EnvironmentSummary>> {
    let summaries = state
        .watchers
        .names()
        .into_iter()
        .filter_map(|name| {
            let env = state.watchers.environment(&name)?;
            Some(EnvironmentSummary {
                state: state.watchers.state(&name),
                status: state.status.get(&name),
                name,
                address: env.address,
                default: env.default,
            })
        })
        .collect();
    Json(summaries)
}

async fn get_status(State(state): State<EnvironmentState>) -> Json<BTreeMap<String, EnvironmentStatus>> {
    Json(state.status.snapshot())
}

/// Watch an environment, replacing any watcher running under the same name.
async fn join_environment(
    State(state): State<EnvironmentState>,
    Json(env): Json<Environment>,
) -> Result<Json<JoinResponse>, ApiError> {
    if env.name.trim().is_empty() {
        return Err(error(StatusCode::BAD_REQUEST, "environment name is required"));
    }
    if let Err(e) = env.endpoint() {
        return Err(error(StatusCode::BAD_REQUEST, e));
    }

    let name = env.name.clone();
    state.status.remove(&name);
    let watching = state.watchers.replace(env).await;
    if !watching {
        return Err(error(StatusCode::SERVICE_UNAVAILABLE, "shutting down"));
    }
    Ok(Json(JoinResponse { name, watching }))
}

async fn leave_environment(
    State(state): State<EnvironmentState>,
    Path(name): Path<String>,
) -> Result<StatusCode, ApiError> {
    if !state.watchers.leave(&name).await {
        return Err(error(StatusCode::NOT_FOUND, format!("environment {} is not watched", name)));
    }
    state.status.remove(&name);
    Ok(StatusCode::NO_CONTENT)
}
