//! Audit trail of normalized daemon events.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::Json,
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::audit::SledAuditStore;
use crate::events::NormalizedEvent;

const DEFAULT_LIMIT: usize = 50;
const MAX_LIMIT: usize = 500;

#[derive(Clone)]
pub struct EventsState {
    pub store: Arc<SledAuditStore>,
}

#[derive(Deserialize)]
struct EventsQuery {
    limit: Option<usize>,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

pub fn events_router(store: Arc<SledAuditStore>) -> Router {
    let state = EventsState { store };

    Router::new()
        .route("/api/events", get(recent_events))
        .with_state(state)
}

async fn recent_events(
    State(state): State<EventsState>,
    Query(query): Query<EventsQuery>,
) -> Result<Json<Vec<NormalizedEvent>>, (StatusCode, Json<ErrorResponse>)> {
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
    match state.store.recent(limit) {
        Ok(events) => Ok(Json(events)),
        Err(e) => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: e.to_string(),
            }),
        )),
    }
}
