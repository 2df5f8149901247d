//! Route table.
//!
//! ```text
//! POST /api/workspaces/{workspace_id}/mutations   submit one mutation
//! GET  /api/workspaces/{workspace_id}/delta       incremental pull
//! GET  /api/workspaces/{workspace_id}/events      SSE change stream
//! GET  /health                                    liveness probe
//! ```

use crate::backend::realtime::subscription::change_events;
use crate::backend::server::state::AppState;
use crate::backend::sync::handlers::{health, pull_delta, submit_mutation};
use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

/// Assemble the full router over the shared state
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route(
            "/api/workspaces/{workspace_id}/mutations",
            post(submit_mutation),
        )
        .route("/api/workspaces/{workspace_id}/delta", get(pull_delta))
        .route("/api/workspaces/{workspace_id}/events", get(change_events))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
