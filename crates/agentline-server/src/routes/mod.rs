//! API routes

use axum::Router;

use crate::AppState;

mod query;
mod stats;

/// Build the API router with all endpoints
pub fn api_router() -> Router<AppState> {
    Router::new()
        .nest("/query", query::router())
        .nest("/stats", stats::router())
}
