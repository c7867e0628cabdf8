//! HTTP/JSON control surface.
//!
//! Callers reaching this API are trusted; authorization is handled in
//! front of it.

pub mod error;
pub mod routes;

pub use error::{ApiError, ErrorResponse};

use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::orchestrator::Orchestrator;

/// Application state shared across all routes.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Orchestrator,
}

impl AppState {
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self { orchestrator }
    }
}

/// Create the router with all routes.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .merge(routes::health::routes())
        .merge(routes::migration::routes())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
