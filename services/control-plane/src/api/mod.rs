//! HTTP API handlers and routing.

mod clusters;
mod deployments;
pub mod error;
mod health;
mod operations;
pub mod request_context;
mod templates;

use axum::{
    http::{header, HeaderName, Method},
    Router,
};
use serde::Deserialize;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    request_id::{PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};

use request_context::MakePortalRequestId;

use crate::state::AppState;

/// `?window=` on metric range queries.
#[derive(Debug, Default, Deserialize)]
struct WindowQuery {
    window: Option<String>,
}

/// Create the main API router with all routes and middleware.
pub fn create_router(state: AppState) -> Router {
    // CORS configuration
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::PATCH, Method::DELETE])
        .allow_headers([
            header::CONTENT_TYPE,
            HeaderName::from_static(request_context::REQUEST_ID_HEADER),
        ])
        .expose_headers([HeaderName::from_static(request_context::REQUEST_ID_HEADER)])
        .allow_origin(Any);

    Router::new()
        // Health endpoints
        .merge(health::routes())
        .nest("/clusters", clusters::routes())
        .nest("/deployments", deployments::routes())
        .nest("/templates", templates::routes())
        .nest("/operations", operations::routes())
        // Middleware: request ids are assigned before tracing sees the request
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(MakePortalRequestId))
                .layer(TraceLayer::new_for_http())
                .layer(PropagateRequestIdLayer::x_request_id()),
        )
        .layer(cors)
        // Application state
        .with_state(state)
}
