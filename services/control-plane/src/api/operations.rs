//! Operation API endpoints: the polling contract for every async mutation.

use axum::{
    extract::{rejection::QueryRejection, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;

use crate::api::error::ApiError;
use crate::api::request_context::RequestContext;
use crate::state::AppState;

/// Create operation routes: /operations
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_operations))
        .route("/{operation_id}", get(get_operation))
        .route("/{operation_id}/retry", post(retry_operation))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListOperationsQuery {
    resource_id: Option<String>,
}

async fn list_operations(
    State(state): State<AppState>,
    ctx: RequestContext,
    query: Result<Query<ListOperationsQuery>, QueryRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Query(query) = query.map_err(|e| ApiError::query_rejection(e, &ctx.request_id))?;
    Ok(Json(
        state
            .service()
            .list_operations(query.resource_id.as_deref())
            .await,
    ))
}

async fn get_operation(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(operation_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let operation = state
        .service()
        .get_operation(&operation_id)
        .await
        .map_err(|e| ApiError::service(e, &ctx.request_id))?;
    Ok(Json(operation))
}

async fn retry_operation(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(operation_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let accepted = state
        .service()
        .retry_operation(&operation_id)
        .await
        .map_err(|e| ApiError::service(e, &ctx.request_id))?;
    Ok((StatusCode::ACCEPTED, Json(accepted)))
}
