//! Cluster API endpoints.
//!
//! Cluster paths accept either the cluster id or its name.

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Path, Query, State,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};

use super::WindowQuery;
use crate::api::error::ApiError;
use crate::api::request_context::RequestContext;
use crate::service::CreateClusterRequest;
use crate::state::AppState;

/// Create cluster routes: /clusters
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_clusters).post(create_cluster))
        .route("/{cluster}", get(get_cluster).delete(delete_cluster))
        .route("/{cluster}/metrics", get(cluster_metrics))
}

async fn create_cluster(
    State(state): State<AppState>,
    ctx: RequestContext,
    body: Result<Json<CreateClusterRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(req) = body.map_err(|e| ApiError::json_rejection(e, &ctx.request_id))?;
    let accepted = state
        .service()
        .create_cluster(req)
        .await
        .map_err(|e| ApiError::service(e, &ctx.request_id))?;
    Ok((StatusCode::ACCEPTED, Json(accepted)))
}

async fn list_clusters(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.service().list_clusters().await)
}

async fn get_cluster(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(cluster): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let detail = state
        .service()
        .get_cluster(&cluster)
        .await
        .map_err(|e| ApiError::service(e, &ctx.request_id))?;
    Ok(Json(detail))
}

async fn delete_cluster(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(cluster): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let accepted = state
        .service()
        .delete_cluster(&cluster)
        .await
        .map_err(|e| ApiError::service(e, &ctx.request_id))?;
    Ok((StatusCode::ACCEPTED, Json(accepted)))
}

async fn cluster_metrics(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(cluster): Path<String>,
    query: Result<Query<WindowQuery>, QueryRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Query(query) = query.map_err(|e| ApiError::query_rejection(e, &ctx.request_id))?;
    let samples = state
        .service()
        .cluster_metrics(&cluster, query.window.as_deref())
        .await
        .map_err(|e| ApiError::service(e, &ctx.request_id))?;
    Ok(Json(samples))
}
