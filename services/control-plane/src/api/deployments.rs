//! Deployment API endpoints.

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
use serde::Deserialize;

use super::WindowQuery;
use crate::api::error::ApiError;
use crate::api::request_context::RequestContext;
use crate::service::{CreateDeploymentRequest, DeploymentPatch};
use crate::state::AppState;

/// Create deployment routes: /deployments
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_deployments).post(create_deployment))
        .route(
            "/{deployment_id}",
            get(get_deployment)
                .put(update_deployment)
                .patch(update_deployment)
                .delete(delete_deployment),
        )
        .route("/{deployment_id}/metrics", get(deployment_metrics))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListDeploymentsQuery {
    cluster_id: Option<String>,
}

async fn create_deployment(
    State(state): State<AppState>,
    ctx: RequestContext,
    body: Result<Json<CreateDeploymentRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(req) = body.map_err(|e| ApiError::json_rejection(e, &ctx.request_id))?;
    let accepted = state
        .service()
        .create_deployment(req)
        .await
        .map_err(|e| ApiError::service(e, &ctx.request_id))?;
    Ok((StatusCode::ACCEPTED, Json(accepted)))
}

async fn list_deployments(
    State(state): State<AppState>,
    ctx: RequestContext,
    query: Result<Query<ListDeploymentsQuery>, QueryRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Query(query) = query.map_err(|e| ApiError::query_rejection(e, &ctx.request_id))?;
    let deployments = state
        .service()
        .list_deployments(query.cluster_id.as_deref())
        .await
        .map_err(|e| ApiError::service(e, &ctx.request_id))?;
    Ok(Json(deployments))
}

async fn get_deployment(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(deployment_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let deployment = state
        .service()
        .get_deployment(&deployment_id)
        .await
        .map_err(|e| ApiError::service(e, &ctx.request_id))?;
    Ok(Json(deployment))
}

async fn update_deployment(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(deployment_id): Path<String>,
    body: Result<Json<serde_json::Value>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(body) = body.map_err(|e| ApiError::json_rejection(e, &ctx.request_id))?;
    let patch =
        DeploymentPatch::from_json(body).map_err(|e| ApiError::service(e, &ctx.request_id))?;
    let accepted = state
        .service()
        .update_deployment(&deployment_id, patch)
        .await
        .map_err(|e| ApiError::service(e, &ctx.request_id))?;
    Ok((StatusCode::ACCEPTED, Json(accepted)))
}

async fn delete_deployment(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(deployment_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let accepted = state
        .service()
        .delete_deployment(&deployment_id)
        .await
        .map_err(|e| ApiError::service(e, &ctx.request_id))?;
    Ok((StatusCode::ACCEPTED, Json(accepted)))
}

async fn deployment_metrics(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(deployment_id): Path<String>,
    query: Result<Query<WindowQuery>, QueryRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Query(query) = query.map_err(|e| ApiError::query_rejection(e, &ctx.request_id))?;
    let samples = state
        .service()
        .deployment_metrics(&deployment_id, query.window.as_deref())
        .await
        .map_err(|e| ApiError::service(e, &ctx.request_id))?;
    Ok(Json(samples))
}
