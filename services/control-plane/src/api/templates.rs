//! Template API endpoints.
//!
//! Templates are immutable; posting an existing name creates a new version.

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};

use crate::api::error::ApiError;
use crate::api::request_context::RequestContext;
use crate::service::CreateTemplateRequest;
use crate::state::AppState;

/// Create template routes: /templates
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_templates).post(create_template))
        .route("/{template_id}", get(get_template))
}

async fn create_template(
    State(state): State<AppState>,
    ctx: RequestContext,
    body: Result<Json<CreateTemplateRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(req) = body.map_err(|e| ApiError::json_rejection(e, &ctx.request_id))?;
    let template = state
        .service()
        .create_template(req)
        .await
        .map_err(|e| ApiError::service(e, &ctx.request_id))?;
    Ok((StatusCode::CREATED, Json(template)))
}

async fn list_templates(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.service().list_templates().await)
}

async fn get_template(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(template_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let template = state
        .service()
        .get_template(&template_id)
        .await
        .map_err(|e| ApiError::service(e, &ctx.request_id))?;
    Ok(Json(template))
}
