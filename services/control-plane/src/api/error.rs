use axum::{
    extract::rejection::{JsonRejection, QueryRejection},
    http::{header::CONTENT_TYPE, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::service::ServiceError;

/// RFC 7807 problem document.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
#[serde(rename_all = "camelCase")]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub r#type: String,
    pub title: String,
    pub status: u16,
    pub detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    pub code: String,
    pub request_id: String,
    pub retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Vec<FieldError>>,
}

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl ProblemDetails {
    fn new(status: StatusCode, code: impl Into<String>, detail: impl Into<String>) -> Self {
        let code = code.into();
        let title = status
            .canonical_reason()
            .unwrap_or("Unknown Error")
            .to_string();
        Self {
            r#type: format!("/problems/{code}"),
            title,
            status: status.as_u16(),
            detail: detail.into(),
            instance: None,
            code,
            request_id: "unknown".to_string(),
            retryable: false,
            details: None,
        }
    }

    fn set_request_id(&mut self, request_id: impl Into<String>) {
        let request_id = request_id.into();
        self.request_id = request_id.clone();
        if self.instance.is_none() {
            self.instance = Some(request_id);
        }
    }
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub problem: Box<ProblemDetails>,
}

impl ApiError {
    fn with_status(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        let problem = Box::new(ProblemDetails::new(status, code, message));
        Self { status, problem }
    }

    pub fn bad_request(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::BAD_REQUEST, code, message)
    }

    pub fn not_found(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::NOT_FOUND, code, message)
    }

    pub fn conflict(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::CONFLICT, code, message)
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.problem.set_request_id(request_id);
        self
    }

    pub fn with_details(mut self, details: Vec<FieldError>) -> Self {
        self.problem.details = Some(details);
        self
    }

    pub fn retryable(mut self) -> Self {
        self.problem.retryable = true;
        self
    }

    /// Map a service error to its HTTP problem.
    pub fn service(err: ServiceError, request_id: &str) -> Self {
        let message = err.to_string();
        let error = match err {
            ServiceError::Validation { field, message: reason } => {
                Self::bad_request("validation_error", message).with_details(vec![FieldError {
                    field,
                    message: reason,
                }])
            }
            ServiceError::Precondition { missing: true, .. } => {
                Self::not_found("precondition_failed", message)
            }
            ServiceError::Precondition { missing: false, .. } => {
                Self::conflict("precondition_failed", message)
            }
            ServiceError::Conflict(_) => Self::conflict("conflict", message).retryable(),
            ServiceError::NotFound(_) => Self::not_found("not_found", message),
        };
        error.with_request_id(request_id)
    }

    pub fn json_rejection(rejection: JsonRejection, request_id: &str) -> Self {
        Self::bad_request("invalid_body", rejection.body_text()).with_request_id(request_id)
    }

    pub fn query_rejection(rejection: QueryRejection, request_id: &str) -> Self {
        Self::bad_request("invalid_query", rejection.body_text()).with_request_id(request_id)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut response = (self.status, Json(self.problem)).into_response();
        response.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/problem+json"),
        );
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_error_mapping() {
        let cases = [
            (
                ServiceError::Validation {
                    field: "nodeCount".to_string(),
                    message: "must be positive".to_string(),
                },
                StatusCode::BAD_REQUEST,
            ),
            (
                ServiceError::Precondition {
                    message: "template missing".to_string(),
                    missing: true,
                },
                StatusCode::NOT_FOUND,
            ),
            (
                ServiceError::Precondition {
                    message: "cluster not ready".to_string(),
                    missing: false,
                },
                StatusCode::CONFLICT,
            ),
            (ServiceError::Conflict("busy".to_string()), StatusCode::CONFLICT),
            (ServiceError::NotFound("gone".to_string()), StatusCode::NOT_FOUND),
        ];

        for (err, status) in cases {
            let api = ApiError::service(err, "req_test");
            assert_eq!(api.status, status);
            assert_eq!(api.problem.request_id, "req_test");
        }
    }

    #[test]
    fn test_conflict_is_retryable_and_validation_has_details() {
        let conflict = ApiError::service(ServiceError::Conflict("busy".to_string()), "r");
        assert!(conflict.problem.retryable);

        let validation = ApiError::service(
            ServiceError::Validation {
                field: "replicas".to_string(),
                message: "must be positive".to_string(),
            },
            "r",
        );
        let details = validation.problem.details.unwrap();
        assert_eq!(details[0].field, "replicas");
    }

    #[test]
    fn test_problem_is_camel_case() {
        let api = ApiError::not_found("not_found", "nope").with_request_id("req_1");
        let json = serde_json::to_value(&api.problem).unwrap();
        assert_eq!(json["requestId"], "req_1");
        assert_eq!(json["type"], "/problems/not_found");
        assert_eq!(
            api.into_response().headers()[CONTENT_TYPE],
            "application/problem+json"
        );
    }
}
