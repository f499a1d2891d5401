//! HTTP client for an external cluster-provisioning API.

use std::time::Duration;

use async_trait::async_trait;
use portal_id::{ClusterId, DeploymentId};
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, error};

use super::{
    AdapterError, AdapterResult, ClusterOps, ClusterRequest, MetricPoint, MetricsOps,
    ObservedCluster, ObservedWorkload, WorkloadOps, WorkloadSpec,
};

/// Provider client speaking JSON over HTTP.
pub struct HttpResourceClient {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MetricsResponse {
    points: Vec<MetricPoint>,
}

impl HttpResourceClient {
    /// Create a client for `base_url`, optionally authenticating with a bearer token.
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> AdapterResult<Self> {
        // The adapter handle applies the per-call bound; this only guards
        // against connections that never make progress.
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| AdapterError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        debug!(%method, url = %url, "Provider request");
        let builder = self.client.request(method, url);
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send(&self, builder: reqwest::RequestBuilder) -> AdapterResult<reqwest::Response> {
        let response = builder
            .send()
            .await
            .map_err(|e| AdapterError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        error!(status = %status, body = %body, "Provider request failed");
        Err(classify_status(status, body))
    }

    async fn json<T: serde::de::DeserializeOwned>(
        &self,
        builder: reqwest::RequestBuilder,
    ) -> AdapterResult<T> {
        self.send(builder)
            .await?
            .json::<T>()
            .await
            .map_err(|e| AdapterError::Transport(format!("invalid provider response: {e}")))
    }
}

fn classify_status(status: StatusCode, body: String) -> AdapterError {
    let detail = if body.is_empty() {
        status.to_string()
    } else {
        format!("{status}: {body}")
    };

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => AdapterError::Auth(detail),
        StatusCode::NOT_FOUND => AdapterError::NotFound(detail),
        StatusCode::BAD_REQUEST | StatusCode::CONFLICT | StatusCode::UNPROCESSABLE_ENTITY => {
            AdapterError::Rejected(detail)
        }
        _ => AdapterError::Unavailable(detail),
    }
}

#[async_trait]
impl ClusterOps for HttpResourceClient {
    async fn create_cluster(&self, request: &ClusterRequest) -> AdapterResult<()> {
        self.send(self.request(reqwest::Method::POST, "/clusters").json(request))
            .await
            .map(|_| ())
    }

    async fn get_cluster_status(&self, id: ClusterId) -> AdapterResult<ObservedCluster> {
        self.json(self.request(reqwest::Method::GET, &format!("/clusters/{id}")))
            .await
    }

    async fn delete_cluster(&self, id: ClusterId) -> AdapterResult<()> {
        self.send(self.request(reqwest::Method::DELETE, &format!("/clusters/{id}")))
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl WorkloadOps for HttpResourceClient {
    async fn apply_workload(&self, spec: &WorkloadSpec) -> AdapterResult<()> {
        let path = format!("/clusters/{}/workloads/{}", spec.cluster_id, spec.deployment_id);
        self.send(self.request(reqwest::Method::PUT, &path).json(spec))
            .await
            .map(|_| ())
    }

    async fn get_workload_status(
        &self,
        cluster_id: ClusterId,
        deployment_id: DeploymentId,
    ) -> AdapterResult<ObservedWorkload> {
        let path = format!("/clusters/{cluster_id}/workloads/{deployment_id}");
        self.json(self.request(reqwest::Method::GET, &path)).await
    }

    async fn delete_workload(
        &self,
        cluster_id: ClusterId,
        deployment_id: DeploymentId,
    ) -> AdapterResult<()> {
        let path = format!("/clusters/{cluster_id}/workloads/{deployment_id}");
        self.send(self.request(reqwest::Method::DELETE, &path))
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl MetricsOps for HttpResourceClient {
    async fn query_metrics(
        &self,
        resource_id: &str,
        metric: &str,
        window: Duration,
    ) -> AdapterResult<Vec<MetricPoint>> {
        let window_secs = window.as_secs().to_string();
        let builder = self.request(reqwest::Method::GET, "/metrics").query(&[
            ("resource", resource_id),
            ("metric", metric),
            ("windowSecs", window_secs.as_str()),
        ]);
        let response: MetricsResponse = self.json(builder).await?;
        Ok(response.points)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::ClusterPhase;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_get_cluster_status_parses_body() {
        let server = MockServer::start().await;
        let id = ClusterId::new();

        Mock::given(method("GET"))
            .and(path(format!("/clusters/{id}")))
            .and(header("authorization", "Bearer secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "phase": "Ready",
                "nodeCount": 3
            })))
            .mount(&server)
            .await;

        let client = HttpResourceClient::new(server.uri(), Some("secret".to_string())).unwrap();
        let observed = client.get_cluster_status(id).await.unwrap();
        assert_eq!(observed.phase, ClusterPhase::Ready);
        assert_eq!(observed.node_count, 3);
    }

    #[tokio::test]
    async fn test_status_codes_map_to_error_kinds() {
        let server = MockServer::start().await;
        let client = HttpResourceClient::new(server.uri(), None).unwrap();

        let unauthorized = ClusterId::new();
        let missing = ClusterId::new();
        let flaky = ClusterId::new();

        Mock::given(method("DELETE"))
            .and(path(format!("/clusters/{unauthorized}")))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path(format!("/clusters/{missing}")))
            .respond_with(ResponseTemplate::new(404).set_body_string("no such cluster"))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path(format!("/clusters/{flaky}")))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = client.delete_cluster(unauthorized).await.unwrap_err();
        assert!(matches!(err, AdapterError::Auth(_)));
        assert!(!err.is_retryable());

        let err = client.delete_cluster(missing).await.unwrap_err();
        assert!(err.is_not_found());

        let err = client.delete_cluster(flaky).await.unwrap_err();
        assert!(matches!(err, AdapterError::Unavailable(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_query_metrics_sends_window() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/metrics"))
            .and(query_param("resource", "cls_x"))
            .and(query_param("metric", "cpu_usage"))
            .and(query_param("windowSecs", "30"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "points": [
                    {"timestamp": "2026-01-01T00:00:00Z", "value": 0.25},
                    {"timestamp": "2026-01-01T00:00:30Z", "value": 0.5}
                ]
            })))
            .mount(&server)
            .await;

        let client = HttpResourceClient::new(server.uri(), None).unwrap();
        let points = client
            .query_metrics("cls_x", "cpu_usage", Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(points.len(), 2);
        assert_eq!(points[1].value, 0.5);
    }

    #[tokio::test]
    async fn test_connection_refused_is_transport() {
        let client = HttpResourceClient::new("http://127.0.0.1:1", None).unwrap();
        let err = client.get_cluster_status(ClusterId::new()).await.unwrap_err();
        assert!(matches!(err, AdapterError::Transport(_)));
    }
}
