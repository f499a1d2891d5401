//! Shared harness for control-plane integration tests.
//!
//! Wires the orchestration service, reconciler, and metrics aggregator to an
//! in-process simulated provider. Background workers are not spawned; tests
//! drive ticks explicitly so every assertion sees a deterministic state.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use portal_control_plane::{
    adapter::{Adapter, SimulatedClient},
    metrics::{MetricsStore, MetricsWorker},
    model::{Operation, OperationStatus},
    operations::OperationTracker,
    reconciler::Reconciler,
    service::{
        CreateClusterRequest, CreateDeploymentRequest, CreateTemplateRequest,
        OrchestrationService,
    },
    state::Heartbeat,
    store::ResourceStore,
};
use portal_reconcile::{AttemptBudget, BackoffPolicy};

#[derive(Debug, Clone)]
pub struct HarnessOptions {
    pub max_attempts: u32,
    pub ring_capacity: usize,
    pub polls_to_ready: u32,
    pub adapter_timeout: Duration,
    pub lock_wait: Duration,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            ring_capacity: 120,
            polls_to_ready: 1,
            adapter_timeout: Duration::from_secs(2),
            lock_wait: Duration::from_millis(500),
        }
    }
}

pub struct Harness {
    pub sim: Arc<SimulatedClient>,
    pub resources: Arc<ResourceStore>,
    pub tracker: Arc<OperationTracker>,
    pub metrics: Arc<MetricsStore>,
    pub service: Arc<OrchestrationService>,
    pub reconciler: Reconciler,
    pub aggregator: MetricsWorker,
    pub reconcile_heartbeat: Arc<Heartbeat>,
    pub metrics_heartbeat: Arc<Heartbeat>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_options(HarnessOptions::default())
    }

    pub fn with_options(options: HarnessOptions) -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info,portal_control_plane=debug".into()),
            )
            .with_test_writer()
            .try_init();

        let sim = Arc::new(SimulatedClient::with_polls_to_ready(options.polls_to_ready));
        let adapter = Adapter::new(sim.clone(), options.adapter_timeout);

        let resources = Arc::new(ResourceStore::new());
        // Zero backoff: a failed attempt is due again on the next tick.
        let tracker = Arc::new(OperationTracker::new(
            AttemptBudget::new(options.max_attempts),
            BackoffPolicy::new(Duration::ZERO, Duration::ZERO),
        ));
        let metrics = Arc::new(MetricsStore::new(options.ring_capacity));

        let reconcile_heartbeat = Arc::new(Heartbeat::new());
        let metrics_heartbeat = Arc::new(Heartbeat::new());

        let reconciler = Reconciler::new(resources.clone(), tracker.clone(), adapter.clone());
        let aggregator = MetricsWorker::new(
            resources.clone(),
            metrics.clone(),
            adapter.clone(),
            Duration::from_secs(30),
            metrics_heartbeat.clone(),
        );
        let service = Arc::new(OrchestrationService::new(
            resources.clone(),
            tracker.clone(),
            metrics.clone(),
            adapter,
            options.lock_wait,
        ));

        Self {
            sim,
            resources,
            tracker,
            metrics,
            service,
            reconciler,
            aggregator,
            reconcile_heartbeat,
            metrics_heartbeat,
        }
    }

    /// Run reconciliation passes until `id` is terminal.
    pub async fn settle(&self, id: &str) -> Operation {
        for _ in 0..20 {
            let op = self.service.get_operation(id).await.unwrap();
            if op.status.is_terminal() {
                return op;
            }
            self.reconciler.reconcile_once().await;
        }
        panic!("operation {id} did not settle");
    }

    /// Create a cluster and drive it to Ready; returns its id.
    pub async fn ready_cluster(&self, name: &str) -> String {
        let accepted = self
            .service
            .create_cluster(cluster_request(name))
            .await
            .unwrap();
        let op = self.settle(&accepted.operation_id.to_string()).await;
        assert_eq!(op.status, OperationStatus::Succeeded);
        accepted.cluster_id.to_string()
    }

    pub async fn template(&self, name: &str) -> String {
        self.service
            .create_template(template_request(name))
            .await
            .unwrap()
            .id
            .to_string()
    }

    /// Create a deployment and drive it to Running; returns its id.
    pub async fn running_deployment(&self, cluster_id: &str, template_id: &str) -> String {
        let accepted = self
            .service
            .create_deployment(deployment_request(cluster_id, template_id, 2))
            .await
            .unwrap();
        let op = self.settle(&accepted.operation_id.to_string()).await;
        assert_eq!(op.status, OperationStatus::Succeeded);
        accepted.deployment_id.to_string()
    }
}

pub fn cluster_request(name: &str) -> CreateClusterRequest {
    CreateClusterRequest {
        name: name.to_string(),
        provider: "aws".to_string(),
        region: "us-west-2".to_string(),
        node_count: Some(3),
    }
}

pub fn template_request(name: &str) -> CreateTemplateRequest {
    serde_json::from_value(serde_json::json!({
        "name": name,
        "image": "nginx:1.27",
        "resources": {"cpu": "250m", "memory": "256Mi"},
        "parameters": [
            {"name": "logLevel", "default": "info"},
            {"name": "tag", "required": false}
        ]
    }))
    .unwrap()
}

pub fn deployment_request(
    cluster_id: &str,
    template_id: &str,
    replicas: i64,
) -> CreateDeploymentRequest {
    CreateDeploymentRequest {
        template_id: template_id.to_string(),
        cluster_id: cluster_id.to_string(),
        namespace: "web".to_string(),
        replicas: Some(replicas),
        ..Default::default()
    }
}
