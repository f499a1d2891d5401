//! In-memory resource tables.
//!
//! The store owns clusters, deployments, and templates. Every record is
//! replaced under a single write lock, so readers always see whole records.
//! Lists hand out clones, never references into the tables.

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use portal_id::{ClusterId, DeploymentId, TemplateId};
use tokio::sync::RwLock;

use crate::model::{
    Cluster, Deployment, ResourceRef, ResourceType, Template, CLUSTER_METRICS, DEPLOYMENT_METRICS,
};

#[derive(Default)]
struct Tables {
    clusters: HashMap<ClusterId, Cluster>,
    deployments: HashMap<DeploymentId, Deployment>,
    templates: HashMap<TemplateId, Template>,
}

/// A resource the metrics aggregator should sample.
#[derive(Debug, Clone)]
pub struct MetricTarget {
    pub resource: ResourceRef,
    pub metrics: &'static [&'static str],
}

#[derive(Default)]
pub struct ResourceStore {
    inner: RwLock<Tables>,
}

impl ResourceStore {
    pub fn new() -> Self {
        Self::default()
    }

    // =========================================================================
    // Clusters
    // =========================================================================

    pub async fn insert_cluster(&self, cluster: Cluster) {
        self.inner.write().await.clusters.insert(cluster.id, cluster);
    }

    pub async fn cluster(&self, id: ClusterId) -> Option<Cluster> {
        self.inner.read().await.clusters.get(&id).cloned()
    }

    /// Find the live (not deleted) cluster carrying `name`.
    pub async fn cluster_by_name(&self, name: &str) -> Option<Cluster> {
        self.inner
            .read()
            .await
            .clusters
            .values()
            .find(|c| c.name == name && !c.status.is_deleted())
            .cloned()
    }

    /// The most recently created cluster that carried `name`, tombstones included.
    pub async fn latest_cluster_by_name(&self, name: &str) -> Option<Cluster> {
        self.inner
            .read()
            .await
            .clusters
            .values()
            .filter(|c| c.name == name)
            .max_by_key(|c| (c.created_at, c.id))
            .cloned()
    }

    /// Live clusters, oldest first.
    pub async fn list_clusters(&self) -> Vec<Cluster> {
        let tables = self.inner.read().await;
        let mut clusters: Vec<_> = tables
            .clusters
            .values()
            .filter(|c| !c.status.is_deleted())
            .cloned()
            .collect();
        clusters.sort_by_key(|c| c.id);
        clusters
    }

    /// Apply `f` to a cluster, stamping `updated_at`.
    pub async fn update_cluster<F>(&self, id: ClusterId, f: F) -> Option<Cluster>
    where
        F: FnOnce(&mut Cluster),
    {
        let mut tables = self.inner.write().await;
        let cluster = tables.clusters.get_mut(&id)?;
        f(cluster);
        cluster.updated_at = Utc::now();
        Some(cluster.clone())
    }

    /// Apply `f` only if the cluster is still at `generation`.
    pub async fn update_cluster_if<F>(&self, id: ClusterId, generation: u64, f: F) -> bool
    where
        F: FnOnce(&mut Cluster),
    {
        let mut tables = self.inner.write().await;
        match tables.clusters.get_mut(&id) {
            Some(cluster) if cluster.generation == generation => {
                f(cluster);
                cluster.updated_at = Utc::now();
                true
            }
            _ => false,
        }
    }

    // =========================================================================
    // Deployments
    // =========================================================================

    pub async fn insert_deployment(&self, deployment: Deployment) {
        self.inner
            .write()
            .await
            .deployments
            .insert(deployment.id, deployment);
    }

    pub async fn deployment(&self, id: DeploymentId) -> Option<Deployment> {
        self.inner.read().await.deployments.get(&id).cloned()
    }

    /// Find the live deployment occupying `(cluster, namespace, name)`.
    pub async fn deployment_by_key(
        &self,
        cluster_id: ClusterId,
        namespace: &str,
        name: &str,
    ) -> Option<Deployment> {
        self.inner
            .read()
            .await
            .deployments
            .values()
            .find(|d| {
                d.cluster_id == cluster_id
                    && d.namespace == namespace
                    && d.name == name
                    && !d.status.is_deleted()
            })
            .cloned()
    }

    /// Live deployments, optionally restricted to one cluster, oldest first.
    pub async fn list_deployments(&self, cluster_id: Option<ClusterId>) -> Vec<Deployment> {
        let tables = self.inner.read().await;
        let mut deployments: Vec<_> = tables
            .deployments
            .values()
            .filter(|d| !d.status.is_deleted())
            .filter(|d| cluster_id.is_none_or(|c| d.cluster_id == c))
            .cloned()
            .collect();
        deployments.sort_by_key(|d| d.id);
        deployments
    }

    pub async fn update_deployment<F>(&self, id: DeploymentId, f: F) -> Option<Deployment>
    where
        F: FnOnce(&mut Deployment),
    {
        let mut tables = self.inner.write().await;
        let deployment = tables.deployments.get_mut(&id)?;
        f(deployment);
        deployment.updated_at = Utc::now();
        Some(deployment.clone())
    }

    pub async fn update_deployment_if<F>(&self, id: DeploymentId, generation: u64, f: F) -> bool
    where
        F: FnOnce(&mut Deployment),
    {
        let mut tables = self.inner.write().await;
        match tables.deployments.get_mut(&id) {
            Some(deployment) if deployment.generation == generation => {
                f(deployment);
                deployment.updated_at = Utc::now();
                true
            }
            _ => false,
        }
    }

    // =========================================================================
    // Templates
    // =========================================================================

    pub async fn insert_template(&self, template: Template) {
        self.inner
            .write()
            .await
            .templates
            .insert(template.id, template);
    }

    pub async fn template(&self, id: TemplateId) -> Option<Template> {
        self.inner.read().await.templates.get(&id).cloned()
    }

    /// Highest version of the template family called `name`.
    pub async fn latest_template(&self, name: &str) -> Option<Template> {
        self.inner
            .read()
            .await
            .templates
            .values()
            .filter(|t| t.name == name)
            .max_by_key(|t| t.version)
            .cloned()
    }

    pub async fn list_templates(&self) -> Vec<Template> {
        let tables = self.inner.read().await;
        let mut templates: Vec<_> = tables.templates.values().cloned().collect();
        templates.sort_by(|a, b| a.name.cmp(&b.name).then(a.version.cmp(&b.version)));
        templates
    }

    // =========================================================================
    // Metrics support
    // =========================================================================

    /// Whether `resource_id` names a live cluster or deployment.
    pub async fn is_live_resource(&self, resource_id: &str) -> bool {
        let tables = self.inner.read().await;
        if let Ok(id) = ClusterId::parse(resource_id) {
            return tables
                .clusters
                .get(&id)
                .is_some_and(|c| !c.status.is_deleted());
        }
        if let Ok(id) = DeploymentId::parse(resource_id) {
            return tables
                .deployments
                .get(&id)
                .is_some_and(|d| !d.status.is_deleted());
        }
        false
    }

    /// Every live cluster and deployment with the metrics sampled for it.
    pub async fn metric_targets(&self) -> Vec<MetricTarget> {
        let tables = self.inner.read().await;
        let clusters = tables
            .clusters
            .values()
            .filter(|c| !c.status.is_deleted())
            .map(|c| MetricTarget {
                resource: ResourceRef::cluster(c.id),
                metrics: CLUSTER_METRICS,
            });
        let deployments = tables
            .deployments
            .values()
            .filter(|d| !d.status.is_deleted())
            .map(|d| MetricTarget {
                resource: ResourceRef::deployment(d.id),
                metrics: DEPLOYMENT_METRICS,
            });

        let mut targets: Vec<_> = clusters.chain(deployments).collect();
        targets.sort_by(|a, b| a.resource.cmp(&b.resource));
        targets
    }

    /// Drop deleted clusters and deployments whose ids are not in `referenced`.
    pub async fn prune_tombstones(&self, referenced: &HashSet<String>) -> usize {
        let mut tables = self.inner.write().await;
        let before = tables.clusters.len() + tables.deployments.len();
        tables
            .clusters
            .retain(|id, c| !c.status.is_deleted() || referenced.contains(&id.to_string()));
        tables
            .deployments
            .retain(|id, d| !d.status.is_deleted() || referenced.contains(&id.to_string()));
        before - (tables.clusters.len() + tables.deployments.len())
    }

    /// Counts of live resources by type, for readiness reporting.
    pub async fn counts(&self) -> HashMap<ResourceType, usize> {
        let tables = self.inner.read().await;
        HashMap::from([
            (
                ResourceType::Cluster,
                tables
                    .clusters
                    .values()
                    .filter(|c| !c.status.is_deleted())
                    .count(),
            ),
            (
                ResourceType::Deployment,
                tables
                    .deployments
                    .values()
                    .filter(|d| !d.status.is_deleted())
                    .count(),
            ),
        ])
    }
}
