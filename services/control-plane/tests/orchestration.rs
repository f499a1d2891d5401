//! Orchestration integration tests.
//!
//! Drives the service, reconciler, and metrics aggregator against the
//! simulated provider and checks operation and resource state transitions.

mod common;

use std::collections::BTreeMap;
use std::time::Duration;

use common::{cluster_request, deployment_request, Harness, HarnessOptions};
use portal_control_plane::{
    adapter::{calls, AdapterError, ClusterPhase},
    model::{
        ClusterStatus, DeploymentStatus, OperationErrorKind, OperationKind, OperationStatus,
    },
    service::{CreateClusterRequest, DeploymentPatch, ServiceError},
};
use portal_id::{ClusterId, DeploymentId, TemplateId};

fn unavailable() -> AdapterError {
    AdapterError::Unavailable("503 from provider".to_string())
}

// =============================================================================
// Clusters
// =============================================================================

#[tokio::test]
async fn cluster_create_converges_to_ready() {
    let h = Harness::new();

    let accepted = h
        .service
        .create_cluster(cluster_request("prod-1"))
        .await
        .unwrap();
    let op = h
        .service
        .get_operation(&accepted.operation_id.to_string())
        .await
        .unwrap();
    assert_eq!(op.status, OperationStatus::Pending);
    assert_eq!(op.attempts, 1);
    assert_eq!(op.kind, OperationKind::Create);

    let op = h.settle(&accepted.operation_id.to_string()).await;
    assert_eq!(op.status, OperationStatus::Succeeded);
    assert!(op.last_error.is_none());

    let detail = h.service.get_cluster("prod-1").await.unwrap();
    assert_eq!(detail.cluster.id, accepted.cluster_id);
    assert_eq!(detail.cluster.status, ClusterStatus::Ready);
    assert_eq!(detail.cluster.observed_node_count, Some(3));
    assert!(detail.active_operation.is_none());
}

#[tokio::test]
async fn cluster_create_validates_intent() {
    let h = Harness::new();

    let edits: [fn(&mut CreateClusterRequest); 5] = [
        |r| r.provider.clear(),
        |r| r.region = "  ".to_string(),
        |r| r.node_count = Some(0),
        |r| r.node_count = None,
        |r| r.name = "Prod_1".to_string(),
    ];
    for edit in edits {
        let mut req = cluster_request("prod-1");
        edit(&mut req);
        let err = h.service.create_cluster(req).await.unwrap_err();
        assert!(matches!(err, ServiceError::Validation { .. }), "{err:?}");
    }
    assert_eq!(h.sim.call_count(calls::CREATE_CLUSTER), 0);
}

#[tokio::test]
async fn cluster_name_conflicts_while_create_in_flight() {
    let h = Harness::new();
    h.service
        .create_cluster(cluster_request("prod-1"))
        .await
        .unwrap();

    let err = h
        .service
        .create_cluster(cluster_request("prod-1"))
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Conflict(_)));
    assert_eq!(h.sim.call_count(calls::CREATE_CLUSTER), 1);
}

#[tokio::test]
async fn provider_error_phase_fails_create() {
    let h = Harness::with_options(HarnessOptions {
        polls_to_ready: 5,
        ..Default::default()
    });
    let accepted = h
        .service
        .create_cluster(cluster_request("prod-1"))
        .await
        .unwrap();
    h.sim
        .set_cluster_phase(accepted.cluster_id, ClusterPhase::Error);

    let op = h.settle(&accepted.operation_id.to_string()).await;
    assert_eq!(op.status, OperationStatus::Failed);
    assert_eq!(op.last_error.unwrap().kind, OperationErrorKind::Provider);

    let cluster = h.resources.cluster(accepted.cluster_id).await.unwrap();
    assert_eq!(cluster.status, ClusterStatus::Error);
}

#[tokio::test]
async fn attempts_stop_at_ceiling() {
    let h = Harness::with_options(HarnessOptions {
        max_attempts: 3,
        ..Default::default()
    });
    h.sim
        .fail_next(calls::GET_CLUSTER_STATUS, 10, unavailable());

    let accepted = h
        .service
        .create_cluster(cluster_request("prod-1"))
        .await
        .unwrap();
    let id = accepted.operation_id.to_string();

    let mut seen = Vec::new();
    for _ in 0..6 {
        h.reconciler.reconcile_once().await;
        seen.push(h.service.get_operation(&id).await.unwrap().attempts);
    }

    assert!(seen.windows(2).all(|w| w[0] <= w[1]), "{seen:?}");
    assert!(seen.iter().all(|a| *a <= 3), "{seen:?}");

    let op = h.service.get_operation(&id).await.unwrap();
    assert_eq!(op.status, OperationStatus::Failed);
    assert_eq!(op.attempts, 3);
    assert_eq!(op.last_error.unwrap().kind, OperationErrorKind::Unavailable);
    assert_eq!(h.sim.call_count(calls::GET_CLUSTER_STATUS), 3);

    // A failed create keeps the cluster where it was.
    let cluster = h.resources.cluster(accepted.cluster_id).await.unwrap();
    assert_eq!(cluster.status, ClusterStatus::Provisioning);

    // The ceiling also bounds explicit retries.
    let err = h.service.retry_operation(&id).await.unwrap_err();
    assert!(matches!(err, ServiceError::Conflict(_)));
}

#[tokio::test]
async fn adapter_timeouts_are_retried() {
    let h = Harness::with_options(HarnessOptions {
        adapter_timeout: Duration::from_millis(20),
        ..Default::default()
    });
    h.sim.set_latency(Duration::from_millis(200));

    let accepted = h
        .service
        .create_cluster(cluster_request("slow-1"))
        .await
        .unwrap();
    let op = h
        .service
        .get_operation(&accepted.operation_id.to_string())
        .await
        .unwrap();
    assert_eq!(op.status, OperationStatus::Pending);
    assert_eq!(op.last_error.unwrap().kind, OperationErrorKind::Timeout);
    assert!(op.next_attempt_at.is_some());
}

#[tokio::test]
async fn failed_submission_is_resubmitted_by_reconciler() {
    let h = Harness::new();
    h.sim.fail_next(calls::CREATE_CLUSTER, 1, unavailable());

    let accepted = h
        .service
        .create_cluster(cluster_request("prod-1"))
        .await
        .unwrap();
    assert!(!h.sim.has_cluster(accepted.cluster_id));

    let stats = h.reconciler.reconcile_once().await;
    assert_eq!(stats.resubmitted, 1);
    assert!(h.sim.has_cluster(accepted.cluster_id));

    let op = h.settle(&accepted.operation_id.to_string()).await;
    assert_eq!(op.status, OperationStatus::Succeeded);
    assert_eq!(op.attempts, 1);
    assert_eq!(h.sim.call_count(calls::CREATE_CLUSTER), 2);
}

#[tokio::test]
async fn fatal_submission_can_be_retried_explicitly() {
    let h = Harness::new();
    h.sim.fail_next(
        calls::CREATE_CLUSTER,
        1,
        AdapterError::Auth("token expired".to_string()),
    );

    let accepted = h
        .service
        .create_cluster(cluster_request("prod-1"))
        .await
        .unwrap();
    let id = accepted.operation_id.to_string();
    let op = h.service.get_operation(&id).await.unwrap();
    assert_eq!(op.status, OperationStatus::Failed);
    assert_eq!(op.last_error.unwrap().kind, OperationErrorKind::Auth);

    let retried = h.service.retry_operation(&id).await.unwrap();
    assert_eq!(retried.operation_id, accepted.operation_id);

    let op = h.settle(&id).await;
    assert_eq!(op.status, OperationStatus::Succeeded);
    assert_eq!(op.attempts, 2);

    // Retry is only allowed from Failed.
    let err = h.service.retry_operation(&id).await.unwrap_err();
    assert!(matches!(err, ServiceError::Conflict(_)));
}

#[tokio::test]
async fn double_delete_is_idempotent() {
    let h = Harness::new();
    let cluster_id = h.ready_cluster("prod-1").await;

    let first = h.service.delete_cluster(&cluster_id).await.unwrap();
    let op = h.settle(&first.operation_id.to_string()).await;
    assert_eq!(op.status, OperationStatus::Succeeded);
    assert_eq!(op.kind, OperationKind::Delete);

    let second = h.service.delete_cluster(&cluster_id).await.unwrap();
    assert_eq!(second.operation_id, first.operation_id);
    assert_eq!(h.sim.call_count(calls::DELETE_CLUSTER), 1);

    assert!(matches!(
        h.service.get_cluster(&cluster_id).await,
        Err(ServiceError::NotFound(_))
    ));
    assert!(h.service.list_clusters().await.is_empty());
}

#[tokio::test]
async fn double_delete_by_name_is_idempotent() {
    let h = Harness::new();
    h.ready_cluster("prod-1").await;

    let first = h.service.delete_cluster("prod-1").await.unwrap();
    let op = h.settle(&first.operation_id.to_string()).await;
    assert_eq!(op.status, OperationStatus::Succeeded);

    let second = h.service.delete_cluster("prod-1").await.unwrap();
    assert_eq!(second.operation_id, first.operation_id);
    assert_eq!(h.sim.call_count(calls::DELETE_CLUSTER), 1);

    // Once the name is reused, a repeat delete targets the newest cluster.
    h.ready_cluster("prod-1").await;
    let third = h.service.delete_cluster("prod-1").await.unwrap();
    assert_ne!(third.operation_id, first.operation_id);
    h.settle(&third.operation_id.to_string()).await;
    let fourth = h.service.delete_cluster("prod-1").await.unwrap();
    assert_eq!(fourth.operation_id, third.operation_id);
    assert_eq!(h.sim.call_count(calls::DELETE_CLUSTER), 2);

    assert!(matches!(
        h.service.delete_cluster("never-existed").await,
        Err(ServiceError::NotFound(_))
    ));
}

#[tokio::test]
async fn finished_history_is_pruned_after_retention() {
    let h = Harness::new();
    let cluster_id = h.ready_cluster("prod-1").await;
    let deleted = h.service.delete_cluster("prod-1").await.unwrap();
    h.settle(&deleted.operation_id.to_string()).await;

    // In flight, so neither the operation nor its cluster may go.
    let pending = h
        .service
        .create_cluster(cluster_request("prod-2"))
        .await
        .unwrap();

    assert_eq!(h.reconciler.prune_history(Duration::from_secs(3600)).await, (0, 0));

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(h.reconciler.prune_history(Duration::from_millis(1)).await, (2, 1));

    let remaining = h.service.list_operations(None).await;
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id, pending.operation_id);
    assert!(h
        .resources
        .cluster(ClusterId::parse(&cluster_id).unwrap())
        .await
        .is_none());
    assert!(h.resources.cluster(pending.cluster_id).await.is_some());

    // Past retention a repeat delete no longer resolves.
    assert!(matches!(
        h.service.delete_cluster("prod-1").await,
        Err(ServiceError::NotFound(_))
    ));
}

#[tokio::test]
async fn delete_while_delete_in_flight_returns_same_operation() {
    let h = Harness::new();
    let cluster_id = h.ready_cluster("prod-1").await;

    let first = h.service.delete_cluster("prod-1").await.unwrap();
    let second = h.service.delete_cluster(&cluster_id).await.unwrap();
    assert_eq!(first.operation_id, second.operation_id);
    assert_eq!(h.sim.call_count(calls::DELETE_CLUSTER), 1);
}

#[tokio::test]
async fn delete_supersedes_in_flight_create() {
    let h = Harness::with_options(HarnessOptions {
        polls_to_ready: 10,
        ..Default::default()
    });
    let accepted = h
        .service
        .create_cluster(cluster_request("prod-1"))
        .await
        .unwrap();

    let delete = h
        .service
        .delete_cluster(&accepted.cluster_id.to_string())
        .await
        .unwrap();

    let create = h
        .service
        .get_operation(&accepted.operation_id.to_string())
        .await
        .unwrap();
    assert_eq!(create.status, OperationStatus::Failed);
    assert_eq!(
        create.last_error.unwrap().kind,
        OperationErrorKind::Superseded
    );

    let in_flight = h.tracker.in_flight().await;
    assert_eq!(in_flight.len(), 1);
    assert_eq!(in_flight[0].id, delete.operation_id);

    let op = h.settle(&delete.operation_id.to_string()).await;
    assert_eq!(op.status, OperationStatus::Succeeded);
    let cluster = h.resources.cluster(accepted.cluster_id).await.unwrap();
    assert_eq!(cluster.status, ClusterStatus::Deleted);

    // Superseded operations cannot be revived.
    let err = h
        .service
        .retry_operation(&accepted.operation_id.to_string())
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Conflict(_)));
}

#[tokio::test]
async fn cluster_with_deployments_cannot_be_deleted() {
    let h = Harness::new();
    let cluster_id = h.ready_cluster("prod-1").await;
    let template_id = h.template("web").await;
    h.running_deployment(&cluster_id, &template_id).await;

    let err = h.service.delete_cluster(&cluster_id).await.unwrap_err();
    assert!(matches!(
        err,
        ServiceError::Precondition { missing: false, .. }
    ));
    assert_eq!(h.sim.call_count(calls::DELETE_CLUSTER), 0);
}

#[tokio::test]
async fn deployment_create_waits_behind_cluster_delete() {
    let h = Harness::with_options(HarnessOptions {
        lock_wait: Duration::from_millis(20),
        ..Default::default()
    });
    let cluster_id = h.ready_cluster("prod-1").await;
    let template_id = h.template("web").await;

    // The delete holds the cluster while the provider call is in flight.
    h.sim.set_latency(Duration::from_millis(300));
    let delete = {
        let service = h.service.clone();
        let cluster_id = cluster_id.clone();
        tokio::spawn(async move { service.delete_cluster(&cluster_id).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let err = h
        .service
        .create_deployment(deployment_request(&cluster_id, &template_id, 1))
        .await
        .unwrap_err();
    match err {
        ServiceError::Conflict(message) => {
            assert!(message.contains(&format!("resource:{cluster_id}")), "{message}")
        }
        other => panic!("expected lock conflict, got {other:?}"),
    }

    delete.await.unwrap().unwrap();
    let err = h
        .service
        .create_deployment(deployment_request(&cluster_id, &template_id, 1))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ServiceError::Precondition { missing: false, .. }
    ));
    assert!(h
        .resources
        .list_deployments(Some(ClusterId::parse(&cluster_id).unwrap()))
        .await
        .is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_deployment_create_and_cluster_delete_never_orphan() {
    for _ in 0..50 {
        let h = Harness::new();
        let cluster_id = h.ready_cluster("prod-1").await;
        let template_id = h.template("web").await;

        let create = {
            let service = h.service.clone();
            let request = deployment_request(&cluster_id, &template_id, 1);
            tokio::spawn(async move { service.create_deployment(request).await })
        };
        let delete = {
            let service = h.service.clone();
            let cluster_id = cluster_id.clone();
            tokio::spawn(async move { service.delete_cluster(&cluster_id).await })
        };
        let created = create.await.unwrap();
        let deleted = delete.await.unwrap();

        // Exactly one side wins.
        assert_ne!(created.is_ok(), deleted.is_ok());

        let id = ClusterId::parse(&cluster_id).unwrap();
        let cluster = h.resources.cluster(id).await.unwrap();
        let live = h.resources.list_deployments(Some(id)).await;
        if cluster.status == ClusterStatus::Deleting {
            assert!(live.is_empty(), "live deployment on a deleting cluster");
        } else {
            assert_eq!(live.len(), 1);
        }
    }
}

#[tokio::test]
async fn cluster_drift_degrades_and_recovers() {
    let h = Harness::new();
    let cluster_id = h.ready_cluster("prod-1").await;
    let id = ClusterId::parse(&cluster_id).unwrap();

    h.sim.set_observed_nodes(id, Some(2));
    let stats = h.reconciler.reconcile_once().await;
    assert_eq!(stats.drifted, 1);

    let cluster = h.resources.cluster(id).await.unwrap();
    assert_eq!(cluster.status, ClusterStatus::Degraded);
    let drift = cluster.drift.unwrap();
    assert_eq!(drift.field, "nodeCount");
    assert_eq!(drift.observed, "2");
    // Drift never creates an operation.
    assert!(h.tracker.in_flight().await.is_empty());

    h.sim.set_observed_nodes(id, None);
    let stats = h.reconciler.reconcile_once().await;
    assert_eq!(stats.recovered, 1);
    let cluster = h.resources.cluster(id).await.unwrap();
    assert_eq!(cluster.status, ClusterStatus::Ready);
    assert!(cluster.drift.is_none());
}

// =============================================================================
// Deployments
// =============================================================================

#[tokio::test]
async fn deployment_create_converges_to_running() {
    let h = Harness::new();
    let cluster_id = h.ready_cluster("prod-1").await;
    let template_id = h.template("web").await;

    let deployment_id = h.running_deployment(&cluster_id, &template_id).await;
    let deployment = h.service.get_deployment(&deployment_id).await.unwrap();
    assert_eq!(deployment.status, DeploymentStatus::Running);
    assert_eq!(deployment.name, "web");
    assert_eq!(deployment.ready_replicas, 2);
    assert!(h
        .sim
        .has_workload(DeploymentId::parse(&deployment_id).unwrap()));
}

#[tokio::test]
async fn deployment_preconditions() {
    let h = Harness::with_options(HarnessOptions {
        polls_to_ready: 10,
        ..Default::default()
    });
    let template_id = h.template("web").await;

    // Unknown cluster.
    let err = h
        .service
        .create_deployment(deployment_request("missing", &template_id, 1))
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Precondition { missing: true, .. }));

    // Cluster still provisioning.
    let accepted = h
        .service
        .create_cluster(cluster_request("prod-1"))
        .await
        .unwrap();
    let err = h
        .service
        .create_deployment(deployment_request(
            &accepted.cluster_id.to_string(),
            &template_id,
            1,
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Precondition { missing: false, .. }));

    // Unknown template.
    let err = h
        .service
        .create_deployment(deployment_request(
            &accepted.cluster_id.to_string(),
            &TemplateId::new().to_string(),
            1,
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Precondition { missing: true, .. }));
}

#[tokio::test]
async fn deployment_validation() {
    let h = Harness::new();
    let cluster_id = h.ready_cluster("prod-1").await;
    let template_id = h.template("web").await;

    let err = h
        .service
        .create_deployment(deployment_request(&cluster_id, &template_id, 0))
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Validation { ref field, .. } if field == "replicas"));

    let mut req = deployment_request(&cluster_id, &template_id, 1);
    req.param_overrides =
        BTreeMap::from([("undeclared".to_string(), "x".to_string())]);
    let err = h.service.create_deployment(req).await.unwrap_err();
    assert!(
        matches!(err, ServiceError::Validation { ref field, .. } if field == "paramOverrides")
    );

    let mut req = deployment_request(&cluster_id, &template_id, 1);
    req.namespace = "Not A Label".to_string();
    assert!(h.service.create_deployment(req).await.is_err());
}

#[tokio::test]
async fn concurrent_identical_creates_admit_exactly_one() {
    let h = Harness::new();
    let cluster_id = h.ready_cluster("prod-1").await;
    let template_id = h.template("web").await;
    h.sim.set_latency(Duration::from_millis(50));

    let a = h
        .service
        .create_deployment(deployment_request(&cluster_id, &template_id, 2));
    let b = h
        .service
        .create_deployment(deployment_request(&cluster_id, &template_id, 2));
    let (a, b) = tokio::join!(a, b);

    let results = [a, b];
    let accepted = results.iter().filter(|r| r.is_ok()).count();
    let conflicts = results
        .iter()
        .filter(|r| matches!(r, Err(ServiceError::Conflict(_))))
        .count();
    assert_eq!(accepted, 1);
    assert_eq!(conflicts, 1);
    assert_eq!(h.resources.list_deployments(None).await.len(), 1);
}

#[tokio::test]
async fn update_conflicts_with_pending_scale() {
    let h = Harness::new();
    let cluster_id = h.ready_cluster("prod-1").await;
    let template_id = h.template("web").await;
    let deployment_id = h.running_deployment(&cluster_id, &template_id).await;

    let scale = h
        .service
        .update_deployment(
            &deployment_id,
            DeploymentPatch {
                replicas: Some(3),
                param_overrides: None,
            },
        )
        .await
        .unwrap();
    let op = h
        .service
        .get_operation(&scale.operation_id.to_string())
        .await
        .unwrap();
    assert_eq!(op.kind, OperationKind::Scale);

    let err = h
        .service
        .update_deployment(
            &deployment_id,
            DeploymentPatch {
                replicas: Some(5),
                param_overrides: None,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Conflict(_)));

    let op = h.settle(&scale.operation_id.to_string()).await;
    assert_eq!(op.status, OperationStatus::Succeeded);
    let deployment = h.service.get_deployment(&deployment_id).await.unwrap();
    assert_eq!(deployment.replicas, 3);
    assert_eq!(deployment.ready_replicas, 3);
    assert_eq!(deployment.status, DeploymentStatus::Running);
}

#[tokio::test]
async fn failed_update_restores_previous_spec() {
    let h = Harness::new();
    let cluster_id = h.ready_cluster("prod-1").await;
    let template_id = h.template("web").await;
    let deployment_id = h.running_deployment(&cluster_id, &template_id).await;

    h.sim.fail_next(
        calls::APPLY_WORKLOAD,
        1,
        AdapterError::Rejected("quota exceeded".to_string()),
    );
    let accepted = h
        .service
        .update_deployment(
            &deployment_id,
            DeploymentPatch {
                replicas: Some(40),
                param_overrides: Some(BTreeMap::from([(
                    "tag".to_string(),
                    "v2".to_string(),
                )])),
            },
        )
        .await
        .unwrap();

    let op = h
        .service
        .get_operation(&accepted.operation_id.to_string())
        .await
        .unwrap();
    assert_eq!(op.kind, OperationKind::Update);
    assert_eq!(op.status, OperationStatus::Failed);

    let deployment = h.service.get_deployment(&deployment_id).await.unwrap();
    assert_eq!(deployment.replicas, 2);
    assert!(deployment.param_overrides.is_empty());
    assert_eq!(deployment.status, DeploymentStatus::Running);
}

#[tokio::test]
async fn rollout_that_settles_short_spends_attempts_then_restores() {
    let h = Harness::with_options(HarnessOptions {
        max_attempts: 3,
        ..Default::default()
    });
    let cluster_id = h.ready_cluster("prod-1").await;
    let template_id = h.template("web").await;
    let deployment_id = h.running_deployment(&cluster_id, &template_id).await;

    // The provider finishes rolling out but only one replica ever comes up.
    let id = DeploymentId::parse(&deployment_id).unwrap();
    h.sim.set_ready_replicas(id, Some(1));

    let accepted = h
        .service
        .update_deployment(
            &deployment_id,
            DeploymentPatch {
                replicas: Some(4),
                param_overrides: None,
            },
        )
        .await
        .unwrap();
    let op = h.settle(&accepted.operation_id.to_string()).await;
    assert_eq!(op.status, OperationStatus::Failed);
    assert_eq!(op.attempts, 3);
    let error = op.last_error.unwrap();
    assert_eq!(error.kind, OperationErrorKind::Diverged);
    assert!(error.message.contains("1 of 4"), "{}", error.message);

    let deployment = h.service.get_deployment(&deployment_id).await.unwrap();
    assert_eq!(deployment.replicas, 2);
    // Still short of the restored spec, so drift detection takes over.
    assert_eq!(deployment.status, DeploymentStatus::Degraded);
}

#[tokio::test]
async fn deployment_drift_degrades_and_recovers() {
    let h = Harness::new();
    let cluster_id = h.ready_cluster("prod-1").await;
    let template_id = h.template("web").await;
    let deployment_id = h.running_deployment(&cluster_id, &template_id).await;
    let id = DeploymentId::parse(&deployment_id).unwrap();

    h.sim.set_ready_replicas(id, Some(1));
    h.reconciler.reconcile_once().await;
    let deployment = h.service.get_deployment(&deployment_id).await.unwrap();
    assert_eq!(deployment.status, DeploymentStatus::Degraded);
    assert_eq!(deployment.ready_replicas, 1);
    assert_eq!(deployment.drift.unwrap().field, "replicas");

    h.sim.set_ready_replicas(id, None);
    h.reconciler.reconcile_once().await;
    let deployment = h.service.get_deployment(&deployment_id).await.unwrap();
    assert_eq!(deployment.status, DeploymentStatus::Running);
    assert!(deployment.drift.is_none());
}

#[tokio::test]
async fn deployment_delete_removes_workload() {
    let h = Harness::new();
    let cluster_id = h.ready_cluster("prod-1").await;
    let template_id = h.template("web").await;
    let deployment_id = h.running_deployment(&cluster_id, &template_id).await;

    let accepted = h.service.delete_deployment(&deployment_id).await.unwrap();
    let op = h.settle(&accepted.operation_id.to_string()).await;
    assert_eq!(op.status, OperationStatus::Succeeded);

    assert!(matches!(
        h.service.get_deployment(&deployment_id).await,
        Err(ServiceError::NotFound(_))
    ));
    assert!(!h
        .sim
        .has_workload(DeploymentId::parse(&deployment_id).unwrap()));

    // The (cluster, namespace, name) slot is free again.
    h.running_deployment(&cluster_id, &template_id).await;
}

// =============================================================================
// Templates
// =============================================================================

#[tokio::test]
async fn templates_are_versioned_by_name() {
    let h = Harness::new();
    let first = h
        .service
        .create_template(common::template_request("web"))
        .await
        .unwrap();
    let second = h
        .service
        .create_template(common::template_request("web"))
        .await
        .unwrap();

    assert_eq!(first.version, 1);
    assert_eq!(second.version, 2);
    assert_eq!(second.previous_version, Some(first.id));
    assert_ne!(first.id, second.id);
    assert_eq!(first.spec_hash, second.spec_hash);
    assert_eq!(h.service.list_templates().await.len(), 2);
}

// =============================================================================
// Metrics
// =============================================================================

#[tokio::test]
async fn metrics_ring_evicts_oldest_first() {
    let h = Harness::with_options(HarnessOptions {
        ring_capacity: 4,
        ..Default::default()
    });
    let cluster_id = h.ready_cluster("prod-1").await;

    let mut history = Vec::new();
    for _ in 0..7 {
        h.aggregator.aggregate_once().await;
        let ring = h.metrics.ring(&cluster_id, "cpu_usage").await;
        history.push(ring.last().unwrap().timestamp);
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    let ring = h.metrics.ring(&cluster_id, "cpu_usage").await;
    assert_eq!(ring.len(), 4);
    assert_eq!(ring[0].timestamp, history[3]);
    assert!(ring.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
}

#[tokio::test]
async fn metrics_fetch_failures_are_isolated() {
    let h = Harness::new();
    let healthy = h.ready_cluster("prod-1").await;
    let failing = h.ready_cluster("prod-2").await;

    h.aggregator.aggregate_once().await;
    h.sim.fail_metrics_for(&failing, Some(unavailable()));
    tokio::time::sleep(Duration::from_millis(2)).await;

    let stats = h.aggregator.aggregate_once().await;
    assert_eq!(stats.resources, 2);
    assert_eq!(stats.failed_resources, 1);

    assert!(h.metrics.health(&failing).await.is_stale());
    assert!(!h.metrics.health(&healthy).await.is_stale());
    // Stale data is kept.
    assert_eq!(h.metrics.ring(&failing, "cpu_usage").await.len(), 1);
    assert_eq!(h.metrics.ring(&healthy, "cpu_usage").await.len(), 2);

    let detail = h.service.get_cluster(&failing).await.unwrap();
    assert!(detail.metrics_health.is_stale());
    assert_eq!(detail.recent_metrics.len(), 3);
}

#[tokio::test]
async fn metric_range_queries() {
    let h = Harness::new();
    let cluster_id = h.ready_cluster("prod-1").await;
    let template_id = h.template("web").await;
    let deployment_id = h.running_deployment(&cluster_id, &template_id).await;

    // Known resource without samples yet.
    assert!(h
        .service
        .deployment_metrics(&deployment_id, None)
        .await
        .unwrap()
        .is_empty());

    h.aggregator.aggregate_once().await;
    let samples = h
        .service
        .deployment_metrics(&deployment_id, Some("15m"))
        .await
        .unwrap();
    assert_eq!(samples.len(), 5);
    assert!(samples.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));

    assert!(matches!(
        h.service
            .deployment_metrics(&DeploymentId::new().to_string(), None)
            .await,
        Err(ServiceError::NotFound(_))
    ));
    assert!(matches!(
        h.service.cluster_metrics(&cluster_id, Some("soon")).await,
        Err(ServiceError::Validation { .. })
    ));
}
