//! Operation tracker.
//!
//! Every accepted mutation is recorded as an [`Operation`] that moves through
//! `Pending -> InProgress -> {Succeeded, Failed}`. The tracker enforces:
//!
//! - at most one non-terminal operation per target resource
//! - terminal operations are never modified, except by an explicit retry of
//!   a `Failed` operation below the attempt ceiling
//! - attempt counts only grow and never exceed the ceiling
//!
//! All transitions happen under one write lock and readers receive clones,
//! so no caller observes a partially-updated operation.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use portal_id::OperationId;
use portal_reconcile::{AttemptBudget, BackoffPolicy};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::adapter::AdapterError;
use crate::model::{
    Operation, OperationError, OperationErrorKind, OperationKind, OperationStatus, ResourceRef,
    ResourceSnapshot, ResourceType,
};

/// Result type for tracker operations.
pub type TrackerResult<T> = Result<T, TrackerError>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TrackerError {
    #[error("operation {0} not found")]
    NotFound(OperationId),

    #[error("{target} already has operation {operation} in flight")]
    Busy {
        target: ResourceRef,
        operation: OperationId,
    },

    #[error("operation {0} is already terminal")]
    Terminal(OperationId),

    #[error("operation {id} cannot be retried: {reason}")]
    NotRetryable { id: OperationId, reason: String },
}

/// Outcome of the synchronous provider submission made while accepting an intent.
#[derive(Debug, Clone)]
pub enum Submission {
    Accepted,
    Failed(AdapterError),
}

/// An intent accepted by the orchestration service.
#[derive(Debug, Clone)]
pub struct NewOperation {
    pub target: ResourceRef,
    pub target_name: String,
    pub kind: OperationKind,
    pub generation: u64,
    pub prior: Option<ResourceSnapshot>,
    pub desired: Option<ResourceSnapshot>,
    pub submission: Submission,
}

#[derive(Default)]
struct TrackerInner {
    operations: HashMap<OperationId, Operation>,
    active: HashMap<ResourceRef, OperationId>,
}

impl TrackerInner {
    fn get_mut(&mut self, id: OperationId) -> TrackerResult<&mut Operation> {
        self.operations.get_mut(&id).ok_or(TrackerError::NotFound(id))
    }

    fn live_mut(&mut self, id: OperationId) -> TrackerResult<&mut Operation> {
        let op = self.get_mut(id)?;
        if op.status.is_terminal() {
            return Err(TrackerError::Terminal(id));
        }
        Ok(op)
    }

    fn finish(&mut self, id: OperationId, status: OperationStatus) -> TrackerResult<Operation> {
        let op = self.live_mut(id)?;
        op.status = status;
        op.next_attempt_at = None;
        op.updated_at = Utc::now();
        let snapshot = op.clone();
        if self.active.get(&snapshot.target) == Some(&id) {
            self.active.remove(&snapshot.target);
        }
        Ok(snapshot)
    }
}

pub struct OperationTracker {
    inner: RwLock<TrackerInner>,
    budget: AttemptBudget,
    backoff: BackoffPolicy,
}

impl OperationTracker {
    pub fn new(budget: AttemptBudget, backoff: BackoffPolicy) -> Self {
        Self {
            inner: RwLock::new(TrackerInner::default()),
            budget,
            backoff,
        }
    }

    fn next_attempt_at(&self, attempts: u32) -> DateTime<Utc> {
        let delay = self.backoff.delay(attempts.saturating_sub(1));
        Utc::now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero())
    }

    /// Record a newly accepted intent as attempt 1.
    ///
    /// Fails with [`TrackerError::Busy`] if the target already has a
    /// non-terminal operation.
    pub async fn register(&self, new: NewOperation) -> TrackerResult<Operation> {
        let mut inner = self.inner.write().await;
        if let Some(existing) = inner.active.get(&new.target) {
            return Err(TrackerError::Busy {
                target: new.target,
                operation: *existing,
            });
        }

        let now = Utc::now();
        let mut op = Operation {
            id: OperationId::new(),
            target: new.target,
            target_name: new.target_name,
            kind: new.kind,
            status: OperationStatus::Pending,
            attempts: 1,
            last_error: None,
            submitted: false,
            generation: new.generation,
            prior: new.prior,
            desired: new.desired,
            next_attempt_at: None,
            created_at: now,
            updated_at: now,
        };

        match new.submission {
            Submission::Accepted => op.submitted = true,
            Submission::Failed(err) if err.is_retryable() && self.budget.allows_retry(1) => {
                op.last_error = Some(OperationError::from(&err));
                op.next_attempt_at = Some(self.next_attempt_at(1));
            }
            Submission::Failed(err) => {
                op.last_error = Some(OperationError::from(&err));
                op.status = OperationStatus::Failed;
            }
        }

        if !op.status.is_terminal() {
            inner.active.insert(op.target.clone(), op.id);
        }
        inner.operations.insert(op.id, op.clone());

        info!(
            operation_id = %op.id,
            target = %op.target,
            kind = ?op.kind,
            status = ?op.status,
            "Operation registered"
        );
        Ok(op)
    }

    pub async fn get(&self, id: OperationId) -> Option<Operation> {
        self.inner.read().await.operations.get(&id).cloned()
    }

    /// All operations, optionally for one resource id, oldest first.
    pub async fn list(&self, resource_id: Option<&str>) -> Vec<Operation> {
        let inner = self.inner.read().await;
        let mut ops: Vec<_> = inner
            .operations
            .values()
            .filter(|op| resource_id.is_none_or(|r| op.target.resource_id == r))
            .cloned()
            .collect();
        ops.sort_by_key(|op| op.id);
        ops
    }

    /// Forget terminal operations last touched more than `retention` ago.
    pub async fn prune_finished(&self, retention: Duration) -> usize {
        let Some(cutoff) = chrono::Duration::from_std(retention)
            .ok()
            .and_then(|r| Utc::now().checked_sub_signed(r))
        else {
            return 0;
        };

        let mut inner = self.inner.write().await;
        let before = inner.operations.len();
        inner
            .operations
            .retain(|_, op| !op.status.is_terminal() || op.updated_at >= cutoff);
        before - inner.operations.len()
    }

    /// Ids of every resource some retained operation refers to.
    pub async fn referenced_resources(&self) -> HashSet<String> {
        self.inner
            .read()
            .await
            .operations
            .values()
            .map(|op| op.target.resource_id.clone())
            .collect()
    }

    /// The non-terminal operation on `target`, if any.
    pub async fn active_for(&self, target: &ResourceRef) -> Option<Operation> {
        let inner = self.inner.read().await;
        let id = inner.active.get(target)?;
        inner.operations.get(id).cloned()
    }

    /// A non-terminal operation on a resource of `resource_type` labelled `name`.
    pub async fn active_by_name(&self, resource_type: ResourceType, name: &str) -> Option<Operation> {
        let inner = self.inner.read().await;
        inner
            .active
            .values()
            .filter_map(|id| inner.operations.get(id))
            .find(|op| op.target.resource_type == resource_type && op.target_name == name)
            .cloned()
    }

    /// Snapshot of all non-terminal operations, oldest first.
    pub async fn in_flight(&self) -> Vec<Operation> {
        let inner = self.inner.read().await;
        let mut ops: Vec<_> = inner
            .active
            .values()
            .filter_map(|id| inner.operations.get(id))
            .cloned()
            .collect();
        ops.sort_by_key(|op| op.id);
        ops
    }

    /// Number of non-terminal operations.
    pub async fn in_flight_count(&self) -> usize {
        self.inner.read().await.active.len()
    }

    /// Move `Pending` to `InProgress` once work on the operation starts.
    pub async fn start(&self, id: OperationId) -> TrackerResult<Operation> {
        let mut inner = self.inner.write().await;
        let op = inner.live_mut(id)?;
        if op.status == OperationStatus::Pending {
            op.status = OperationStatus::InProgress;
            op.updated_at = Utc::now();
            debug!(operation_id = %id, "Operation in progress");
        }
        Ok(op.clone())
    }

    /// Record that the current attempt reached the provider.
    pub async fn mark_submitted(&self, id: OperationId) -> TrackerResult<Operation> {
        let mut inner = self.inner.write().await;
        let op = inner.live_mut(id)?;
        op.submitted = true;
        op.status = OperationStatus::InProgress;
        op.next_attempt_at = None;
        op.updated_at = Utc::now();
        Ok(op.clone())
    }

    /// Record a provider error against the current attempt.
    ///
    /// Retryable errors below the ceiling consume another attempt and
    /// schedule it after a backoff; anything else fails the operation.
    pub async fn record_failure(
        &self,
        id: OperationId,
        err: &AdapterError,
    ) -> TrackerResult<Operation> {
        self.spend_attempt(id, OperationError::from(err), err.is_retryable())
            .await
    }

    /// Record a poll where the provider settled short of the desired state.
    ///
    /// Counts against the attempt budget like a retryable failure, so an
    /// operation that never converges still reaches the ceiling.
    pub async fn record_divergence(
        &self,
        id: OperationId,
        message: impl Into<String>,
    ) -> TrackerResult<Operation> {
        let error = OperationError::new(OperationErrorKind::Diverged, message);
        self.spend_attempt(id, error, true).await
    }

    async fn spend_attempt(
        &self,
        id: OperationId,
        error: OperationError,
        retryable: bool,
    ) -> TrackerResult<Operation> {
        let mut inner = self.inner.write().await;
        let attempts = inner.live_mut(id)?.attempts;

        if retryable && self.budget.allows_retry(attempts) {
            let next_attempt_at = self.next_attempt_at(attempts + 1);
            let op = inner.live_mut(id)?;
            op.attempts += 1;
            op.status = OperationStatus::InProgress;
            op.next_attempt_at = Some(next_attempt_at);
            op.updated_at = Utc::now();
            warn!(
                operation_id = %id,
                attempts = op.attempts,
                next_attempt_at = %next_attempt_at,
                kind = ?error.kind,
                error = %error.message,
                "Operation attempt failed, will retry"
            );
            op.last_error = Some(error);
            return Ok(op.clone());
        }

        warn!(
            operation_id = %id,
            attempts,
            retryable,
            kind = ?error.kind,
            error = %error.message,
            "Operation failed"
        );
        inner.live_mut(id)?.last_error = Some(error);
        inner.finish(id, OperationStatus::Failed)
    }

    pub async fn succeed(&self, id: OperationId) -> TrackerResult<Operation> {
        let op = self
            .inner
            .write()
            .await
            .finish(id, OperationStatus::Succeeded)?;
        info!(operation_id = %id, target = %op.target, attempts = op.attempts, "Operation succeeded");
        Ok(op)
    }

    pub async fn fail(&self, id: OperationId, error: OperationError) -> TrackerResult<Operation> {
        let mut inner = self.inner.write().await;
        inner.live_mut(id)?.last_error = Some(error);
        let op = inner.finish(id, OperationStatus::Failed)?;
        warn!(operation_id = %id, target = %op.target, error = ?op.last_error, "Operation failed");
        Ok(op)
    }

    /// Fail the in-flight operation on `target` because `by` replaces it.
    pub async fn supersede(&self, target: &ResourceRef, by: OperationKind) -> Option<Operation> {
        let mut inner = self.inner.write().await;
        let id = *inner.active.get(target)?;
        inner.live_mut(id).ok()?.last_error = Some(OperationError::new(
            OperationErrorKind::Superseded,
            format!("superseded by {by:?}"),
        ));
        let op = inner.finish(id, OperationStatus::Failed).ok()?;
        info!(operation_id = %id, target = %target, "Operation superseded");
        Some(op)
    }

    /// Resubmit a failed operation as its next attempt under the same id.
    pub async fn retry(&self, id: OperationId) -> TrackerResult<Operation> {
        let mut inner = self.inner.write().await;
        let op = inner.get_mut(id)?;
        if op.status != OperationStatus::Failed {
            return Err(TrackerError::NotRetryable {
                id,
                reason: format!("status is {:?}", op.status),
            });
        }
        if op
            .last_error
            .as_ref()
            .is_some_and(|e| e.kind == OperationErrorKind::Superseded)
        {
            return Err(TrackerError::NotRetryable {
                id,
                reason: "operation was superseded".to_string(),
            });
        }
        if !self.budget.allows_retry(op.attempts) {
            return Err(TrackerError::NotRetryable {
                id,
                reason: format!("attempt ceiling of {} reached", self.budget.max_attempts()),
            });
        }

        let target = op.target.clone();
        if let Some(existing) = inner.active.get(&target) {
            return Err(TrackerError::Busy {
                target,
                operation: *existing,
            });
        }

        let op = inner.get_mut(id)?;
        op.attempts += 1;
        op.status = OperationStatus::Pending;
        op.submitted = false;
        op.next_attempt_at = None;
        op.updated_at = Utc::now();
        let snapshot = op.clone();
        inner.active.insert(target, id);

        info!(operation_id = %id, attempts = snapshot.attempts, "Operation resubmitted");
        Ok(snapshot)
    }

    /// Replace the generation an in-flight operation applies against.
    pub async fn set_generation(&self, id: OperationId, generation: u64) -> TrackerResult<()> {
        self.inner.write().await.live_mut(id)?.generation = generation;
        Ok(())
    }
}
