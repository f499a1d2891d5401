//! Keyed advisory locks.
//!
//! Mutating requests hold the lock for their resource key while they
//! validate, submit to the provider, and register the operation. Locks are
//! created lazily; idle ones are pruned once the registry grows large.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Registry size above which idle entries are pruned.
const PRUNE_THRESHOLD: usize = 1024;

/// Guard for a held advisory lock. Released on drop.
pub struct LockGuard {
    _guard: OwnedMutexGuard<()>,
}

/// Map from resource key to lock handle.
#[derive(Default)]
pub struct LockRegistry {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn handle(&self, key: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        if locks.len() > PRUNE_THRESHOLD {
            // Only the registry holds idle handles.
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        }
        locks.entry(key.to_string()).or_default().clone()
    }

    /// Acquire the lock for `key`, waiting at most `wait`.
    ///
    /// Returns `None` if the lock is still held when `wait` elapses.
    pub async fn acquire(&self, key: &str, wait: Duration) -> Option<LockGuard> {
        let handle = self.handle(key);
        let guard = tokio::time::timeout(wait, handle.lock_owned()).await.ok()?;
        Some(LockGuard { _guard: guard })
    }
}

/// Lock key for a cluster name that may not have an id yet.
pub fn cluster_name_key(name: &str) -> String {
    format!("cluster-name:{name}")
}

/// Lock key for an existing resource id.
pub fn resource_key(resource_id: &str) -> String {
    format!("resource:{resource_id}")
}

/// Lock key for a deployment slot.
pub fn deployment_slot_key(cluster_id: &str, namespace: &str, name: &str) -> String {
    format!("deployment-slot:{cluster_id}/{namespace}/{name}")
}

#[cfg(test)]
mod tests {
    use super::*;

    const NO_WAIT: Duration = Duration::from_millis(10);

    #[tokio::test]
    async fn test_same_key_is_exclusive() {
        let registry = LockRegistry::new();
        let held = registry.acquire("resource:a", NO_WAIT).await.unwrap();

        assert!(registry.acquire("resource:a", NO_WAIT).await.is_none());

        // Unrelated keys are independent.
        assert!(registry.acquire("resource:b", NO_WAIT).await.is_some());

        drop(held);
        assert!(registry.acquire("resource:a", NO_WAIT).await.is_some());
    }

    #[tokio::test]
    async fn test_idle_locks_are_pruned() {
        let registry = LockRegistry::new();
        let held = registry.acquire("resource:held", NO_WAIT).await.unwrap();
        // The last lookup crosses the threshold and drops every idle handle.
        for i in 0..=PRUNE_THRESHOLD {
            let _ = registry.acquire(&format!("resource:{i}"), NO_WAIT).await;
        }

        let tracked = registry.locks.lock().unwrap().len();
        assert_eq!(tracked, 2);
        assert!(registry.acquire("resource:held", NO_WAIT).await.is_none());
        drop(held);
    }

    #[tokio::test]
    async fn test_waiter_gets_lock_after_release() {
        let registry = Arc::new(LockRegistry::new());
        let held = registry.acquire("k", NO_WAIT).await.unwrap();

        let waiter = {
            let registry = registry.clone();
            tokio::spawn(async move {
                registry
                    .acquire("k", Duration::from_secs(1))
                    .await
                    .is_some()
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(held);
        assert!(waiter.await.unwrap());
    }

    #[test]
    fn test_key_shapes() {
        assert_eq!(cluster_name_key("prod-1"), "cluster-name:prod-1");
        assert_eq!(
            deployment_slot_key("cls_1", "web", "nginx"),
            "deployment-slot:cls_1/web/nginx"
        );
    }
}
