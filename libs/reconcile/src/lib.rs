//! Reconciliation loop primitives.
//!
//! Helpers for loops that converge observed state toward desired state:
//!
//! - **Backoff**: exponential delay with full jitter between retries.
//! - **Attempt budget**: a hard ceiling on attempts per operation.
//! - **Drift**: comparison of desired and observed attributes outside of an
//!   active operation.
//! - **Spec hash**: a content fingerprint for immutable workload specs.
//!
//! # Invariants
//!
//! - Attempt counts handed out by [`AttemptBudget`] never exceed the ceiling
//! - Backoff delays never exceed the configured cap
//! - Spec hashes are independent of JSON key order

use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use sha2::{Digest, Sha256};

/// Default reconciliation interval.
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(5);

/// Default metrics aggregation interval.
pub const DEFAULT_METRICS_INTERVAL: Duration = Duration::from_secs(30);

/// Default number of attempts allowed per operation.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Default base delay for retry backoff.
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Default cap on retry backoff.
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(60);

// =============================================================================
// Convergence
// =============================================================================

/// Convergence status for a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvergenceStatus {
    /// Resource has converged (observed matches desired).
    Converged,

    /// Resource is converging (observed is moving toward desired).
    Converging,

    /// Resource has diverged (observed no longer tracks desired).
    Diverged,

    /// Status is unknown (insufficient data).
    Unknown,
}

impl ConvergenceStatus {
    /// Returns true if the resource has converged.
    pub fn is_converged(&self) -> bool {
        matches!(self, Self::Converged)
    }

    /// Returns true if the resource is still converging.
    pub fn is_converging(&self) -> bool {
        matches!(self, Self::Converging)
    }
}

/// A divergence between a desired and an observed attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Drift {
    /// Attribute that drifted (e.g. `replicas`).
    pub field: String,
    pub desired: String,
    pub observed: String,
}

impl Drift {
    pub fn new(
        field: impl Into<String>,
        desired: impl ToString,
        observed: impl ToString,
    ) -> Self {
        Self {
            field: field.into(),
            desired: desired.to_string(),
            observed: observed.to_string(),
        }
    }
}

impl std::fmt::Display for Drift {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} drifted: desired {}, observed {}",
            self.field, self.desired, self.observed
        )
    }
}

/// Compare desired and observed replica counts.
pub fn detect_replica_drift(desired: u32, observed: u32) -> Option<Drift> {
    (desired != observed).then(|| Drift::new("replicas", desired, observed))
}

/// Compare desired and observed node counts.
pub fn detect_node_drift(desired: u32, observed: u32) -> Option<Drift> {
    (desired != observed).then(|| Drift::new("nodeCount", desired, observed))
}

/// Classify replica progress toward a desired count.
pub fn replica_convergence(desired: u32, ready: u32, progressing: bool) -> ConvergenceStatus {
    if ready == desired && !progressing {
        ConvergenceStatus::Converged
    } else if progressing {
        ConvergenceStatus::Converging
    } else {
        ConvergenceStatus::Diverged
    }
}

// =============================================================================
// Retry
// =============================================================================

/// Exponential backoff with full jitter.
///
/// The delay before retry `n` (zero-based) is drawn uniformly from
/// `[0, min(max, base * 2^n)]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Base delay for the first retry.
    pub base: Duration,

    /// Maximum delay.
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: DEFAULT_BACKOFF_BASE,
            max: DEFAULT_BACKOFF_MAX,
        }
    }
}

impl BackoffPolicy {
    /// Create a policy with the given base and cap.
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Upper bound of the delay for `attempt`, before jitter.
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(31));
        self.base.saturating_mul(factor).min(self.max)
    }

    /// Delay for `attempt` with full jitter applied.
    pub fn delay(&self, attempt: u32) -> Duration {
        let fraction = rand::rng().random_range(0.0..=1.0);
        self.delay_with_fraction(attempt, fraction)
    }

    /// Delay for `attempt` at a fixed point `fraction` in `[0, 1]` of the window.
    pub fn delay_with_fraction(&self, attempt: u32, fraction: f64) -> Duration {
        self.ceiling(attempt).mul_f64(fraction.clamp(0.0, 1.0))
    }
}

/// Ceiling on the number of attempts an operation may consume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptBudget {
    max_attempts: u32,
}

impl Default for AttemptBudget {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS)
    }
}

impl AttemptBudget {
    /// Create a budget; a ceiling of zero is treated as one attempt.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Returns true if another attempt may follow `attempts` used ones.
    pub fn allows_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    /// Returns true if the budget is used up.
    pub fn is_exhausted(&self, attempts: u32) -> bool {
        !self.allows_retry(attempts)
    }
}

// =============================================================================
// Spec Hash
// =============================================================================

/// A spec hash for deterministic comparison of workload specs.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct SpecHash(String);

impl SpecHash {
    /// Compute a spec hash from canonical JSON.
    pub fn from_json(json: &serde_json::Value) -> Self {
        let canonical = canonical_json(json);
        let digest = Sha256::digest(canonical.as_bytes());
        Self(format!("sha256:{}", hex::encode(&digest[..16])))
    }

    /// Get the hash string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SpecHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Produce canonical JSON (sorted keys, no extra whitespace).
fn canonical_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut pairs: Vec<_> = map.iter().collect();
            pairs.sort_by_key(|(k, _)| *k);
            let inner: Vec<String> = pairs
                .iter()
                .map(|(k, v)| {
                    format!(
                        "{}:{}",
                        serde_json::Value::String((*k).clone()),
                        canonical_json(v)
                    )
                })
                .collect();
            format!("{{{}}}", inner.join(","))
        }
        serde_json::Value::Array(arr) => {
            let inner: Vec<String> = arr.iter().map(canonical_json).collect();
            format!("[{}]", inner.join(","))
        }
        other => other.to_string(),
    }
}
