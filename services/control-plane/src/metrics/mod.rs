//! Metrics aggregation.
//!
//! Raw samples pulled from the provider are kept in a bounded ring per
//! `(resource, metric)`. Rings are strictly FIFO: once a ring holds
//! `capacity` samples, each new sample evicts the oldest. Samples within a
//! ring are ordered by timestamp; anything not newer than the last retained
//! sample is dropped on append.
//!
//! The [`MetricsWorker`] refreshes the rings on a fixed interval; the API
//! reads them without contacting the provider.

mod worker;

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

use crate::adapter::MetricPoint;
use crate::model::MetricSample;

pub use worker::{AggregateStats, MetricsWorker};

/// Default samples retained per ring (one hour at a 30s interval).
pub const DEFAULT_RING_CAPACITY: usize = 120;

/// Default range query window.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60 * 60);

/// Fetch health for one resource.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchHealth {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_success: Option<DateTime<Utc>>,
    /// Set while the latest fetch for the resource has been failing.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stale_since: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl FetchHealth {
    pub fn is_stale(&self) -> bool {
        self.stale_since.is_some()
    }
}

type RingKey = (String, String);

#[derive(Default)]
struct MetricsInner {
    rings: HashMap<RingKey, VecDeque<MetricSample>>,
    health: HashMap<String, FetchHealth>,
}

pub struct MetricsStore {
    capacity: usize,
    inner: RwLock<MetricsInner>,
}

impl Default for MetricsStore {
    fn default() -> Self {
        Self::new(DEFAULT_RING_CAPACITY)
    }
}

impl MetricsStore {
    /// Create a store retaining at most `capacity` samples per ring.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: RwLock::new(MetricsInner::default()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append provider points to the ring for `(resource_id, metric)`.
    ///
    /// Returns the number of samples retained.
    pub async fn append(&self, resource_id: &str, metric: &str, points: &[MetricPoint]) -> usize {
        let mut points: Vec<_> = points.to_vec();
        points.sort_by_key(|p| p.timestamp);

        let mut inner = self.inner.write().await;
        let ring = inner
            .rings
            .entry((resource_id.to_string(), metric.to_string()))
            .or_default();

        let mut appended = 0;
        for point in points {
            if ring.back().is_some_and(|last| point.timestamp <= last.timestamp) {
                continue;
            }
            if ring.len() == self.capacity {
                ring.pop_front();
            }
            ring.push_back(MetricSample {
                resource_id: resource_id.to_string(),
                metric: metric.to_string(),
                value: point.value,
                timestamp: point.timestamp,
            });
            appended += 1;
        }
        appended
    }

    /// Latest sample of every metric recorded for `resource_id`, by metric name.
    pub async fn latest(&self, resource_id: &str) -> Vec<MetricSample> {
        let inner = self.inner.read().await;
        let mut latest: Vec<_> = inner
            .rings
            .iter()
            .filter(|((resource, _), _)| resource == resource_id)
            .filter_map(|(_, ring)| ring.back().cloned())
            .collect();
        latest.sort_by(|a, b| a.metric.cmp(&b.metric));
        latest
    }

    /// Samples for `resource_id` at or after `since`, ordered by timestamp.
    pub async fn range(&self, resource_id: &str, since: DateTime<Utc>) -> Vec<MetricSample> {
        let inner = self.inner.read().await;
        let mut samples: Vec<_> = inner
            .rings
            .iter()
            .filter(|((resource, _), _)| resource == resource_id)
            .flat_map(|(_, ring)| ring.iter().filter(|s| s.timestamp >= since).cloned())
            .collect();
        samples.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.metric.cmp(&b.metric))
        });
        samples
    }

    /// Samples currently held for one ring, oldest first.
    pub async fn ring(&self, resource_id: &str, metric: &str) -> Vec<MetricSample> {
        self.inner
            .read()
            .await
            .rings
            .get(&(resource_id.to_string(), metric.to_string()))
            .map(|ring| ring.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn mark_fresh(&self, resource_id: &str) {
        let mut inner = self.inner.write().await;
        let health = inner.health.entry(resource_id.to_string()).or_default();
        health.last_success = Some(Utc::now());
        health.stale_since = None;
        health.last_error = None;
    }

    /// Flag `resource_id` as stale. Existing samples are kept.
    pub async fn mark_stale(&self, resource_id: &str, error: impl Into<String>) {
        let mut inner = self.inner.write().await;
        let health = inner.health.entry(resource_id.to_string()).or_default();
        health.stale_since.get_or_insert_with(Utc::now);
        health.last_error = Some(error.into());
    }

    pub async fn health(&self, resource_id: &str) -> FetchHealth {
        self.inner
            .read()
            .await
            .health
            .get(resource_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Drop rings and health for resources not in `live`.
    pub async fn retain_resources(&self, live: &HashSet<String>) -> usize {
        let mut inner = self.inner.write().await;
        let before = inner.rings.len();
        inner.rings.retain(|(resource, _), _| live.contains(resource));
        inner.health.retain(|resource, _| live.contains(resource));
        before - inner.rings.len()
    }
}

/// Parse a range window such as `30s`, `15m`, `1h`, `2d`, or bare seconds.
pub fn parse_window(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(raw.len());
    let (digits, unit) = raw.split_at(split);
    let amount: u64 = digits.parse().ok()?;
    let secs = match unit {
        "" | "s" => amount,
        "m" => amount.checked_mul(60)?,
        "h" => amount.checked_mul(60 * 60)?,
        "d" => amount.checked_mul(24 * 60 * 60)?,
        _ => return None,
    };
    (secs > 0).then(|| Duration::from_secs(secs))
}
