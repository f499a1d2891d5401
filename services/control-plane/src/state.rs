//! Application state shared across request handlers.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::service::OrchestrationService;

/// Completion time of a background worker's most recent tick.
#[derive(Debug, Default)]
pub struct Heartbeat {
    last: Mutex<Option<DateTime<Utc>>>,
}

impl Heartbeat {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn beat(&self) {
        if let Ok(mut last) = self.last.lock() {
            *last = Some(Utc::now());
        }
    }

    pub fn last(&self) -> Option<DateTime<Utc>> {
        self.last.lock().ok().and_then(|last| *last)
    }

    /// Whether the worker completed a tick within `max_age`.
    pub fn is_fresh(&self, max_age: Duration) -> bool {
        let Some(last) = self.last() else {
            return false;
        };
        let max_age = chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::MAX);
        Utc::now().signed_duration_since(last) <= max_age
    }
}

/// A background worker as seen by readiness checks.
#[derive(Debug, Clone)]
pub struct WorkerProbe {
    pub heartbeat: Arc<Heartbeat>,
    pub interval: Duration,
}

impl WorkerProbe {
    pub fn new(heartbeat: Arc<Heartbeat>, interval: Duration) -> Self {
        Self {
            heartbeat,
            interval,
        }
    }

    /// A worker is healthy if it ticked within three of its intervals.
    pub fn is_healthy(&self) -> bool {
        self.heartbeat.is_fresh(self.interval.saturating_mul(3))
    }
}

/// Shared application state.
///
/// This is passed to all request handlers via Axum's state extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    service: Arc<OrchestrationService>,
    reconciler: WorkerProbe,
    aggregator: WorkerProbe,
}

impl AppState {
    pub fn new(
        service: Arc<OrchestrationService>,
        reconciler: WorkerProbe,
        aggregator: WorkerProbe,
    ) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                service,
                reconciler,
                aggregator,
            }),
        }
    }

    pub fn service(&self) -> &OrchestrationService {
        &self.inner.service
    }

    pub fn reconciler(&self) -> &WorkerProbe {
        &self.inner.reconciler
    }

    pub fn aggregator(&self) -> &WorkerProbe {
        &self.inner.aggregator
    }
}
