//! Reconciliation loop.
//!
//! Drives every non-terminal operation toward a terminal state by polling the
//! provider, and watches converged resources for drift:
//! - resubmits operations whose last attempt never reached the provider
//! - maps observed provider state onto operations and resources
//! - retries adapter failures with backoff up to the attempt ceiling
//! - marks Ready clusters and Running deployments `Degraded` on drift
//!
//! Resource writes are conditional on the generation recorded by the
//! operation, so a mutation accepted mid-tick is never overwritten.

mod pass;
mod worker;

pub use pass::{ReconcileStats, Reconciler};
pub use worker::ReconcileWorker;
