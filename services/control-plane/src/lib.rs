//! Portal control plane library.
//!
//! This crate primarily ships a `control-plane` binary, but we expose a small
//! library surface to enable integration testing and reuse.

pub mod adapter;
pub mod api;
pub mod config;
pub mod locks;
pub mod metrics;
pub mod model;
pub mod operations;
pub mod reconciler;
pub mod service;
pub mod state;
pub mod store;
