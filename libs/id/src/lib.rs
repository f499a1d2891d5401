//! # portal-id
//!
//! Stable ID types for resources managed by the portal control plane.
//!
//! IDs are system-generated and never reused; cluster and deployment names
//! are user-controlled labels that live alongside them.
//!
//! ## ID Format
//!
//! All resource IDs use a prefixed format: `{prefix}_{ulid}`
//!
//! Examples:
//! - `cls_01HV4Z2WQXKJNM8GPQY6VBKC3D`
//! - `dep_01HV4Z3MXNKPQR9HSTZ7WCLD4E`
//! - `op_01HV4Z4NYPLTRS0JTUA8XDME5F`
//!
//! The prefix makes a bare string self-describing in logs and API payloads,
//! and the ULID keeps IDs sortable by creation time.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
