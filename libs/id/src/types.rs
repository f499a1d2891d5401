//! Typed ID definitions for control plane resources.

use crate::define_id;

// =============================================================================
// Managed Resources
// =============================================================================

define_id!(ClusterId, "cls");
define_id!(DeploymentId, "dep");
define_id!(TemplateId, "tpl");

// =============================================================================
// Tracking
// =============================================================================

define_id!(OperationId, "op");
define_id!(RequestId, "req");

// =============================================================================
// Tests
// =============================================================================
