//! Resource reconciliation against a Kubernetes cluster.
//!
//! The entry point is [`engine::ReconcileEngine`], which drives a live cluster
//! towards a desired [`resource::ResourceList`]. Cluster access goes through the
//! [`mapper::ResourceMapper`] trait so the reconciliation logic can run against
//! an in-memory backend in tests.

pub mod batch;
pub mod client;
pub mod discovery;
pub mod engine;
mod error;
pub mod manifest;
pub mod mapper;
pub mod patch;
pub mod resource;
pub mod retry;
pub mod update;
pub mod wait;

pub use engine::{Partial, ReconcileEngine, ReconcileResult};
pub use mapper::{ApiError, DeletionPropagation, FieldManager, ResourceMapper};
pub use resource::{ResourceId, ResourceInfo, ResourceList};

/// Kubernetes API resource scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceScope {
	/// Resource is namespaced (e.g., Deployment, ConfigMap).
	Namespaced,

	/// Resource is cluster-wide (e.g., Namespace, ClusterRole).
	ClusterWide,
}

/// Annotation controlling what happens to an object when it leaves the desired set.
pub const RESOURCE_POLICY_ANNOTATION: &str = "helm.sh/resource-policy";

/// [`RESOURCE_POLICY_ANNOTATION`] value that prevents deletion.
pub const KEEP_POLICY: &str = "keep";
