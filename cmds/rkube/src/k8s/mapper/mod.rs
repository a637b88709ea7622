//! Cluster access for reconciliation.
//!
//! [`ResourceMapper`] resolves manifests into handles and performs single
//! object reads and writes. [`KubeMapper`] talks to a real API server,
//! [`InMemoryMapper`] keeps objects in memory.

mod cluster;
mod memory;

use std::{fmt, path::Path};

use async_trait::async_trait;
use k8s::PatchEncoding;
use kube::{
	api::{Api, DynamicObject, PropagationPolicy},
	Client,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub use self::{
	cluster::KubeMapper,
	memory::{CallEvent, InMemoryMapper, RecordedCall, Verb},
};
use super::{discovery::DiscoveryError, manifest::ManifestError, resource::ResourceInfo, ResourceList, ResourceScope};

/// Failure of a single API call.
#[derive(Debug, Error)]
pub enum ApiError {
	/// The server answered with a `Status` failure.
	#[error("{message}")]
	Status {
		code: u16,
		reason: String,
		message: String,
	},

	#[error("kubernetes API request failed")]
	Transport(#[source] Box<kube::Error>),

	#[error("converting object")]
	Serialization(#[source] serde_json::Error),
}

impl ApiError {
	pub fn status(code: u16, reason: &str, message: impl Into<String>) -> Self {
		ApiError::Status {
			code,
			reason: reason.to_string(),
			message: message.into(),
		}
	}

	pub fn not_found(resource: &str, name: &str) -> Self {
		Self::status(404, "NotFound", format!("{resource} \"{name}\" not found"))
	}

	pub fn conflict(resource: &str, name: &str) -> Self {
		Self::status(
			409,
			"Conflict",
			format!(
				"Operation cannot be fulfilled on {resource} \"{name}\": the object has been modified; \
				 please apply your changes to the latest version and try again"
			),
		)
	}

	fn has_reason(&self, expected_reason: &str, expected_code: u16) -> bool {
		match self {
			ApiError::Status { code, reason, .. } => {
				reason == expected_reason || (reason.is_empty() && *code == expected_code)
			}
			_ => false,
		}
	}

	pub fn is_not_found(&self) -> bool {
		self.has_reason("NotFound", 404)
	}

	pub fn is_conflict(&self) -> bool {
		self.has_reason("Conflict", 409)
	}
}

impl From<kube::Error> for ApiError {
	fn from(error: kube::Error) -> Self {
		match error {
			kube::Error::Api(status) => ApiError::Status {
				code: status.code,
				reason: status.reason.clone(),
				message: status.message.clone(),
			},
			other => ApiError::Transport(Box::new(other)),
		}
	}
}

#[derive(Debug, Error)]
pub enum MapperError {
	#[error(transparent)]
	Manifest(#[from] ManifestError),

	#[error("unknown resource type: {api_version}/{kind}")]
	UnknownResourceType { api_version: String, kind: String },

	#[error("building API resource cache")]
	Discovery(#[source] Box<DiscoveryError>),
}

/// Name recorded as the owner of the fields written by this client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldManager(String);

impl FieldManager {
	/// An explicit manager name. Empty names fall back to [`FieldManager::from_process`].
	pub fn new(name: impl Into<String>) -> Self {
		let name = name.into();
		if name.is_empty() {
			return Self::from_process();
		}
		Self(name)
	}

	/// Base name of the running executable, or `unknown`.
	pub fn from_process() -> Self {
		let name = std::env::args_os()
			.next()
			.and_then(|argv0| Path::new(&argv0).file_name().map(|n| n.to_string_lossy().into_owned()))
			.filter(|name| !name.is_empty())
			.unwrap_or_else(|| "unknown".to_string());
		Self(name)
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl Default for FieldManager {
	fn default() -> Self {
		Self::from_process()
	}
}

impl fmt::Display for FieldManager {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

/// What happens to dependents of a deleted object.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
pub enum DeletionPropagation {
	/// Delete the object now, dependents are collected in the background.
	#[default]
	Background,
	/// Delete dependents before the object.
	Foreground,
	/// Leave dependents behind.
	Orphan,
}

impl From<DeletionPropagation> for PropagationPolicy {
	fn from(propagation: DeletionPropagation) -> Self {
		match propagation {
			DeletionPropagation::Background => PropagationPolicy::Background,
			DeletionPropagation::Foreground => PropagationPolicy::Foreground,
			DeletionPropagation::Orphan => PropagationPolicy::Orphan,
		}
	}
}

/// Single-object cluster operations.
///
/// Every write returns the server's view of the object after the write.
#[async_trait]
pub trait ResourceMapper: Send + Sync {
	/// Namespace given to namespaced objects that declare none.
	fn default_namespace(&self) -> &str;

	/// Parse a manifest stream and bind every object to its API endpoint.
	async fn resolve(&self, manifests: &[u8]) -> Result<ResourceList, MapperError>;

	async fn get(&self, info: &ResourceInfo) -> Result<Value, ApiError>;

	async fn create(&self, info: &ResourceInfo, field_manager: &FieldManager) -> Result<Value, ApiError>;

	async fn patch(
		&self,
		info: &ResourceInfo,
		body: &Value,
		encoding: PatchEncoding,
		field_manager: &FieldManager,
	) -> Result<Value, ApiError>;

	/// Overwrite the live object with the handle's manifest.
	async fn replace(&self, info: &ResourceInfo, field_manager: &FieldManager) -> Result<Value, ApiError>;

	async fn delete(&self, info: &ResourceInfo, propagation: DeletionPropagation) -> Result<(), ApiError>;
}

/// Dynamic API bound to the handle's endpoint and namespace.
pub(crate) fn dynamic_api(client: &Client, info: &ResourceInfo) -> Api<DynamicObject> {
	let api_resource = &info.mapping.api_resource;
	match (info.mapping.scope, info.id.namespace.as_deref()) {
		(ResourceScope::Namespaced, Some(namespace)) => {
			Api::namespaced_with(client.clone(), namespace, api_resource)
		}
		_ => Api::all_with(client.clone(), api_resource),
	}
}
