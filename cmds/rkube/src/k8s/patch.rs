//! Patch planning for objects that already exist.

use k8s::{create_merge_patch, create_three_way_merge_patch, is_empty_patch, PatchEncoding, PatchError};
use serde_json::Value;
use thiserror::Error;
use tracing::instrument;

use super::{mapper::ResourceMapper, resource::ResourceInfo, ApiError};

#[derive(Debug, Error)]
pub enum PatchPlanError {
	#[error("unable to get data for current object {namespace}/{name}")]
	FetchLive {
		namespace: String,
		name: String,
		#[source]
		source: ApiError,
	},

	#[error("computing patch")]
	Compute(#[source] PatchError),
}

/// Patch bringing a live object to its target manifest.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedPatch {
	pub body: Value,
	pub encoding: PatchEncoding,
}

impl PlannedPatch {
	/// Whether sending the patch would change nothing.
	pub fn is_empty(&self) -> bool {
		is_empty_patch(&self.body)
	}
}

/// Plan the patch taking the object of `target` from `original` to its new manifest.
///
/// Objects with registered merge metadata get a three-way strategic merge
/// patch against the live object. Everything else gets a JSON merge patch
/// computed from `original` and `target` alone.
#[instrument(skip_all, fields(resource = %target.id))]
pub async fn plan_patch(
	mapper: &dyn ResourceMapper,
	target: &ResourceInfo,
	original: &ResourceInfo,
) -> Result<PlannedPatch, PatchPlanError> {
	let live = match mapper.get(target).await {
		Ok(live) => live,
		Err(e) if e.is_not_found() => Value::Null,
		Err(source) => {
			return Err(PatchPlanError::FetchLive {
				namespace: target.id.namespace.clone().unwrap_or_default(),
				name: target.id.name.clone(),
				source,
			})
		}
	};

	let old = original.object.value();
	let new = target.object.value();

	let planned = match target.object.patch_meta() {
		Some(meta) => PlannedPatch {
			body: create_three_way_merge_patch(old, new, &live, meta).map_err(PatchPlanError::Compute)?,
			encoding: PatchEncoding::Strategic,
		},
		None => PlannedPatch {
			body: create_merge_patch(old, new).map_err(PatchPlanError::Compute)?,
			encoding: PatchEncoding::Merge,
		},
	};
	tracing::trace!(encoding = ?planned.encoding, patch = %planned.body, "planned patch");
	Ok(planned)
}

#[cfg(test)]
mod tests {
	use assert_matches::assert_matches;
	use serde_json::json;

	use super::*;
	use crate::k8s::{mapper::InMemoryMapper, resource::test_support::info};

	fn deployment(image: &str) -> Value {
		json!({
			"apiVersion": "apps/v1",
			"kind": "Deployment",
			"metadata": {"name": "web", "namespace": "default"},
			"spec": {
				"replicas": 1,
				"template": {"spec": {"containers": [{"name": "app", "image": image}]}}
			}
		})
	}

	fn widget(size: u32) -> Value {
		json!({
			"apiVersion": "example.com/v1",
			"kind": "Widget",
			"metadata": {"name": "w", "namespace": "default"},
			"spec": {"size": size}
		})
	}

	#[tokio::test]
	async fn test_registered_types_get_strategic_patch() {
		let mapper = InMemoryMapper::new().with_object(deployment("app:v1"));

		let planned = plan_patch(&mapper, &info(deployment("app:v2")), &info(deployment("app:v1")))
			.await
			.unwrap();

		assert_eq!(planned.encoding, PatchEncoding::Strategic);
		assert_eq!(
			planned.body,
			json!({"spec": {"template": {"spec": {"containers": [{"name": "app", "image": "app:v2"}]}}}})
		);
	}

	#[tokio::test]
	async fn test_custom_resources_get_merge_patch() {
		// Live state is ignored on this path
		let mapper = InMemoryMapper::new().with_object(widget(7));

		let planned = plan_patch(&mapper, &info(widget(2)), &info(widget(1))).await.unwrap();

		assert_eq!(planned.encoding, PatchEncoding::Merge);
		assert_eq!(planned.body, json!({"spec": {"size": 2}}));
	}

	#[tokio::test]
	async fn test_unchanged_object_plans_empty_patch() {
		let mapper = InMemoryMapper::new().with_object(deployment("app:v1"));

		let planned = plan_patch(&mapper, &info(deployment("app:v1")), &info(deployment("app:v1")))
			.await
			.unwrap();
		assert!(planned.is_empty());
	}

	#[tokio::test]
	async fn test_missing_live_object_is_treated_as_empty() {
		let mapper = InMemoryMapper::new();

		let planned = plan_patch(&mapper, &info(deployment("app:v1")), &info(deployment("app:v1")))
			.await
			.unwrap();
		assert!(!planned.is_empty());
		assert_eq!(planned.encoding, PatchEncoding::Strategic);
	}

	#[tokio::test]
	async fn test_live_read_failure() {
		let mapper = InMemoryMapper::new()
			.with_object(deployment("app:v1"))
			.with_failing_get("web");

		let err = plan_patch(&mapper, &info(deployment("app:v2")), &info(deployment("app:v1")))
			.await
			.unwrap_err();
		assert_matches!(err, PatchPlanError::FetchLive { ref name, .. } if name == "web");
		assert_eq!(err.to_string(), "unable to get data for current object default/web");
	}
}
