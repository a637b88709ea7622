//! Manifest parsing.
//!
//! Accepts multi-document YAML (JSON is a subset). Empty documents are
//! skipped and `*List` documents are flattened into their items.

use kube::core::GroupVersionKind;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use super::{
	resource::{ResourceId, ResourceInfo, ResourceMapping},
	ResourceScope,
};

#[derive(Debug, Error)]
pub enum ManifestError {
	#[error("parsing manifest document {index}")]
	Parse {
		index: usize,
		#[source]
		source: serde_yaml::Error,
	},

	#[error("manifest document {index} is not an object")]
	NotAnObject { index: usize },

	#[error("manifest missing apiVersion or kind")]
	MissingApiVersionOrKind,

	#[error("{kind} manifest missing metadata.name")]
	MissingName { kind: String },
}

/// Split a manifest stream into individual object documents.
pub fn parse_manifests(bytes: &[u8]) -> Result<Vec<Value>, ManifestError> {
	let mut documents = Vec::new();

	for (index, document) in serde_yaml::Deserializer::from_slice(bytes).enumerate() {
		let value = Value::deserialize(document).map_err(|source| ManifestError::Parse { index, source })?;
		match value {
			Value::Null => {}
			Value::Object(_) => flatten_into(value, &mut documents),
			_ => return Err(ManifestError::NotAnObject { index }),
		}
	}

	Ok(documents)
}

fn flatten_into(value: Value, documents: &mut Vec<Value>) {
	let is_list = value["kind"].as_str().is_some_and(|kind| kind.ends_with("List"))
		&& value["items"].is_array();
	if !is_list {
		documents.push(value);
		return;
	}
	if let Value::Object(mut map) = value {
		if let Some(Value::Array(items)) = map.remove("items") {
			for item in items {
				flatten_into(item, documents);
			}
		}
	}
}

/// Extract a GroupVersionKind from a Kubernetes manifest.
pub fn gvk_from_manifest(manifest: &Value) -> Option<GroupVersionKind> {
	let api_version = manifest.get("apiVersion")?.as_str()?;
	let kind = manifest.get("kind")?.as_str()?;
	let (group, version) = api_version.split_once('/').unwrap_or(("", api_version));
	Some(GroupVersionKind::gvk(group, version, kind))
}

/// Build a handle for `manifest`.
///
/// Namespaced objects without a namespace get `default_namespace`, both in
/// the handle's identity and in the manifest itself. Cluster-scoped objects
/// lose any namespace they declare.
pub fn build_info(
	mut manifest: Value,
	mapping: ResourceMapping,
	default_namespace: &str,
) -> Result<ResourceInfo, ManifestError> {
	let gvk = gvk_from_manifest(&manifest).ok_or(ManifestError::MissingApiVersionOrKind)?;
	let name = manifest
		.pointer("/metadata/name")
		.and_then(Value::as_str)
		.filter(|name| !name.is_empty())
		.ok_or_else(|| ManifestError::MissingName {
			kind: gvk.kind.clone(),
		})?
		.to_string();

	let namespace = match mapping.scope {
		ResourceScope::Namespaced => {
			let namespace = manifest
				.pointer("/metadata/namespace")
				.and_then(Value::as_str)
				.filter(|ns| !ns.is_empty())
				.unwrap_or(default_namespace)
				.to_string();
			if let Some(metadata) = manifest.get_mut("metadata").and_then(Value::as_object_mut) {
				metadata.insert("namespace".into(), Value::from(namespace.clone()));
			}
			Some(namespace)
		}
		ResourceScope::ClusterWide => {
			if let Some(metadata) = manifest.get_mut("metadata").and_then(Value::as_object_mut) {
				metadata.remove("namespace");
			}
			None
		}
	};

	let id = ResourceId {
		group: gvk.group,
		version: gvk.version,
		kind: gvk.kind,
		namespace,
		name,
	};
	Ok(ResourceInfo::new(id, mapping, manifest))
}

#[cfg(test)]
mod tests {
	use assert_matches::assert_matches;
	use indoc::indoc;
	use kube::discovery::ApiResource;
	use serde_json::json;

	use super::*;

	fn mapping(scope: ResourceScope) -> ResourceMapping {
		ResourceMapping {
			api_resource: ApiResource::from_gvk(&GroupVersionKind::gvk("", "v1", "ConfigMap")),
			scope,
		}
	}

	#[test]
	fn test_parse_multi_document_stream() {
		let docs = parse_manifests(
			indoc! {"
				apiVersion: v1
				kind: ConfigMap
				metadata:
				  name: a
				---
				---
				apiVersion: v1
				kind: List
				items:
				  - apiVersion: v1
				    kind: Secret
				    metadata:
				      name: b
				  - apiVersion: v1
				    kind: Service
				    metadata:
				      name: c
			"}
			.as_bytes(),
		)
		.unwrap();

		let names: Vec<_> = docs
			.iter()
			.map(|d| d["metadata"]["name"].as_str().unwrap())
			.collect();
		assert_eq!(names, vec!["a", "b", "c"]);
	}

	#[test]
	fn test_parse_rejects_scalars() {
		let err = parse_manifests(b"just a string").unwrap_err();
		assert_matches!(err, ManifestError::NotAnObject { index: 0 });
	}

	#[test]
	fn test_parse_reports_syntax_errors() {
		let err = parse_manifests(b"a: 1\n---\na: [\n").unwrap_err();
		assert_matches!(err, ManifestError::Parse { .. });
	}

	#[test]
	fn test_build_info_defaults_namespace() {
		let info = build_info(
			json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "a"}}),
			mapping(ResourceScope::Namespaced),
			"team-a",
		)
		.unwrap();

		assert_eq!(info.id.namespace.as_deref(), Some("team-a"));
		assert_eq!(info.object.value()["metadata"]["namespace"], "team-a");
	}

	#[test]
	fn test_build_info_cluster_scoped_drops_namespace() {
		let info = build_info(
			json!({"apiVersion": "v1", "kind": "Namespace", "metadata": {"name": "a", "namespace": "x"}}),
			mapping(ResourceScope::ClusterWide),
			"default",
		)
		.unwrap();

		assert_eq!(info.id.namespace, None);
		assert!(info.object.value()["metadata"].get("namespace").is_none());
	}

	#[test]
	fn test_build_info_requires_name() {
		let err = build_info(
			json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {}}),
			mapping(ResourceScope::Namespaced),
			"default",
		)
		.unwrap_err();
		assert_matches!(err, ManifestError::MissingName { kind } if kind == "ConfigMap");
	}

	#[test]
	fn test_gvk_from_manifest_core_api() {
		let gvk = gvk_from_manifest(&json!({"apiVersion": "v1", "kind": "ConfigMap"})).unwrap();
		assert_eq!(gvk.group, "");
		assert_eq!(gvk.version, "v1");
		assert_eq!(gvk.api_version(), "v1");
		assert!(gvk_from_manifest(&json!({"kind": "Deployment"})).is_none());
	}
}
