//! Object handles and ordered handle lists.

use std::fmt;

use k8s::{patch_meta, PatchMeta};
use kube::{core::GroupVersionKind, discovery::ApiResource};
use serde_json::Value;

use super::ResourceScope;

/// Identity of a single object in the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceId {
	pub group: String,
	pub version: String,
	pub kind: String,
	/// `None` for cluster-scoped objects.
	pub namespace: Option<String>,
	pub name: String,
}

impl ResourceId {
	pub fn gvk(&self) -> GroupVersionKind {
		GroupVersionKind::gvk(&self.group, &self.version, &self.kind)
	}

	pub fn api_version(&self) -> String {
		self.gvk().api_version()
	}

	/// Whether both ids denote the same object.
	///
	/// The version is not compared: an object whose manifest moved to another
	/// version of the same group is still the same object.
	pub fn matches(&self, other: &ResourceId) -> bool {
		self.group == other.group
			&& self.kind == other.kind
			&& self.namespace == other.namespace
			&& self.name == other.name
	}
}

impl fmt::Display for ResourceId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match &self.namespace {
			Some(namespace) => write!(f, "{} {}/{}", self.kind, namespace, self.name),
			None => write!(f, "{} {}", self.kind, self.name),
		}
	}
}

/// How to reach the API endpoint serving an object.
#[derive(Debug, Clone)]
pub struct ResourceMapping {
	pub api_resource: ApiResource,
	pub scope: ResourceScope,
}

/// Manifest payload of a handle.
///
/// Built-in types with known list-merge metadata are `Typed` and get
/// strategic merge patches. Everything else, custom resources included, is
/// `Dynamic` and only ever gets JSON merge patches.
#[derive(Debug, Clone)]
pub enum ObjectBody {
	Typed {
		meta: &'static PatchMeta,
		value: Value,
	},
	Dynamic(Value),
}

impl ObjectBody {
	/// Classify a document by its `apiVersion` and `kind`.
	pub fn classify(value: Value) -> Self {
		let meta = value["apiVersion"]
			.as_str()
			.zip(value["kind"].as_str())
			.and_then(|(api_version, kind)| patch_meta::lookup(api_version, kind));
		match meta {
			Some(meta) => ObjectBody::Typed { meta, value },
			None => ObjectBody::Dynamic(value),
		}
	}

	pub fn value(&self) -> &Value {
		match self {
			ObjectBody::Typed { value, .. } | ObjectBody::Dynamic(value) => value,
		}
	}

	pub fn into_value(self) -> Value {
		match self {
			ObjectBody::Typed { value, .. } | ObjectBody::Dynamic(value) => value,
		}
	}

	pub fn patch_meta(&self) -> Option<&'static PatchMeta> {
		match self {
			ObjectBody::Typed { meta, .. } => Some(*meta),
			ObjectBody::Dynamic(_) => None,
		}
	}

	pub fn is_dynamic(&self) -> bool {
		matches!(self, ObjectBody::Dynamic(_))
	}
}

/// A single object: identity, API binding and manifest.
#[derive(Debug, Clone)]
pub struct ResourceInfo {
	pub id: ResourceId,
	pub mapping: ResourceMapping,
	pub object: ObjectBody,
}

impl ResourceInfo {
	pub fn new(id: ResourceId, mapping: ResourceMapping, object: Value) -> Self {
		Self {
			id,
			mapping,
			object: ObjectBody::classify(object),
		}
	}

	/// Replace the payload with the server's view of the object.
	pub fn refresh(&mut self, live: Value) {
		self.object = ObjectBody::classify(live);
	}

	pub fn annotation(&self, key: &str) -> Option<&str> {
		self.object
			.value()
			.pointer("/metadata/annotations")
			.and_then(|annotations| annotations.get(key))
			.and_then(Value::as_str)
	}
}

/// Ordered list of handles, in manifest declaration order.
///
/// Duplicate identities are kept as they are.
#[derive(Debug, Clone, Default)]
pub struct ResourceList(Vec<ResourceInfo>);

impl ResourceList {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn len(&self) -> usize {
		self.0.len()
	}

	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}

	pub fn push(&mut self, info: ResourceInfo) {
		self.0.push(info);
	}

	pub fn iter(&self) -> std::slice::Iter<'_, ResourceInfo> {
		self.0.iter()
	}

	pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, ResourceInfo> {
		self.0.iter_mut()
	}

	pub fn as_slice(&self) -> &[ResourceInfo] {
		&self.0
	}

	pub(crate) fn as_mut_slice(&mut self) -> &mut [ResourceInfo] {
		&mut self.0
	}

	/// Call `f` on every handle in order, stopping at the first error.
	pub fn visit<E>(&self, mut f: impl FnMut(&ResourceInfo) -> Result<(), E>) -> Result<(), E> {
		self.0.iter().try_for_each(|info| f(info))
	}

	/// First handle denoting the same object as `id`.
	pub fn get(&self, id: &ResourceId) -> Option<&ResourceInfo> {
		self.0.iter().find(|info| info.id.matches(id))
	}

	pub fn contains(&self, id: &ResourceId) -> bool {
		self.get(id).is_some()
	}

	/// Handles of `self` whose object is absent from `other`.
	pub fn difference(&self, other: &ResourceList) -> ResourceList {
		self.0
			.iter()
			.filter(|info| !other.contains(&info.id))
			.cloned()
			.collect()
	}

	/// Handles of `self` whose object is also present in `other`.
	pub fn intersect(&self, other: &ResourceList) -> ResourceList {
		self.0
			.iter()
			.filter(|info| other.contains(&info.id))
			.cloned()
			.collect()
	}
}

impl From<Vec<ResourceInfo>> for ResourceList {
	fn from(infos: Vec<ResourceInfo>) -> Self {
		Self(infos)
	}
}

impl FromIterator<ResourceInfo> for ResourceList {
	fn from_iter<I: IntoIterator<Item = ResourceInfo>>(iter: I) -> Self {
		Self(iter.into_iter().collect())
	}
}

impl Extend<ResourceInfo> for ResourceList {
	fn extend<I: IntoIterator<Item = ResourceInfo>>(&mut self, iter: I) {
		self.0.extend(iter);
	}
}

impl IntoIterator for ResourceList {
	type Item = ResourceInfo;
	type IntoIter = std::vec::IntoIter<ResourceInfo>;

	fn into_iter(self) -> Self::IntoIter {
		self.0.into_iter()
	}
}

impl<'a> IntoIterator for &'a ResourceList {
	type Item = &'a ResourceInfo;
	type IntoIter = std::slice::Iter<'a, ResourceInfo>;

	fn into_iter(self) -> Self::IntoIter {
		self.0.iter()
	}
}

#[cfg(test)]
pub(crate) mod test_support {
	use kube::core::GroupVersionKind;
	use serde_json::{json, Value};

	use super::*;

	/// Build a handle from a manifest, namespaced unless it is a Namespace.
	pub fn info(manifest: Value) -> ResourceInfo {
		let api_version = manifest["apiVersion"].as_str().unwrap().to_string();
		let kind = manifest["kind"].as_str().unwrap().to_string();
		let name = manifest["metadata"]["name"].as_str().unwrap().to_string();
		let (group, version) = api_version.split_once('/').unwrap_or(("", api_version.as_str()));
		let gvk = GroupVersionKind::gvk(group, version, &kind);
		let namespaced = kind != "Namespace";
		let namespace = namespaced.then(|| {
			manifest["metadata"]["namespace"]
				.as_str()
				.unwrap_or("default")
				.to_string()
		});
		ResourceInfo::new(
			ResourceId {
				group: gvk.group.clone(),
				version: gvk.version.clone(),
				kind,
				namespace,
				name,
			},
			ResourceMapping {
				api_resource: ApiResource::from_gvk(&gvk),
				scope: if namespaced {
					ResourceScope::Namespaced
				} else {
					ResourceScope::ClusterWide
				},
			},
			manifest,
		)
	}

	pub fn config_map(name: &str) -> ResourceInfo {
		info(json!({
			"apiVersion": "v1",
			"kind": "ConfigMap",
			"metadata": {"name": name, "namespace": "default"},
			"data": {"key": "value"}
		}))
	}
}
