//! [`ResourceMapper`] holding objects in memory.
//!
//! Behaves like a minimal API server: writes bump `resourceVersion`, patches
//! are applied with the same merge semantics the server uses, and failures
//! carry the status reasons a real server would return. Every call is
//! recorded so callers can assert on what was sent.

use std::{
	collections::{HashMap, HashSet},
	sync::{Mutex, MutexGuard, PoisonError},
	time::Duration,
};

use async_trait::async_trait;
use k8s::{apply_merge_patch, apply_strategic_patch, patch_meta, PatchEncoding};
use kube::{core::GroupVersionKind, discovery::ApiResource};
use serde_json::Value;

use super::{ApiError, DeletionPropagation, FieldManager, MapperError, ResourceMapper};
use crate::k8s::{
	manifest::{build_info, gvk_from_manifest, parse_manifests, ManifestError},
	resource::{ResourceId, ResourceInfo, ResourceMapping},
	ResourceList, ResourceScope,
};

const CLUSTER_SCOPED_KINDS: &[&str] = &[
	"Namespace",
	"Node",
	"PersistentVolume",
	"ClusterRole",
	"ClusterRoleBinding",
	"CustomResourceDefinition",
	"StorageClass",
	"PriorityClass",
	"IngressClass",
	"MutatingWebhookConfiguration",
	"ValidatingWebhookConfiguration",
	"APIService",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
	Get,
	Create,
	Patch(PatchEncoding),
	Replace,
	Delete,
}

/// A call received by [`InMemoryMapper`].
#[derive(Debug, Clone)]
pub struct RecordedCall {
	pub verb: Verb,
	pub id: ResourceId,
	pub field_manager: Option<String>,
	/// Patch body for patches, manifest for creates and replaces.
	pub body: Option<Value>,
}

/// Start and end of a call, in the order they happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallEvent {
	Started(Verb, String),
	Finished(Verb, String),
}

/// Objects keyed by (group, kind, namespace, name).
type ObjectKey = (String, String, Option<String>, String);

fn key_of(id: &ResourceId) -> ObjectKey {
	(
		id.group.clone(),
		id.kind.clone(),
		id.namespace.clone(),
		id.name.clone(),
	)
}

#[derive(Default)]
struct State {
	objects: HashMap<ObjectKey, Value>,
	calls: Vec<RecordedCall>,
	events: Vec<CallEvent>,
	/// Remaining writes to reject with a conflict, per object name.
	conflicts: HashMap<String, usize>,
	failing_gets: HashSet<String>,
	failing_patches: HashSet<String>,
	resource_version: u64,
}

impl State {
	fn take_conflict(&mut self, name: &str) -> bool {
		match self.conflicts.get_mut(name) {
			Some(remaining) if *remaining > 0 => {
				*remaining -= 1;
				true
			}
			_ => false,
		}
	}

	fn stamp(&mut self, object: &mut Value) {
		self.resource_version += 1;
		let version = self.resource_version;
		if let Some(metadata) = object.get_mut("metadata").and_then(Value::as_object_mut) {
			metadata.insert("resourceVersion".into(), Value::from(version.to_string()));
			if !metadata.contains_key("uid") {
				metadata.insert("uid".into(), Value::from(format!("uid-{version}")));
			}
		}
	}
}

#[derive(Default)]
pub struct InMemoryMapper {
	state: Mutex<State>,
	/// Artificial latency per kind.
	delays: HashMap<String, Duration>,
	default_namespace: String,
}

fn mapping_for(gvk: &GroupVersionKind) -> ResourceMapping {
	let scope = if CLUSTER_SCOPED_KINDS.contains(&gvk.kind.as_str()) {
		ResourceScope::ClusterWide
	} else {
		ResourceScope::Namespaced
	};
	ResourceMapping {
		api_resource: ApiResource::from_gvk(gvk),
		scope,
	}
}

fn plural(info: &ResourceInfo) -> &str {
	&info.mapping.api_resource.plural
}

impl InMemoryMapper {
	pub fn new() -> Self {
		Self {
			default_namespace: "default".to_string(),
			..Self::default()
		}
	}

	fn lock(&self) -> MutexGuard<'_, State> {
		self.state.lock().unwrap_or_else(PoisonError::into_inner)
	}

	fn state_mut(&mut self) -> &mut State {
		self.state.get_mut().unwrap_or_else(PoisonError::into_inner)
	}

	pub fn with_default_namespace(mut self, namespace: impl Into<String>) -> Self {
		self.default_namespace = namespace.into();
		self
	}

	/// Seed a live object. Manifests that do not describe an object are ignored.
	pub fn with_object(mut self, manifest: Value) -> Self {
		let Some(gvk) = gvk_from_manifest(&manifest) else {
			return self;
		};
		let Ok(info) = build_info(manifest, mapping_for(&gvk), &self.default_namespace) else {
			return self;
		};
		let key = key_of(&info.id);
		let mut object = info.object.into_value();
		let state = self.state_mut();
		state.stamp(&mut object);
		state.objects.insert(key, object);
		self
	}

	/// Make every call on objects of `kind` take `delay`.
	pub fn with_delay(mut self, kind: &str, delay: Duration) -> Self {
		self.delays.insert(kind.to_string(), delay);
		self
	}

	/// Reject the next `count` writes to objects named `name` with a conflict.
	pub fn with_conflicts(mut self, name: &str, count: usize) -> Self {
		self.state_mut().conflicts.insert(name.to_string(), count);
		self
	}

	pub fn with_failing_get(mut self, name: &str) -> Self {
		self.state_mut().failing_gets.insert(name.to_string());
		self
	}

	pub fn with_failing_patch(mut self, name: &str) -> Self {
		self.state_mut().failing_patches.insert(name.to_string());
		self
	}

	/// The stored object with the identity of `id`, ignoring its version.
	pub fn object(&self, id: &ResourceId) -> Option<Value> {
		self.lock().objects.get(&key_of(id)).cloned()
	}

	pub fn object_count(&self) -> usize {
		self.lock().objects.len()
	}

	pub fn calls(&self) -> Vec<RecordedCall> {
		self.lock().calls.clone()
	}

	pub fn events(&self) -> Vec<CallEvent> {
		self.lock().events.clone()
	}

	/// Names of the objects that received `verb`, in call order.
	pub fn names_for(&self, verb: Verb) -> Vec<String> {
		self.lock()
			.calls
			.iter()
			.filter(|call| call.verb == verb)
			.map(|call| call.id.name.clone())
			.collect()
	}

	async fn call<T>(
		&self,
		verb: Verb,
		info: &ResourceInfo,
		field_manager: Option<&FieldManager>,
		body: Option<&Value>,
		f: impl FnOnce(&mut State) -> Result<T, ApiError>,
	) -> Result<T, ApiError> {
		{
			let mut state = self.lock();
			state.events.push(CallEvent::Started(verb, info.id.name.clone()));
			state.calls.push(RecordedCall {
				verb,
				id: info.id.clone(),
				field_manager: field_manager.map(FieldManager::to_string),
				body: body.cloned(),
			});
		}

		if let Some(delay) = self.delays.get(&info.id.kind) {
			tokio::time::sleep(*delay).await;
		}

		let mut state = self.lock();
		let result = f(&mut state);
		state.events.push(CallEvent::Finished(verb, info.id.name.clone()));
		result
	}
}

#[async_trait]
impl ResourceMapper for InMemoryMapper {
	fn default_namespace(&self) -> &str {
		&self.default_namespace
	}

	async fn resolve(&self, manifests: &[u8]) -> Result<ResourceList, MapperError> {
		let mut list = ResourceList::new();
		for document in parse_manifests(manifests)? {
			let gvk = gvk_from_manifest(&document).ok_or(ManifestError::MissingApiVersionOrKind)?;
			list.push(build_info(document, mapping_for(&gvk), &self.default_namespace)?);
		}
		Ok(list)
	}

	async fn get(&self, info: &ResourceInfo) -> Result<Value, ApiError> {
		self.call(Verb::Get, info, None, None, |state| {
			if state.failing_gets.contains(&info.id.name) {
				return Err(ApiError::status(
					500,
					"InternalError",
					format!("injected failure reading {}", info.id.name),
				));
			}
			state
				.objects
				.get(&key_of(&info.id))
				.cloned()
				.ok_or_else(|| ApiError::not_found(plural(info), &info.id.name))
		})
		.await
	}

	async fn create(&self, info: &ResourceInfo, field_manager: &FieldManager) -> Result<Value, ApiError> {
		let body = info.object.value();
		self.call(Verb::Create, info, Some(field_manager), Some(body), |state| {
			if state.take_conflict(&info.id.name) {
				return Err(ApiError::conflict(plural(info), &info.id.name));
			}
			let key = key_of(&info.id);
			if state.objects.contains_key(&key) {
				return Err(ApiError::status(
					409,
					"AlreadyExists",
					format!("{} \"{}\" already exists", plural(info), info.id.name),
				));
			}
			let mut object = body.clone();
			state.stamp(&mut object);
			state.objects.insert(key, object.clone());
			Ok(object)
		})
		.await
	}

	async fn patch(
		&self,
		info: &ResourceInfo,
		body: &Value,
		encoding: PatchEncoding,
		field_manager: &FieldManager,
	) -> Result<Value, ApiError> {
		self.call(Verb::Patch(encoding), info, Some(field_manager), Some(body), |state| {
			if state.take_conflict(&info.id.name) {
				return Err(ApiError::conflict(plural(info), &info.id.name));
			}
			if state.failing_patches.contains(&info.id.name) {
				return Err(ApiError::status(
					500,
					"InternalError",
					format!("injected failure patching {}", info.id.name),
				));
			}
			let key = key_of(&info.id);
			let Some(existing) = state.objects.get(&key).cloned() else {
				return Err(ApiError::not_found(plural(info), &info.id.name));
			};

			let mut patched = match encoding {
				PatchEncoding::Merge => {
					let mut patched = existing;
					apply_merge_patch(&mut patched, body);
					patched
				}
				PatchEncoding::Strategic => {
					let meta = patch_meta::lookup(&info.id.api_version(), &info.id.kind).ok_or_else(|| {
						ApiError::status(
							415,
							"UnsupportedMediaType",
							"the body of the request was in an unknown format",
						)
					})?;
					apply_strategic_patch(&existing, body, meta)
						.map_err(|e| ApiError::status(422, "Invalid", e.to_string()))?
				}
			};
			state.stamp(&mut patched);
			state.objects.insert(key, patched.clone());
			Ok(patched)
		})
		.await
	}

	async fn replace(&self, info: &ResourceInfo, field_manager: &FieldManager) -> Result<Value, ApiError> {
		let body = info.object.value();
		self.call(Verb::Replace, info, Some(field_manager), Some(body), |state| {
			if state.take_conflict(&info.id.name) {
				return Err(ApiError::conflict(plural(info), &info.id.name));
			}
			let key = key_of(&info.id);
			let Some(existing) = state.objects.get(&key) else {
				return Err(ApiError::not_found(plural(info), &info.id.name));
			};
			let mut object = body.clone();
			if let (Some(uid), Some(metadata)) = (
				existing.pointer("/metadata/uid").cloned(),
				object.get_mut("metadata").and_then(Value::as_object_mut),
			) {
				metadata.insert("uid".into(), uid);
			}
			state.stamp(&mut object);
			state.objects.insert(key, object.clone());
			Ok(object)
		})
		.await
	}

	async fn delete(&self, info: &ResourceInfo, _propagation: DeletionPropagation) -> Result<(), ApiError> {
		self.call(Verb::Delete, info, None, None, |state| {
			state
				.objects
				.remove(&key_of(&info.id))
				.map(|_| ())
				.ok_or_else(|| ApiError::not_found(plural(info), &info.id.name))
		})
		.await
	}
}

#[cfg(test)]
mod tests {
	use assert_matches::assert_matches;
	use serde_json::json;

	use super::*;
	use crate::k8s::resource::test_support::config_map;

	#[tokio::test]
	async fn test_writes_bump_resource_version() {
		let mapper = InMemoryMapper::new();
		let info = config_map("a");
		let manager = FieldManager::new("test");

		let created = mapper.create(&info, &manager).await.unwrap();
		let patched = mapper
			.patch(&info, &json!({"data": {"key": "other"}}), PatchEncoding::Merge, &manager)
			.await
			.unwrap();

		assert_eq!(created["metadata"]["resourceVersion"], "1");
		assert_eq!(patched["metadata"]["resourceVersion"], "2");
		assert_eq!(patched["metadata"]["uid"], created["metadata"]["uid"]);
		assert_eq!(patched["data"]["key"], "other");
	}

	#[tokio::test]
	async fn test_create_existing_is_already_exists() {
		let info = config_map("a");
		let mapper = InMemoryMapper::new().with_object(info.object.value().clone());

		let err = mapper.create(&info, &FieldManager::new("test")).await.unwrap_err();
		assert_matches!(err, ApiError::Status { code: 409, ref reason, .. } if reason == "AlreadyExists");
		assert!(!err.is_conflict());
	}

	#[tokio::test]
	async fn test_strategic_patch_unsupported_for_custom_resources() {
		let manifest = json!({
			"apiVersion": "example.com/v1",
			"kind": "Widget",
			"metadata": {"name": "w", "namespace": "default"},
			"spec": {"size": 1}
		});
		let mapper = InMemoryMapper::new().with_object(manifest.clone());
		let info = crate::k8s::resource::test_support::info(manifest);

		let err = mapper
			.patch(&info, &json!({"spec": {"size": 2}}), PatchEncoding::Strategic, &FieldManager::new("test"))
			.await
			.unwrap_err();
		assert_matches!(err, ApiError::Status { code: 415, .. });
	}

	#[tokio::test]
	async fn test_resolve_defaults_namespace_and_scope() {
		let mapper = InMemoryMapper::new().with_default_namespace("team-a");
		let list = mapper
			.resolve(b"apiVersion: v1\nkind: Namespace\nmetadata:\n  name: ns\n---\napiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: cm\n")
			.await
			.unwrap();

		let namespaces: Vec<_> = list.iter().map(|info| info.id.namespace.clone()).collect();
		assert_eq!(namespaces, vec![None, Some("team-a".to_string())]);
	}

	#[tokio::test]
	async fn test_delete_missing_is_not_found() {
		let mapper = InMemoryMapper::new();
		let err = mapper
			.delete(&config_map("gone"), DeletionPropagation::Background)
			.await
			.unwrap_err();
		assert!(err.is_not_found());
	}
}
