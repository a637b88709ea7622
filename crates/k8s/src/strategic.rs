//! Strategic merge patches.
//!
//! A three-way patch is computed from three documents:
//! - `original`: what was last applied
//! - `modified`: what should be applied now
//! - `current`: what the server holds right now
//!
//! Changes and additions are taken from `current -> modified`, so fields the
//! server (or another writer) added are left alone. Deletions are taken from
//! `original -> modified`, so only fields this writer owned are removed.
//! Conflicting values are resolved in favour of `modified`.

use serde_json::{Map, Value};

use crate::{
	as_document,
	patch_meta::{ListStrategy, PatchMeta},
	PatchError,
};

const PATCH_DIRECTIVE: &str = "$patch";
const DELETE_FROM_PRIMITIVE_LIST: &str = "$deleteFromPrimitiveList/";

/// Compute a three-way strategic merge patch.
///
/// `null` documents are treated as empty, which is what a missing live object
/// looks like.
pub fn create_three_way_merge_patch(
	original: &Value,
	modified: &Value,
	current: &Value,
	meta: &PatchMeta,
) -> Result<Value, PatchError> {
	let empty = Map::new();
	let original = as_document(original)?.unwrap_or(&empty);
	let modified = as_document(modified)?.unwrap_or(&empty);
	let current = as_document(current)?.unwrap_or(&empty);

	let mut path = Vec::new();
	let delta = Differ {
		meta,
		ignore_deletions: true,
		ignore_changes_and_additions: false,
	}
	.diff_maps(current, modified, &mut path);
	let deletions = Differ {
		meta,
		ignore_deletions: false,
		ignore_changes_and_additions: true,
	}
	.diff_maps(original, modified, &mut path);

	Ok(Value::Object(merge_patch_maps(
		deletions, delta, &mut path, meta,
	)))
}

struct Differ<'m> {
	meta: &'m PatchMeta,
	ignore_deletions: bool,
	ignore_changes_and_additions: bool,
}

impl Differ<'_> {
	fn diff_maps(
		&self,
		original: &Map<String, Value>,
		modified: &Map<String, Value>,
		path: &mut Vec<String>,
	) -> Map<String, Value> {
		let mut patch = Map::new();

		for (key, new_value) in modified {
			let Some(old_value) = original.get(key) else {
				if !self.ignore_changes_and_additions {
					patch.insert(key.clone(), new_value.clone());
				}
				continue;
			};
			if old_value == new_value {
				continue;
			}

			path.push(key.clone());
			match (old_value, new_value) {
				(Value::Object(old_map), Value::Object(new_map)) => {
					let nested = self.diff_maps(old_map, new_map, path);
					if !nested.is_empty() {
						patch.insert(key.clone(), Value::Object(nested));
					}
				}
				(Value::Array(old_items), Value::Array(new_items)) => {
					self.diff_lists(key, old_items, new_items, path, &mut patch);
				}
				_ => {
					if !self.ignore_changes_and_additions {
						patch.insert(key.clone(), new_value.clone());
					}
				}
			}
			path.pop();
		}

		if !self.ignore_deletions {
			for key in original.keys() {
				if !modified.contains_key(key) {
					patch.insert(key.clone(), Value::Null);
				}
			}
		}

		patch
	}

	fn diff_lists(
		&self,
		key: &str,
		original: &[Value],
		modified: &[Value],
		path: &mut Vec<String>,
		patch: &mut Map<String, Value>,
	) {
		match self.meta.list_strategy(path) {
			Some(ListStrategy::MergeByKey(merge_key))
				if has_merge_key(original, merge_key) && has_merge_key(modified, merge_key) =>
			{
				let items = self.diff_keyed_lists(merge_key, original, modified, path);
				if !items.is_empty() {
					patch.insert(key.to_owned(), Value::Array(items));
				}
			}
			Some(ListStrategy::MergePrimitives) => {
				if !self.ignore_changes_and_additions {
					let added = missing_from(modified, original);
					if !added.is_empty() {
						patch.insert(key.to_owned(), Value::Array(added));
					}
				}
				if !self.ignore_deletions {
					let removed = missing_from(original, modified);
					if !removed.is_empty() {
						patch.insert(
							format!("{DELETE_FROM_PRIMITIVE_LIST}{key}"),
							Value::Array(removed),
						);
					}
				}
			}
			_ => {
				if !self.ignore_changes_and_additions {
					patch.insert(key.to_owned(), Value::Array(modified.to_vec()));
				}
			}
		}
	}

	fn diff_keyed_lists(
		&self,
		merge_key: &str,
		original: &[Value],
		modified: &[Value],
		path: &mut Vec<String>,
	) -> Vec<Value> {
		let mut items = Vec::new();

		for new_item in modified {
			let key_value = &new_item[merge_key];
			match find_by_key(original, merge_key, key_value) {
				None => {
					if !self.ignore_changes_and_additions {
						items.push(new_item.clone());
					}
				}
				Some(old_item) if old_item == new_item => {}
				Some(old_item) => {
					if let (Value::Object(old_map), Value::Object(new_map)) = (old_item, new_item) {
						let mut nested = self.diff_maps(old_map, new_map, path);
						if !nested.is_empty() {
							nested.insert(merge_key.to_owned(), key_value.clone());
							items.push(Value::Object(nested));
						}
					}
				}
			}
		}

		if !self.ignore_deletions {
			for old_item in original {
				let key_value = &old_item[merge_key];
				if find_by_key(modified, merge_key, key_value).is_none() {
					items.push(delete_directive(merge_key, key_value));
				}
			}
		}

		items
	}
}

fn has_merge_key(items: &[Value], merge_key: &str) -> bool {
	items.iter().all(|item| item.get(merge_key).is_some())
}

fn find_by_key<'a>(items: &'a [Value], merge_key: &str, key_value: &Value) -> Option<&'a Value> {
	items
		.iter()
		.find(|item| item.get(merge_key) == Some(key_value))
}

fn missing_from(items: &[Value], other: &[Value]) -> Vec<Value> {
	items
		.iter()
		.filter(|item| !other.contains(item))
		.cloned()
		.collect()
}

fn delete_directive(merge_key: &str, key_value: &Value) -> Value {
	let mut directive = Map::new();
	directive.insert(merge_key.to_owned(), key_value.clone());
	directive.insert(PATCH_DIRECTIVE.to_owned(), Value::from("delete"));
	Value::Object(directive)
}

fn is_directive(item: &Value) -> bool {
	item.get(PATCH_DIRECTIVE).is_some()
}

/// Merge two patches, `overlay` winning on scalar conflicts.
fn merge_patch_maps(
	mut base: Map<String, Value>,
	overlay: Map<String, Value>,
	path: &mut Vec<String>,
	meta: &PatchMeta,
) -> Map<String, Value> {
	for (key, value) in overlay {
		path.push(key.clone());
		let merged = match (base.remove(&key), value) {
			(Some(Value::Object(base_map)), Value::Object(overlay_map)) => {
				Value::Object(merge_patch_maps(base_map, overlay_map, path, meta))
			}
			(Some(Value::Array(base_items)), Value::Array(overlay_items)) => {
				Value::Array(merge_patch_lists(base_items, overlay_items, path, meta))
			}
			(_, value) => value,
		};
		path.pop();
		base.insert(key, merged);
	}
	base
}

fn merge_patch_lists(
	mut base: Vec<Value>,
	overlay: Vec<Value>,
	path: &mut Vec<String>,
	meta: &PatchMeta,
) -> Vec<Value> {
	match meta.list_strategy(path) {
		Some(ListStrategy::MergeByKey(merge_key)) => {
			for item in overlay {
				let position = if is_directive(&item) {
					None
				} else {
					item.get(merge_key).and_then(|key_value| {
						base.iter().position(|existing| {
							!is_directive(existing) && existing.get(merge_key) == Some(key_value)
						})
					})
				};
				match (position, item) {
					(Some(index), Value::Object(overlay_map)) => {
						if let Value::Object(base_map) = &mut base[index] {
							*base_map =
								merge_patch_maps(std::mem::take(base_map), overlay_map, path, meta);
						}
					}
					(_, item) => base.push(item),
				}
			}
			base
		}
		Some(ListStrategy::MergePrimitives) => {
			for item in overlay {
				if !base.contains(&item) {
					base.push(item);
				}
			}
			base
		}
		None => overlay,
	}
}

/// Apply a strategic merge patch to `original`, returning the patched document.
pub fn apply_strategic_patch(
	original: &Value,
	patch: &Value,
	meta: &PatchMeta,
) -> Result<Value, PatchError> {
	let empty = Map::new();
	let mut target = as_document(original)?.cloned().unwrap_or_default();
	let patch = as_document(patch)?.unwrap_or(&empty);

	let mut path = Vec::new();
	apply_map(&mut target, patch, &mut path, meta);
	Ok(Value::Object(target))
}

fn apply_map(
	target: &mut Map<String, Value>,
	patch: &Map<String, Value>,
	path: &mut Vec<String>,
	meta: &PatchMeta,
) {
	if patch.get(PATCH_DIRECTIVE).and_then(Value::as_str) == Some("replace") {
		target.clear();
	}

	for (key, value) in patch {
		let Some(field) = key.strip_prefix(DELETE_FROM_PRIMITIVE_LIST) else {
			continue;
		};
		if let (Some(Value::Array(items)), Value::Array(removed)) = (target.get_mut(field), value) {
			items.retain(|item| !removed.contains(item));
		}
	}

	for (key, value) in patch {
		if key.starts_with('$') {
			continue;
		}
		if value.is_null() {
			target.remove(key);
			continue;
		}
		path.push(key.clone());
		let entry = target.entry(key.clone()).or_insert(Value::Null);
		apply_value(entry, value, path, meta);
		path.pop();
	}
}

fn apply_value(target: &mut Value, patch: &Value, path: &mut Vec<String>, meta: &PatchMeta) {
	match patch {
		Value::Object(patch_map) => {
			if !target.is_object() {
				*target = Value::Object(Map::new());
			}
			if let Value::Object(target_map) = target {
				apply_map(target_map, patch_map, path, meta);
			}
		}
		Value::Array(patch_items) => {
			if !target.is_array() {
				*target = Value::Array(Vec::new());
			}
			if let Value::Array(items) = target {
				apply_list(items, patch_items, path, meta);
			}
		}
		other => *target = other.clone(),
	}
}

fn apply_list(target: &mut Vec<Value>, patch: &[Value], path: &mut Vec<String>, meta: &PatchMeta) {
	match meta.list_strategy(path) {
		Some(ListStrategy::MergeByKey(merge_key)) if has_merge_key(patch, merge_key) => {
			for item in patch {
				let key_value = &item[merge_key];
				let position = target
					.iter()
					.position(|existing| existing.get(merge_key) == Some(key_value));
				let delete = item.get(PATCH_DIRECTIVE).and_then(Value::as_str) == Some("delete");
				match (position, delete) {
					(Some(index), true) => {
						target.remove(index);
					}
					(None, true) => {}
					(Some(index), false) => apply_value(&mut target[index], item, path, meta),
					(None, false) => {
						let mut fresh = Value::Null;
						apply_value(&mut fresh, item, path, meta);
						target.push(fresh);
					}
				}
			}
		}
		Some(ListStrategy::MergePrimitives) => {
			for item in patch {
				if !target.contains(item) {
					target.push(item.clone());
				}
			}
		}
		_ => *target = patch.to_vec(),
	}
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;
	use crate::patch_meta::lookup;

	fn deployment_meta() -> &'static PatchMeta {
		lookup("apps/v1", "Deployment").unwrap()
	}

	fn deployment(containers: Value) -> Value {
		json!({
			"apiVersion": "apps/v1",
			"kind": "Deployment",
			"metadata": {"name": "web", "namespace": "default"},
			"spec": {
				"replicas": 1,
				"template": {"spec": {"containers": containers}}
			}
		})
	}

	fn with_server_fields(mut object: Value) -> Value {
		object["metadata"]["uid"] = json!("1234");
		object["metadata"]["resourceVersion"] = json!("42");
		object["status"] = json!({"readyReplicas": 1});
		object
	}

	#[test]
	fn test_unchanged_object_yields_empty_patch() {
		let original = deployment(json!([{"name": "web", "image": "nginx:1"}]));
		let current = with_server_fields(original.clone());

		let patch =
			create_three_way_merge_patch(&original, &original, &current, deployment_meta()).unwrap();
		assert_eq!(patch, json!({}));
	}

	#[test]
	fn test_image_change_is_keyed_by_container_name() {
		let original = deployment(json!([{"name": "web", "image": "nginx:1"}]));
		let modified = deployment(json!([{"name": "web", "image": "nginx:2"}]));
		let current = with_server_fields(original.clone());

		let patch =
			create_three_way_merge_patch(&original, &modified, &current, deployment_meta()).unwrap();
		assert_eq!(
			patch,
			json!({"spec": {"template": {"spec": {"containers": [
				{"name": "web", "image": "nginx:2"}
			]}}}})
		);
	}

	#[test]
	fn test_removed_container_emits_delete_directive() {
		let original = deployment(json!([
			{"name": "web", "image": "nginx:1"},
			{"name": "sidecar", "image": "envoy:1"}
		]));
		let modified = deployment(json!([{"name": "web", "image": "nginx:2"}]));
		let current = with_server_fields(original.clone());

		let patch =
			create_three_way_merge_patch(&original, &modified, &current, deployment_meta()).unwrap();
		assert_eq!(
			patch,
			json!({"spec": {"template": {"spec": {"containers": [
				{"name": "sidecar", "$patch": "delete"},
				{"name": "web", "image": "nginx:2"}
			]}}}})
		);

		let patched = apply_strategic_patch(&current, &patch, deployment_meta()).unwrap();
		assert_eq!(
			patched["spec"]["template"]["spec"]["containers"],
			json!([{"name": "web", "image": "nginx:2"}])
		);
	}

	#[test]
	fn test_removed_env_var_merges_with_changed_image() {
		let original = deployment(json!([{
			"name": "web",
			"image": "nginx:1",
			"env": [{"name": "A", "value": "1"}, {"name": "B", "value": "2"}]
		}]));
		let modified = deployment(json!([{
			"name": "web",
			"image": "nginx:2",
			"env": [{"name": "A", "value": "1"}]
		}]));
		let current = with_server_fields(original.clone());

		let patch =
			create_three_way_merge_patch(&original, &modified, &current, deployment_meta()).unwrap();
		assert_eq!(
			patch,
			json!({"spec": {"template": {"spec": {"containers": [{
				"name": "web",
				"image": "nginx:2",
				"env": [{"name": "B", "$patch": "delete"}]
			}]}}}})
		);

		let patched = apply_strategic_patch(&current, &patch, deployment_meta()).unwrap();
		assert_eq!(
			patched["spec"]["template"]["spec"]["containers"][0]["env"],
			json!([{"name": "A", "value": "1"}])
		);
	}

	#[test]
	fn test_out_of_band_fields_are_preserved() {
		let original = deployment(json!([{"name": "web", "image": "nginx:1"}]));
		let mut current = with_server_fields(original.clone());
		current["metadata"]["annotations"] = json!({"kubectl.kubernetes.io/restartedAt": "now"});

		let patch =
			create_three_way_merge_patch(&original, &original, &current, deployment_meta()).unwrap();
		assert_eq!(patch, json!({}));
	}

	#[test]
	fn test_field_owned_by_previous_apply_is_removed() {
		let mut original = deployment(json!([{"name": "web", "image": "nginx:1"}]));
		original["metadata"]["labels"] = json!({"app": "web", "tier": "frontend"});
		let mut modified = original.clone();
		modified["metadata"]["labels"] = json!({"app": "web"});
		let current = with_server_fields(original.clone());

		let patch =
			create_three_way_merge_patch(&original, &modified, &current, deployment_meta()).unwrap();
		assert_eq!(patch, json!({"metadata": {"labels": {"tier": null}}}));
	}

	#[test]
	fn test_drift_on_live_object_is_reverted() {
		let original = deployment(json!([{"name": "web", "image": "nginx:1"}]));
		let mut current = with_server_fields(original.clone());
		current["spec"]["replicas"] = json!(5);

		let patch =
			create_three_way_merge_patch(&original, &original, &current, deployment_meta()).unwrap();
		assert_eq!(patch, json!({"spec": {"replicas": 1}}));
	}

	#[test]
	fn test_missing_live_object_sends_full_document() {
		let modified = deployment(json!([{"name": "web", "image": "nginx:1"}]));

		let patch =
			create_three_way_merge_patch(&modified, &modified, &Value::Null, deployment_meta())
				.unwrap();
		assert_eq!(patch, modified);
	}

	#[test]
	fn test_finalizers_merge_as_primitive_set() {
		let meta = lookup("v1", "ConfigMap").unwrap();
		let original = json!({"metadata": {"name": "c", "finalizers": ["a", "b"]}});
		let modified = json!({"metadata": {"name": "c", "finalizers": ["a", "c"]}});

		let patch = create_three_way_merge_patch(&original, &modified, &original, meta).unwrap();
		assert_eq!(
			patch,
			json!({"metadata": {
				"finalizers": ["c"],
				"$deleteFromPrimitiveList/finalizers": ["b"]
			}})
		);

		let patched = apply_strategic_patch(&original, &patch, meta).unwrap();
		assert_eq!(patched["metadata"]["finalizers"], json!(["a", "c"]));
	}

	#[test]
	fn test_atomic_list_is_replaced() {
		let original = deployment(json!([{"name": "web", "args": ["a", "b"]}]));
		let modified = deployment(json!([{"name": "web", "args": ["b"]}]));

		let patch =
			create_three_way_merge_patch(&original, &modified, &original, deployment_meta()).unwrap();
		assert_eq!(
			patch,
			json!({"spec": {"template": {"spec": {"containers": [
				{"name": "web", "args": ["b"]}
			]}}}})
		);
	}

	#[test]
	fn test_apply_strips_directives_from_new_items() {
		let current = deployment(json!([{"name": "web", "image": "nginx:1"}]));
		let patch = json!({"spec": {"template": {"spec": {"containers": [
			{"name": "sidecar", "image": "envoy:1", "$setElementOrder/env": []}
		]}}}});

		let patched = apply_strategic_patch(&current, &patch, deployment_meta()).unwrap();
		assert_eq!(
			patched["spec"]["template"]["spec"]["containers"],
			json!([
				{"name": "web", "image": "nginx:1"},
				{"name": "sidecar", "image": "envoy:1"}
			])
		);
	}

	#[test]
	fn test_rejects_non_object_documents() {
		let err =
			create_three_way_merge_patch(&json!("x"), &json!({}), &json!({}), deployment_meta())
				.unwrap_err();
		assert_eq!(err.to_string(), "expected a JSON object document, got string");
	}
}
