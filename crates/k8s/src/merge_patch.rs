//! JSON merge patches (RFC 7386).
//!
//! Used for objects whose schema is unknown: custom resources and their
//! definitions. Lists are always replaced wholesale and removed fields are
//! expressed as `null`.

use serde_json::{Map, Value};

use crate::{as_document, PatchError};

/// Compute a merge patch transforming `original` into `modified`.
///
/// A `null` document is treated as empty. Identical inputs produce `{}`.
pub fn create_merge_patch(original: &Value, modified: &Value) -> Result<Value, PatchError> {
	let empty = Map::new();
	let original = as_document(original)?.unwrap_or(&empty);
	let modified = as_document(modified)?.unwrap_or(&empty);
	Ok(Value::Object(diff_objects(original, modified)))
}

fn diff_objects(original: &Map<String, Value>, modified: &Map<String, Value>) -> Map<String, Value> {
	let mut patch = Map::new();

	for (key, new_value) in modified {
		match (original.get(key), new_value) {
			(None, _) => {
				patch.insert(key.clone(), new_value.clone());
			}
			(Some(old_value), _) if old_value == new_value => {}
			(Some(Value::Object(old_map)), Value::Object(new_map)) => {
				let nested = diff_objects(old_map, new_map);
				if !nested.is_empty() {
					patch.insert(key.clone(), Value::Object(nested));
				}
			}
			(Some(_), _) => {
				patch.insert(key.clone(), new_value.clone());
			}
		}
	}

	for key in original.keys() {
		if !modified.contains_key(key) {
			patch.insert(key.clone(), Value::Null);
		}
	}

	patch
}

/// Apply a merge patch to `target` in place.
pub fn apply_merge_patch(target: &mut Value, patch: &Value) {
	let Value::Object(patch_map) = patch else {
		*target = patch.clone();
		return;
	};

	if !target.is_object() {
		*target = Value::Object(Map::new());
	}
	let Value::Object(target_map) = target else {
		return;
	};

	for (key, value) in patch_map {
		if value.is_null() {
			target_map.remove(key);
		} else {
			apply_merge_patch(target_map.entry(key.clone()).or_insert(Value::Null), value);
		}
	}
}

#[cfg(test)]
mod tests {
	use rstest::rstest;
	use serde_json::json;

	use super::*;

	#[rstest]
	#[case::identical(
		json!({"spec": {"size": 3}}),
		json!({"spec": {"size": 3}}),
		json!({})
	)]
	#[case::changed_scalar(
		json!({"spec": {"size": 3, "color": "red"}}),
		json!({"spec": {"size": 5, "color": "red"}}),
		json!({"spec": {"size": 5}})
	)]
	#[case::removed_field(
		json!({"spec": {"size": 3, "color": "red"}}),
		json!({"spec": {"size": 3}}),
		json!({"spec": {"color": null}})
	)]
	#[case::array_replaced(
		json!({"spec": {"items": [1, 2, 3]}}),
		json!({"spec": {"items": [1, 3]}}),
		json!({"spec": {"items": [1, 3]}})
	)]
	#[case::object_replaced_by_scalar(
		json!({"spec": {"size": {"value": 3}}}),
		json!({"spec": {"size": 3}}),
		json!({"spec": {"size": 3}})
	)]
	#[case::from_null(
		json!(null),
		json!({"kind": "Widget"}),
		json!({"kind": "Widget"})
	)]
	fn test_create_merge_patch(#[case] original: Value, #[case] modified: Value, #[case] expected: Value) {
		let patch = create_merge_patch(&original, &modified).unwrap();
		assert_eq!(patch, expected);
	}

	#[test]
	fn test_create_merge_patch_rejects_arrays() {
		let err = create_merge_patch(&json!([1]), &json!({})).unwrap_err();
		assert_eq!(err.to_string(), "expected a JSON object document, got array");
	}

	#[test]
	fn test_apply_merge_patch() {
		let mut target = json!({
			"metadata": {"name": "w", "labels": {"a": "1", "b": "2"}},
			"spec": {"items": [1, 2]}
		});
		apply_merge_patch(
			&mut target,
			&json!({
				"metadata": {"labels": {"a": null, "c": "3"}},
				"spec": {"items": [3], "extra": {"x": true}}
			}),
		);
		assert_eq!(
			target,
			json!({
				"metadata": {"name": "w", "labels": {"b": "2", "c": "3"}},
				"spec": {"items": [3], "extra": {"x": true}}
			})
		);
	}

	#[test]
	fn test_created_patch_applies_back() {
		let original = json!({"spec": {"a": 1, "b": {"c": 2, "d": 3}}, "status": "x"});
		let modified = json!({"spec": {"a": 2, "b": {"c": 2}}, "extra": [1]});
		let patch = create_merge_patch(&original, &modified).unwrap();

		let mut patched = original;
		apply_merge_patch(&mut patched, &patch);
		assert_eq!(patched, modified);
	}
}
