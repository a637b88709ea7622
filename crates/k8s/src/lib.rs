//! Patch computation for Kubernetes objects.
//!
//! This crate knows nothing about clusters or HTTP. It provides:
//! - generic JSON merge patches ([`merge_patch`]), used for objects whose schema
//!   is not known ahead of time
//! - a static registry of list-merge metadata for built-in kinds ([`patch_meta`])
//! - three-way strategic merge patches driven by that metadata ([`strategic`])

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod merge_patch;
pub mod patch_meta;
pub mod strategic;

pub use merge_patch::{apply_merge_patch, create_merge_patch};
pub use patch_meta::{ListStrategy, PatchMeta};
pub use strategic::{apply_strategic_patch, create_three_way_merge_patch};

/// Wire encoding of a computed patch body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchEncoding {
	/// RFC 7386 JSON merge patch.
	Merge,
	/// Kubernetes strategic merge patch.
	Strategic,
}

impl PatchEncoding {
	/// Content type the API server expects for this encoding.
	pub fn content_type(self) -> &'static str {
		match self {
			PatchEncoding::Merge => "application/merge-patch+json",
			PatchEncoding::Strategic => "application/strategic-merge-patch+json",
		}
	}

	/// Parse a request content type, ignoring parameters such as `charset`.
	pub fn from_content_type(content_type: &str) -> Option<Self> {
		let essence = content_type.split(';').next().unwrap_or_default().trim();
		match essence {
			"application/merge-patch+json" => Some(PatchEncoding::Merge),
			"application/strategic-merge-patch+json" => Some(PatchEncoding::Strategic),
			_ => None,
		}
	}
}

/// Errors produced while computing or applying patches.
#[derive(Debug, thiserror::Error)]
pub enum PatchError {
	#[error("expected a JSON object document, got {0}")]
	NotAnObject(&'static str),
}

/// Borrow `value` as a JSON object, treating `null` as an empty document.
pub(crate) fn as_document(value: &Value) -> Result<Option<&serde_json::Map<String, Value>>, PatchError> {
	match value {
		Value::Object(map) => Ok(Some(map)),
		Value::Null => Ok(None),
		other => Err(PatchError::NotAnObject(json_type_name(other))),
	}
}

pub(crate) fn json_type_name(value: &Value) -> &'static str {
	match value {
		Value::Null => "null",
		Value::Bool(_) => "boolean",
		Value::Number(_) => "number",
		Value::String(_) => "string",
		Value::Array(_) => "array",
		Value::Object(_) => "object",
	}
}

/// Whether a patch body has no effect when sent to the server.
pub fn is_empty_patch(patch: &Value) -> bool {
	match patch {
		Value::Null => true,
		Value::Object(map) => map.is_empty(),
		_ => false,
	}
}
