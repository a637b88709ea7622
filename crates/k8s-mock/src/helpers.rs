//! Helper functions for mock Kubernetes testing.

use serde_json::json;
use wiremock::ResponseTemplate;

/// A `metav1.Status` failure response.
pub fn status_response(code: u16, reason: &str, message: impl Into<String>) -> ResponseTemplate {
	ResponseTemplate::new(code).set_body_json(json!({
		"kind": "Status",
		"apiVersion": "v1",
		"metadata": {},
		"status": "Failure",
		"message": message.into(),
		"reason": reason,
		"code": code
	}))
}

pub fn not_found(resource: &str, name: &str) -> ResponseTemplate {
	status_response(404, "NotFound", format!("{resource} \"{name}\" not found"))
}

pub fn conflict(resource: &str, name: &str) -> ResponseTemplate {
	status_response(
		409,
		"Conflict",
		format!(
			"Operation cannot be fulfilled on {resource} \"{name}\": the object has been modified; \
			 please apply your changes to the latest version and try again"
		),
	)
}

/// Parse a Kubernetes API path into (api_path, resource_name).
///
/// Examples:
/// - `/api/v1/namespaces/default/configmaps/my-config` -> (`/api/v1/namespaces/default/configmaps`, `my-config`)
/// - `/api/v1/namespaces/my-ns` -> (`/api/v1/namespaces`, `my-ns`)
pub fn parse_resource_path(path: &str) -> (String, String) {
	let path = path.trim_end_matches('/');
	match path.rsplit_once('/') {
		Some((api_path, name)) => (api_path.to_string(), name.to_string()),
		None => (path.to_string(), String::new()),
	}
}

/// Path segments after the `/api/<version>` or `/apis/<group>/<version>` prefix.
fn resource_segments(path: &str) -> Vec<&str> {
	let rest = if let Some(rest) = path.strip_prefix("/api/") {
		rest.split_once('/').map(|(_, rest)| rest)
	} else if let Some(rest) = path.strip_prefix("/apis/") {
		rest.splitn(3, '/').nth(2)
	} else {
		None
	};
	rest.unwrap_or_default()
		.split('/')
		.filter(|s| !s.is_empty())
		.collect()
}

/// Whether `path` addresses a collection rather than a single object.
pub fn is_collection_path(path: &str) -> bool {
	matches!(resource_segments(path).as_slice(), [_] | ["namespaces", _, _])
}

/// Plural resource name addressed by a single-object or collection path.
pub fn plural_of(path: &str) -> &str {
	match resource_segments(path).as_slice() {
		[plural] | [plural, _] | ["namespaces", _, plural] | ["namespaces", _, plural, _] => {
			*plural
		}
		_ => "",
	}
}

/// Extract a cluster-wide path from a namespaced API path.
///
/// Examples:
/// - `/api/v1/namespaces/default/configmaps` -> Some(`/api/v1/configmaps`)
/// - `/api/v1/namespaces` -> None
pub fn extract_cluster_wide_path(path: &str) -> Option<String> {
	let (before_ns, after_ns) = path.split_once("/namespaces/")?;
	let (_, resource_type) = after_ns.split_once('/')?;
	Some(format!("{before_ns}/{resource_type}"))
}
