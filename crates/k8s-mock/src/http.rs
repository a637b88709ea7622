//! HTTP-based mock Kubernetes server using wiremock.
//!
//! This provides a real HTTP server that can be used with actual kubeconfig-based
//! connections, unlike the tower mock which only works with in-process clients.

use std::{
	collections::{HashMap, HashSet},
	sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use bon::Builder;
use k8s::{apply_merge_patch, apply_strategic_patch, patch_meta, PatchEncoding};
use kube::config::{
	AuthInfo, Cluster, Context, Kubeconfig, NamedAuthInfo, NamedCluster, NamedContext,
};
use serde_json::{json, Value};
use tracing::{debug, trace};
use wiremock::{
	matchers::{header_regex, method, path, path_regex},
	Mock, MockServer, Request, ResponseTemplate,
};

use super::{
	discovery::{DiscoveryMode, MockApiResource, MockDiscovery},
	helpers::{
		conflict, extract_cluster_wide_path, is_collection_path, not_found, parse_resource_path,
		plural_of, status_response,
	},
};

/// Objects keyed by (collection path, name).
type ObjectStore = HashMap<(String, String), Value>;

#[derive(Default)]
struct ServerState {
	objects: ObjectStore,
	/// Remaining writes to reject with a conflict, per object name.
	conflicts: HashMap<String, usize>,
	failing_gets: HashSet<String>,
	resource_version: u64,
}

type SharedState = Arc<Mutex<ServerState>>;

fn lock(state: &SharedState) -> MutexGuard<'_, ServerState> {
	state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ServerState {
	fn take_conflict(&mut self, name: &str) -> bool {
		match self.conflicts.get_mut(name) {
			Some(remaining) if *remaining > 0 => {
				*remaining -= 1;
				true
			}
			_ => false,
		}
	}

	/// Assign a fresh resourceVersion, and a uid if the object has none.
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

/// A mock Kubernetes server exposed over HTTP.
#[derive(Builder)]
pub struct HttpMockK8sServer {
	#[builder(default)]
	discovery_mode: DiscoveryMode,
	/// Resources to serve as raw manifests. The server derives API paths from
	/// apiVersion/kind using the discovery data.
	#[builder(default)]
	resources: Vec<Value>,
	/// Number of writes to reject with `409 Conflict`, per object name.
	#[builder(default)]
	conflicts: HashMap<String, usize>,
	/// Object names whose reads fail with `500 InternalError`.
	#[builder(default)]
	failing_gets: Vec<String>,
}

/// A running HTTP mock server instance.
pub struct RunningHttpMockK8sServer {
	server: MockServer,
	state: SharedState,
}

impl HttpMockK8sServer {
	/// Start the mock server with all configured resources.
	pub async fn start(self) -> RunningHttpMockK8sServer {
		let server = MockServer::start().await;
		let discovery = MockDiscovery::default();

		debug!(uri = %server.uri(), "Started mock K8s server");

		let mut state = ServerState {
			conflicts: self.conflicts,
			failing_gets: self.failing_gets.into_iter().collect(),
			..ServerState::default()
		};

		let default_namespace = json!({
			"apiVersion": "v1",
			"kind": "Namespace",
			"metadata": {"name": "default"}
		});
		for mut manifest in std::iter::once(default_namespace).chain(self.resources) {
			if let Some(key) = api_path_for_manifest(&manifest, &discovery) {
				trace!(api_path = %key.0, name = %key.1, "Registered resource");
				state.stamp(&mut manifest);
				state.objects.insert(key, manifest);
			}
		}

		let state = Arc::new(Mutex::new(state));

		mount_version(&server).await;
		mount_discovery(&server, &discovery, self.discovery_mode).await;
		mount_resources(&server, &state).await;

		RunningHttpMockK8sServer { server, state }
	}
}

/// Derive the (collection path, name) key for a manifest using discovery data.
pub fn api_path_for_manifest(manifest: &Value, discovery: &MockDiscovery) -> Option<(String, String)> {
	let api_version = manifest.get("apiVersion")?.as_str()?;
	let kind = manifest.get("kind")?.as_str()?;
	let name = manifest.pointer("/metadata/name")?.as_str()?.to_string();
	let namespace = manifest
		.pointer("/metadata/namespace")
		.and_then(Value::as_str)
		.unwrap_or("default");

	let resource = discovery.find(api_version, kind)?;
	let root = if api_version.contains('/') {
		format!("/apis/{api_version}")
	} else {
		format!("/api/{api_version}")
	};
	let path = if resource.namespaced {
		format!("{root}/namespaces/{namespace}/{}", resource.name)
	} else {
		format!("{root}/{}", resource.name)
	};

	Some((path, name))
}

impl RunningHttpMockK8sServer {
	/// Get the server's URI (e.g., "http://127.0.0.1:12345").
	pub fn uri(&self) -> String {
		self.server.uri()
	}

	/// The stored object at `api_path` (the collection path) with `name`.
	pub fn stored(&self, api_path: &str, name: &str) -> Option<Value> {
		lock(&self.state)
			.objects
			.get(&(api_path.to_string(), name.to_string()))
			.cloned()
	}

	/// Paths of all received requests with the given HTTP method, in arrival order.
	pub async fn requests(&self, http_method: &str) -> Vec<String> {
		self.server
			.received_requests()
			.await
			.unwrap_or_default()
			.into_iter()
			.filter(|req| req.method.as_str() == http_method)
			.map(|req| req.url.path().to_string())
			.collect()
	}

	/// Content types of all received PATCH requests to `path`, in arrival order.
	pub async fn patch_content_types(&self, object_path: &str) -> Vec<String> {
		self.server
			.received_requests()
			.await
			.unwrap_or_default()
			.into_iter()
			.filter(|req| req.method.as_str() == "PATCH" && req.url.path() == object_path)
			.filter_map(|req| {
				req.headers
					.get("content-type")
					.and_then(|v| v.to_str().ok())
					.map(str::to_string)
			})
			.collect()
	}

	/// Create a Kubeconfig pointing to this mock server.
	pub fn kubeconfig(&self) -> Kubeconfig {
		self.kubeconfig_with_context("mock-context")
	}

	/// Create a Kubeconfig pointing to this mock server with a custom context name.
	pub fn kubeconfig_with_context(&self, context_name: &str) -> Kubeconfig {
		let cluster_name = "mock-cluster";
		let user_name = "mock-user";

		Kubeconfig {
			clusters: vec![NamedCluster {
				name: cluster_name.to_string(),
				cluster: Some(Cluster {
					server: Some(self.uri()),
					insecure_skip_tls_verify: Some(true),
					..Default::default()
				}),
			}],
			contexts: vec![NamedContext {
				name: context_name.to_string(),
				context: Some(Context {
					cluster: cluster_name.to_string(),
					user: Some(user_name.to_string()),
					namespace: Some("default".to_string()),
					..Default::default()
				}),
			}],
			auth_infos: vec![NamedAuthInfo {
				name: user_name.to_string(),
				auth_info: Some(AuthInfo::default()),
			}],
			current_context: Some(context_name.to_string()),
			..Default::default()
		}
	}
}

async fn mount_version(server: &MockServer) {
	Mock::given(method("GET"))
		.and(path("/version"))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({
			"major": "1",
			"minor": "31",
			"gitVersion": "v1.31.0",
			"gitCommit": "fake",
			"gitTreeState": "clean",
			"buildDate": "2024-08-13T00:00:00Z",
			"goVersion": "go1.22.5",
			"compiler": "gc",
			"platform": "linux/amd64"
		})))
		.mount(server)
		.await;
}

fn aggregated_resource(resource: &MockApiResource, group: &str, version: &str) -> Value {
	json!({
		"resource": resource.name,
		"responseKind": {"group": group, "version": version, "kind": resource.kind},
		"scope": resource.scope(),
		"verbs": resource.verbs,
	})
}

fn legacy_resource(resource: &MockApiResource) -> Value {
	json!({
		"name": resource.name,
		"singularName": "",
		"namespaced": resource.namespaced,
		"kind": resource.kind,
		"verbs": resource.verbs,
	})
}

fn aggregated_list(items: Vec<Value>) -> Vec<u8> {
	let body = json!({
		"kind": "APIGroupDiscoveryList",
		"apiVersion": "apidiscovery.k8s.io/v2",
		"items": items
	});
	// Serializing a `Value` cannot fail.
	serde_json::to_vec(&body).unwrap_or_default()
}

async fn mount_discovery(server: &MockServer, discovery: &MockDiscovery, mode: DiscoveryMode) {
	// The Content-Type must indicate aggregated discovery format for clients to parse it
	const AGGREGATED_DISCOVERY_CONTENT_TYPE: &str =
		"application/json;g=apidiscovery.k8s.io;v=v2;as=APIGroupDiscoveryList";

	match mode {
		DiscoveryMode::Aggregated => {
			let core_resources: Vec<_> = discovery
				.core_resources
				.iter()
				.map(|r| aggregated_resource(r, "", "v1"))
				.collect();
			let core_body = aggregated_list(vec![json!({
				"metadata": {"name": ""},
				"versions": [{"version": "v1", "resources": core_resources, "freshness": "Current"}]
			})]);

			let groups = discovery
				.group_resources
				.iter()
				.map(|(gv, rs)| {
					let (group, version) = gv.split_once('/').unwrap_or(("", gv));
					let resources: Vec<_> = rs
						.iter()
						.map(|r| aggregated_resource(r, group, version))
						.collect();
					json!({
						"metadata": {"name": group},
						"versions": [{"version": version, "resources": resources, "freshness": "Current"}]
					})
				})
				.collect();
			let apis_body = aggregated_list(groups);

			for (endpoint, body) in [("/api", core_body), ("/apis", apis_body)] {
				Mock::given(method("GET"))
					.and(path(endpoint))
					.and(header_regex("accept", "apidiscovery"))
					.respond_with(
						ResponseTemplate::new(200).set_body_raw(body, AGGREGATED_DISCOVERY_CONTENT_TYPE),
					)
					.mount(server)
					.await;
			}
		}
		DiscoveryMode::Legacy => {
			for endpoint in ["/api", "/apis"] {
				Mock::given(method("GET"))
					.and(path(endpoint))
					.and(header_regex("accept", "apidiscovery"))
					.respond_with(ResponseTemplate::new(406))
					.mount(server)
					.await;
			}
		}
	}

	Mock::given(method("GET"))
		.and(path("/api"))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({
			"kind": "APIVersions",
			"versions": ["v1"],
			"serverAddressByClientCIDRs": []
		})))
		.mount(server)
		.await;

	let groups: Vec<_> = discovery
		.group_resources
		.keys()
		.map(|gv| {
			let (group, version) = gv.split_once('/').unwrap_or(("", gv));
			json!({
				"name": group,
				"versions": [{"groupVersion": gv, "version": version}],
				"preferredVersion": {"groupVersion": gv, "version": version}
			})
		})
		.collect();

	Mock::given(method("GET"))
		.and(path("/apis"))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({
			"kind": "APIGroupList",
			"apiVersion": "v1",
			"groups": groups
		})))
		.mount(server)
		.await;

	let resource_lists = std::iter::once(("v1", &discovery.core_resources)).chain(
		discovery
			.group_resources
			.iter()
			.map(|(gv, rs)| (gv.as_str(), rs)),
	);
	for (gv, rs) in resource_lists {
		let endpoint = if gv.contains('/') {
			format!("/apis/{gv}")
		} else {
			format!("/api/{gv}")
		};
		let resources: Vec<_> = rs.iter().map(legacy_resource).collect();
		Mock::given(method("GET"))
			.and(path(endpoint))
			.respond_with(ResponseTemplate::new(200).set_body_json(json!({
				"kind": "APIResourceList",
				"apiVersion": "v1",
				"groupVersion": gv,
				"resources": resources
			})))
			.mount(server)
			.await;
	}
}

async fn mount_resources(server: &MockServer, state: &SharedState) {
	let handlers: [(&str, fn(&mut ServerState, &Request) -> ResponseTemplate); 5] = [
		("GET", handle_get),
		("POST", handle_create),
		("PUT", handle_replace),
		("PATCH", handle_patch),
		("DELETE", handle_delete),
	];

	for (verb, handler) in handlers {
		let state = Arc::clone(state);
		Mock::given(method(verb))
			.and(path_regex(r"^/api(s)?/.*"))
			.respond_with(move |req: &Request| handler(&mut lock(&state), req))
			.mount(server)
			.await;
	}
}

fn parse_body(req: &Request) -> Result<Value, ResponseTemplate> {
	serde_json::from_slice(&req.body)
		.map_err(|e| status_response(400, "BadRequest", format!("invalid request body: {e}")))
}

fn list_response(items: Vec<Value>) -> ResponseTemplate {
	ResponseTemplate::new(200).set_body_json(json!({
		"kind": "List",
		"apiVersion": "v1",
		"metadata": {"resourceVersion": "1"},
		"items": items
	}))
}

fn handle_get(state: &mut ServerState, req: &Request) -> ResponseTemplate {
	let path_str = req.url.path().trim_end_matches('/');

	if is_collection_path(path_str) {
		let items = state
			.objects
			.iter()
			.filter(|((api_path, _), _)| {
				api_path == path_str
					|| extract_cluster_wide_path(api_path).is_some_and(|p| p == path_str)
			})
			.map(|(_, object)| object.clone())
			.collect();
		return list_response(items);
	}

	let (api_path, name) = parse_resource_path(path_str);
	if state.failing_gets.contains(&name) {
		return status_response(500, "InternalError", format!("injected failure reading {name}"));
	}
	match state.objects.get(&(api_path, name.clone())) {
		Some(object) => ResponseTemplate::new(200).set_body_json(object.clone()),
		None => not_found(plural_of(path_str), &name),
	}
}

fn handle_create(state: &mut ServerState, req: &Request) -> ResponseTemplate {
	let collection = req.url.path().trim_end_matches('/').to_string();
	let mut body = match parse_body(req) {
		Ok(body) => body,
		Err(response) => return response,
	};

	let name = body
		.pointer("/metadata/name")
		.and_then(Value::as_str)
		.unwrap_or_default()
		.to_string();
	if name.is_empty() {
		return status_response(422, "Invalid", "metadata.name: Required value");
	}

	let plural = plural_of(&collection).to_string();
	if state.take_conflict(&name) {
		return conflict(&plural, &name);
	}

	let key = (collection, name);
	if state.objects.contains_key(&key) {
		return status_response(
			409,
			"AlreadyExists",
			format!("{plural} \"{}\" already exists", key.1),
		);
	}

	state.stamp(&mut body);
	state.objects.insert(key, body.clone());
	ResponseTemplate::new(201).set_body_json(body)
}

fn handle_replace(state: &mut ServerState, req: &Request) -> ResponseTemplate {
	let path_str = req.url.path();
	let (api_path, name) = parse_resource_path(path_str);
	let mut body = match parse_body(req) {
		Ok(body) => body,
		Err(response) => return response,
	};

	if state.take_conflict(&name) {
		return conflict(plural_of(path_str), &name);
	}

	let key = (api_path, name);
	let Some(existing) = state.objects.get(&key) else {
		return not_found(plural_of(path_str), &key.1);
	};

	let live_version = existing.pointer("/metadata/resourceVersion");
	let sent_version = body.pointer("/metadata/resourceVersion");
	if sent_version.is_some() && sent_version != live_version {
		return conflict(plural_of(path_str), &key.1);
	}
	if let (Some(uid), Some(metadata)) = (
		existing.pointer("/metadata/uid").cloned(),
		body.get_mut("metadata").and_then(Value::as_object_mut),
	) {
		metadata.insert("uid".into(), uid);
	}

	state.stamp(&mut body);
	state.objects.insert(key, body.clone());
	ResponseTemplate::new(200).set_body_json(body)
}

fn handle_patch(state: &mut ServerState, req: &Request) -> ResponseTemplate {
	let path_str = req.url.path();
	let (api_path, name) = parse_resource_path(path_str);
	let patch = match parse_body(req) {
		Ok(patch) => patch,
		Err(response) => return response,
	};

	if state.take_conflict(&name) {
		return conflict(plural_of(path_str), &name);
	}

	let content_type = req
		.headers
		.get("content-type")
		.and_then(|v| v.to_str().ok())
		.unwrap_or_default();
	let key = (api_path, name);
	let existing = state.objects.get(&key).cloned();

	let mut patched = match (PatchEncoding::from_content_type(content_type), existing) {
		(None, _) => {
			return status_response(
				415,
				"UnsupportedMediaType",
				format!("unsupported patch content type {content_type:?}"),
			)
		}
		(Some(_), None) => return not_found(plural_of(path_str), &key.1),
		(Some(PatchEncoding::Merge), Some(mut existing)) => {
			apply_merge_patch(&mut existing, &patch);
			existing
		}
		(Some(PatchEncoding::Strategic), Some(existing)) => {
			let api_version = existing["apiVersion"].as_str().unwrap_or_default();
			let kind = existing["kind"].as_str().unwrap_or_default();
			let Some(meta) = patch_meta::lookup(api_version, kind) else {
				return status_response(
					415,
					"UnsupportedMediaType",
					"the body of the request was in an unknown format - accepted media types include: \
					 application/json-patch+json, application/merge-patch+json, application/apply-patch+yaml",
				);
			};
			match apply_strategic_patch(&existing, &patch, meta) {
				Ok(patched) => patched,
				Err(e) => return status_response(422, "Invalid", e.to_string()),
			}
		}
	};

	state.stamp(&mut patched);
	state.objects.insert(key, patched.clone());
	ResponseTemplate::new(200).set_body_json(patched)
}

fn handle_delete(state: &mut ServerState, req: &Request) -> ResponseTemplate {
	let path_str = req.url.path();
	let (api_path, name) = parse_resource_path(path_str);

	if state.take_conflict(&name) {
		return conflict(plural_of(path_str), &name);
	}

	let key = (api_path, name);
	match state.objects.remove(&key) {
		Some(object) => ResponseTemplate::new(200).set_body_json(object),
		None => not_found(plural_of(path_str), &key.1),
	}
}
