//! Kubernetes API resource discovery and caching.
//!
//! Resolves manifest apiVersion/kind pairs to the API endpoint serving them,
//! along with the resource scope.

use std::{
	collections::{HashMap, HashSet},
	sync::Arc,
};

use kube::{
	core::GroupVersionKind,
	discovery::{oneshot::pinned_kind, ApiResource, Scope},
	Client, Discovery,
};
use thiserror::Error;
use tokio::{sync::Semaphore, task::JoinSet};
use tracing::instrument;

use super::{resource::ResourceMapping, ResourceScope};

#[derive(Debug, Error)]
pub enum DiscoveryError {
	#[error("full API discovery failed")]
	FullDiscovery(#[source] kube::Error),

	#[error("discovery task panicked")]
	TaskPanicked(#[source] tokio::task::JoinError),

	#[error("failed to discover resource {api_version}/{kind}")]
	ResourceDiscovery {
		api_version: String,
		kind: String,
		#[source]
		source: kube::Error,
	},
}

fn scope_of(scope: &Scope) -> ResourceScope {
	match scope {
		Scope::Namespaced => ResourceScope::Namespaced,
		Scope::Cluster => ResourceScope::ClusterWide,
	}
}

/// Cached API resource discovery results.
#[derive(Debug, Clone, Default)]
pub struct ApiResourceCache {
	resources: HashMap<GroupVersionKind, ResourceMapping>,
}

impl ApiResourceCache {
	/// Maximum concurrent discovery requests for lazy fallback.
	const MAX_CONCURRENT_DISCOVERIES: usize = 8;

	/// Build the cache by querying the cluster's discovery API.
	///
	/// Uses the Aggregated Discovery API (K8s 1.26+) which requires only 2 API calls.
	/// Older clusters fall back to lazy discovery of `required_keys`, or to
	/// full discovery when `need_full_discovery` is set.
	#[instrument(skip(client, required_keys), fields(key_count = required_keys.len(), need_full = need_full_discovery))]
	pub async fn build(
		client: &Client,
		required_keys: HashSet<GroupVersionKind>,
		need_full_discovery: bool,
	) -> Result<Self, DiscoveryError> {
		if required_keys.is_empty() && !need_full_discovery {
			return Ok(Self::default());
		}

		match Discovery::new(client.clone()).run_aggregated().await {
			Ok(discovery) => {
				tracing::debug!("using aggregated discovery");
				Ok(Self::from_discovery(discovery))
			}
			Err(e) => {
				tracing::debug!(error = %e, "aggregated discovery not available");
				if need_full_discovery {
					Self::build_full(client).await
				} else {
					tracing::debug!("using lazy discovery");
					Self::build_lazy(client, required_keys).await
				}
			}
		}
	}

	#[instrument(skip(client))]
	async fn build_full(client: &Client) -> Result<Self, DiscoveryError> {
		let discovery = Discovery::new(client.clone())
			.run()
			.await
			.map_err(DiscoveryError::FullDiscovery)?;
		Ok(Self::from_discovery(discovery))
	}

	fn from_discovery(discovery: Discovery) -> Self {
		let mut resources = HashMap::new();

		for group in discovery.groups() {
			// All versions, so manifests pinned to an older version still resolve
			for ver in group.versions() {
				for (ar, caps) in group.versioned_resources(ver) {
					let gvk = GroupVersionKind::gvk(&ar.group, &ar.version, &ar.kind);
					resources.insert(
						gvk,
						ResourceMapping {
							api_resource: ar,
							scope: scope_of(&caps.scope),
						},
					);
				}
			}
		}

		Self { resources }
	}

	/// Discover only `keys`, with bounded parallelism.
	#[instrument(skip(client, keys), fields(key_count = keys.len()))]
	async fn build_lazy(
		client: &Client,
		keys: HashSet<GroupVersionKind>,
	) -> Result<Self, DiscoveryError> {
		let semaphore = Arc::new(Semaphore::new(Self::MAX_CONCURRENT_DISCOVERIES));
		let mut join_set = JoinSet::new();

		for gvk in keys {
			let client = client.clone();
			let sem = semaphore.clone();

			join_set.spawn(async move {
				// The semaphore is never closed
				let _permit = sem.acquire().await.ok();

				tracing::debug!(
					api_version = %gvk.api_version(),
					kind = %gvk.kind,
					"discovering resource"
				);

				match pinned_kind(&client, &gvk).await {
					Ok((api_resource, capabilities)) => Ok((
						gvk,
						ResourceMapping {
							api_resource,
							scope: scope_of(&capabilities.scope),
						},
					)),
					Err(e) => Err((gvk, e)),
				}
			});
		}

		let mut resources = HashMap::new();
		let mut errors = Vec::new();

		while let Some(result) = join_set.join_next().await {
			match result.map_err(DiscoveryError::TaskPanicked)? {
				Ok((gvk, mapping)) => {
					resources.insert(gvk, mapping);
				}
				Err((gvk, e)) => {
					tracing::warn!(
						api_version = %gvk.api_version(),
						kind = %gvk.kind,
						error = %e,
						"failed to discover resource"
					);
					errors.push((gvk, e));
				}
			}
		}

		if resources.is_empty() && !errors.is_empty() {
			let (gvk, e) = errors.remove(0);
			return Err(DiscoveryError::ResourceDiscovery {
				api_version: gvk.api_version(),
				kind: gvk.kind,
				source: e,
			});
		}

		Ok(Self { resources })
	}

	/// Register a mapping by hand.
	pub fn insert(&mut self, api_resource: ApiResource, scope: ResourceScope) {
		let gvk = GroupVersionKind::gvk(&api_resource.group, &api_resource.version, &api_resource.kind);
		self.resources.insert(gvk, ResourceMapping { api_resource, scope });
	}

	pub fn lookup(&self, gvk: &GroupVersionKind) -> Option<&ResourceMapping> {
		self.resources.get(gvk)
	}

	pub fn len(&self) -> usize {
		self.resources.len()
	}

	pub fn is_empty(&self) -> bool {
		self.resources.is_empty()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_lookup_by_exact_version() {
		let mut cache = ApiResourceCache::default();
		let gvk = GroupVersionKind::gvk("apps", "v1", "Deployment");
		cache.insert(ApiResource::from_gvk(&gvk), ResourceScope::Namespaced);

		let mapping = cache.lookup(&gvk).unwrap();
		assert_eq!(mapping.api_resource.plural, "deployments");
		assert_eq!(mapping.scope, ResourceScope::Namespaced);
		assert!(cache
			.lookup(&GroupVersionKind::gvk("apps", "v1beta1", "Deployment"))
			.is_none());
		assert_eq!(cache.len(), 1);
	}
}
