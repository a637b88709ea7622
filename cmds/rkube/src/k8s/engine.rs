//! The reconciliation engine.

use std::{error::Error, fmt, sync::Arc, time::Duration};

use bon::Builder;
use kube::Client;
use thiserror::Error;
use tokio::task::JoinError;
use tracing::instrument;

use super::{
	batch::{self, BatchError, ResourceError},
	client::{ClusterFactory, ConnectionError},
	mapper::{DeletionPropagation, FieldManager, MapperError, ResourceMapper},
	retry::{retry_on_conflict, RetryPolicy},
	wait::{new_waiter, WaitError, WaitStrategy, Waiter},
	ResourceList,
};

/// Handles touched by an operation.
#[derive(Debug, Clone, Default)]
pub struct ReconcileResult {
	pub created: ResourceList,
	pub updated: ResourceList,
	pub deleted: ResourceList,
}

/// An error together with whatever was done before it happened.
#[derive(Debug)]
pub struct Partial<E> {
	pub result: ReconcileResult,
	pub error: E,
}

impl<E> Partial<E> {
	pub(super) fn new(result: ReconcileResult, error: E) -> Self {
		Self { result, error }
	}
}

impl<E: fmt::Display> fmt::Display for Partial<E> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		self.error.fmt(f)
	}
}

impl<E: Error + 'static> Error for Partial<E> {
	fn source(&self) -> Option<&(dyn Error + 'static)> {
		self.error.source()
	}
}

#[derive(Debug, Error)]
pub enum ReachabilityError {
	#[error("Kubernetes cluster unreachable")]
	Unreachable(#[source] ConnectionError),
}

/// Drives a cluster towards a desired set of objects.
///
/// ```no_run
/// # use std::sync::Arc;
/// # use rkube::k8s::{mapper::InMemoryMapper, FieldManager, ReconcileEngine};
/// let engine = ReconcileEngine::builder()
/// 	.mapper(Arc::new(InMemoryMapper::new()))
/// 	.field_manager(FieldManager::new("deployer"))
/// 	.build();
/// ```
#[derive(Builder)]
pub struct ReconcileEngine {
	pub(super) mapper: Arc<dyn ResourceMapper>,
	/// Where API clients for waiting and reachability checks come from.
	cluster: Option<Arc<dyn ClusterFactory>>,
	#[builder(default)]
	pub(super) field_manager: FieldManager,
	#[builder(default)]
	pub(super) retry: RetryPolicy,
	#[builder(default)]
	wait_strategy: WaitStrategy,

	#[builder(skip)]
	kube_client: Option<Client>,
	#[builder(skip)]
	waiter: Option<Arc<dyn Waiter>>,
}

impl ReconcileEngine {
	pub fn mapper(&self) -> &Arc<dyn ResourceMapper> {
		&self.mapper
	}

	pub fn field_manager(&self) -> &FieldManager {
		&self.field_manager
	}

	pub fn wait_strategy(&self) -> WaitStrategy {
		self.wait_strategy
	}

	/// Resolve a manifest stream into handles.
	pub async fn build(&self, manifests: &[u8]) -> Result<ResourceList, MapperError> {
		self.mapper.resolve(manifests).await
	}

	/// Create every object of `resources`, one kind at a time.
	///
	/// Handles of created objects are refreshed with the server's view.
	#[instrument(skip_all, fields(count = resources.len()))]
	pub async fn create(&self, resources: &mut ResourceList) -> Result<ReconcileResult, Partial<BatchError>> {
		tracing::debug!("creating resource(s)");

		let mapper = Arc::clone(&self.mapper);
		let field_manager = self.field_manager.clone();
		let policy = self.retry;
		let outcomes = batch::perform(resources, move |info| {
			let mapper = Arc::clone(&mapper);
			let field_manager = field_manager.clone();
			async move { retry_on_conflict(&policy, || mapper.create(&info, &field_manager)).await }
		})
		.await
		.map_err(|e| Partial::new(ReconcileResult::default(), e))?;

		let mut result = ReconcileResult::default();
		let mut errors = Vec::new();
		for outcome in outcomes.outcomes {
			let info = &mut resources.as_mut_slice()[outcome.index];
			match outcome.result {
				Ok(live) => {
					info.refresh(live);
					result.created.push(info.clone());
				}
				Err(source) => errors.push(ResourceError {
					id: info.id.clone(),
					source,
				}),
			}
		}

		finish(result, outcomes.panic, errors)
	}

	/// Delete every object of `resources` with background propagation.
	pub async fn delete(&self, resources: &ResourceList) -> Result<ReconcileResult, Partial<BatchError>> {
		self.delete_with_propagation(resources, DeletionPropagation::Background)
			.await
	}

	/// Delete every object of `resources`, attempting all of them.
	///
	/// Objects already gone count as deleted.
	#[instrument(skip_all, fields(count = resources.len(), propagation = ?propagation))]
	pub async fn delete_with_propagation(
		&self,
		resources: &ResourceList,
		propagation: DeletionPropagation,
	) -> Result<ReconcileResult, Partial<BatchError>> {
		let mapper = Arc::clone(&self.mapper);
		let policy = self.retry;
		let outcomes = batch::perform(resources, move |info| {
			let mapper = Arc::clone(&mapper);
			async move {
				tracing::debug!(kind = %info.id.kind, name = %info.id.name, namespace = ?info.id.namespace, "starting delete resource");
				retry_on_conflict(&policy, || mapper.delete(&info, propagation)).await
			}
		})
		.await;

		let outcomes = match outcomes {
			Ok(outcomes) => outcomes,
			Err(e @ BatchError::NoObjectsVisited) => {
				tracing::debug!("object not found, skipping delete");
				return Err(Partial::new(ReconcileResult::default(), e));
			}
			Err(e) => return Err(Partial::new(ReconcileResult::default(), e)),
		};

		let mut result = ReconcileResult::default();
		let mut errors = Vec::new();
		for outcome in outcomes.outcomes {
			let info = &resources.as_slice()[outcome.index];
			match outcome.result {
				Ok(()) => result.deleted.push(info.clone()),
				Err(e) if e.is_not_found() => {
					tracing::debug!(resource = %info.id, error = %e, "ignoring delete failure");
					result.deleted.push(info.clone());
				}
				Err(source) => errors.push(ResourceError {
					id: info.id.clone(),
					source,
				}),
			}
		}

		finish(result, outcomes.panic, errors)
	}

	/// API client from the cluster binding, built on first use.
	pub async fn kube_client(&mut self) -> Result<Client, ConnectionError> {
		if let Some(client) = &self.kube_client {
			return Ok(client.clone());
		}
		let cluster = self.cluster.as_ref().ok_or(ConnectionError::NotConfigured)?;
		let client = cluster.kube_client().await?;
		self.kube_client = Some(client.clone());
		Ok(client)
	}

	/// Check that the API server answers.
	#[instrument(skip_all)]
	pub async fn is_reachable(&mut self) -> Result<(), ReachabilityError> {
		let client = self
			.kube_client()
			.await
			.map_err(ReachabilityError::Unreachable)?;
		client
			.apiserver_version()
			.await
			.map_err(|e| ReachabilityError::Unreachable(e.into()))?;
		Ok(())
	}

	/// A new waiter implementing `strategy`.
	pub async fn get_waiter(&mut self, strategy: WaitStrategy) -> Result<Arc<dyn Waiter>, WaitError> {
		let client = self.kube_client().await.map_err(WaitError::Connection)?;
		Ok(new_waiter(strategy, client))
	}

	/// Switch the engine to `strategy` for all following waits.
	pub async fn set_waiter(&mut self, strategy: WaitStrategy) -> Result<(), WaitError> {
		let waiter = self.get_waiter(strategy).await?;
		self.wait_strategy = strategy;
		self.waiter = Some(waiter);
		Ok(())
	}

	/// The engine's waiter, built with its wait strategy on first use.
	pub async fn waiter(&mut self) -> Result<Arc<dyn Waiter>, WaitError> {
		if let Some(waiter) = &self.waiter {
			return Ok(Arc::clone(waiter));
		}
		let waiter = self.get_waiter(self.wait_strategy).await?;
		self.waiter = Some(Arc::clone(&waiter));
		Ok(waiter)
	}

	pub async fn wait(&mut self, resources: &ResourceList, timeout: Duration) -> Result<(), WaitError> {
		self.waiter().await?.wait(resources, timeout).await
	}

	pub async fn wait_for_delete(&mut self, resources: &ResourceList, timeout: Duration) -> Result<(), WaitError> {
		self.waiter().await?.wait_for_delete(resources, timeout).await
	}

	pub async fn watch_until_ready(&mut self, resources: &ResourceList, timeout: Duration) -> Result<(), WaitError> {
		self.waiter().await?.watch_until_ready(resources, timeout).await
	}
}

/// Turn the collected result of a batch into the engine's return value.
fn finish(
	result: ReconcileResult,
	panic: Option<JoinError>,
	errors: Vec<ResourceError>,
) -> Result<ReconcileResult, Partial<BatchError>> {
	if let Some(panic) = panic {
		for error in &errors {
			tracing::debug!(resource = %error.id, error = %error.source, "failure hidden by task panic");
		}
		return Err(Partial::new(result, BatchError::TaskPanicked(panic)));
	}
	if errors.is_empty() {
		Ok(result)
	} else {
		Err(Partial::new(result, BatchError::Failed(errors)))
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::{AtomicUsize, Ordering};

	use assert_matches::assert_matches;
	use async_trait::async_trait;
	use kube::Config;
	use serde_json::json;

	use super::*;
	use crate::k8s::{
		mapper::{InMemoryMapper, Verb},
		resource::test_support::{config_map, info},
	};

	struct CountingFactory {
		builds: AtomicUsize,
	}

	#[async_trait]
	impl ClusterFactory for CountingFactory {
		async fn kube_client(&self) -> Result<Client, ConnectionError> {
			self.builds.fetch_add(1, Ordering::SeqCst);
			let config = Config::new("http://127.0.0.1:1".parse().unwrap());
			Ok(Client::try_from(config)?)
		}
	}

	fn engine(mapper: &Arc<InMemoryMapper>) -> ReconcileEngine {
		ReconcileEngine::builder()
			.mapper(mapper.clone())
			.field_manager(FieldManager::new("test-manager"))
			.build()
	}

	#[tokio::test]
	async fn test_create_refreshes_handles() {
		let mapper = Arc::new(InMemoryMapper::new());
		let mut list: ResourceList = vec![config_map("a"), config_map("b")].into();

		let result = engine(&mapper).create(&mut list).await.unwrap();

		assert_eq!(result.created.len(), 2);
		assert!(list.iter().all(|info| info.object.value()["metadata"]["uid"].is_string()));
		let managers: Vec<_> = mapper
			.calls()
			.into_iter()
			.map(|call| call.field_manager.unwrap())
			.collect();
		assert_eq!(managers, vec!["test-manager", "test-manager"]);
	}

	#[tokio::test]
	async fn test_create_collects_failures() {
		let existing = config_map("taken");
		let mapper = Arc::new(InMemoryMapper::new().with_object(existing.object.value().clone()));
		let mut list: ResourceList = vec![config_map("fresh"), existing].into();

		let partial = engine(&mapper).create(&mut list).await.unwrap_err();

		assert_eq!(partial.result.created.len(), 1);
		assert_matches!(&partial.error, BatchError::Failed(errors) if errors.len() == 1);
		assert!(partial.to_string().contains("already exists"));
	}

	#[tokio::test(start_paused = true)]
	async fn test_create_retries_conflicts() {
		let mapper = Arc::new(InMemoryMapper::new().with_conflicts("a", 2));
		let mut list: ResourceList = vec![config_map("a")].into();

		engine(&mapper).create(&mut list).await.unwrap();
		assert_eq!(mapper.names_for(Verb::Create), vec!["a", "a", "a"]);
	}

	#[tokio::test]
	async fn test_panic_keeps_partial_result() {
		let panic = tokio::spawn(async { panic!("task failed") }).await.unwrap_err();
		let mut done = ReconcileResult::default();
		done.created.push(config_map("a"));

		let partial = finish(done, Some(panic), Vec::new()).unwrap_err();

		assert_matches!(partial.error, BatchError::TaskPanicked(_));
		assert_eq!(partial.result.created.len(), 1);
	}

	#[tokio::test]
	async fn test_create_empty_is_sentinel() {
		let mapper = Arc::new(InMemoryMapper::new());
		let partial = engine(&mapper).create(&mut ResourceList::new()).await.unwrap_err();
		assert_matches!(partial.error, BatchError::NoObjectsVisited);
	}

	#[tokio::test]
	async fn test_delete_counts_not_found_as_deleted() {
		let present = config_map("present");
		let mapper = Arc::new(InMemoryMapper::new().with_object(present.object.value().clone()));
		let list: ResourceList = vec![present, config_map("gone")].into();

		let result = engine(&mapper).delete(&list).await.unwrap();

		let deleted: Vec<_> = result.deleted.iter().map(|i| i.id.name.as_str()).collect();
		assert_eq!(deleted, vec!["present", "gone"]);
		assert_eq!(mapper.object_count(), 0);
	}

	#[tokio::test]
	async fn test_delete_empty_is_sentinel() {
		let mapper = Arc::new(InMemoryMapper::new());
		let partial = engine(&mapper).delete(&ResourceList::new()).await.unwrap_err();
		assert_eq!(partial.to_string(), "no objects visited");
	}

	#[tokio::test(start_paused = true)]
	async fn test_create_runs_kinds_in_waves() {
		let mapper = Arc::new(
			InMemoryMapper::new()
				.with_delay("Namespace", Duration::from_millis(100))
				.with_delay("ConfigMap", Duration::from_millis(10)),
		);
		let namespace = info(json!({"apiVersion": "v1", "kind": "Namespace", "metadata": {"name": "ns"}}));
		let mut list: ResourceList = vec![namespace, config_map("a"), config_map("b")].into();

		engine(&mapper).create(&mut list).await.unwrap();

		let events = mapper.events();
		let namespace_done = events
			.iter()
			.position(|e| *e == crate::k8s::mapper::CallEvent::Finished(Verb::Create, "ns".into()))
			.unwrap();
		let first_config_map = events
			.iter()
			.position(|e| matches!(e, crate::k8s::mapper::CallEvent::Started(_, name) if name != "ns"))
			.unwrap();
		assert!(namespace_done < first_config_map);
	}

	#[tokio::test]
	async fn test_waiter_is_built_once() {
		let factory = Arc::new(CountingFactory {
			builds: AtomicUsize::new(0),
		});
		let mut engine = ReconcileEngine::builder()
			.mapper(Arc::new(InMemoryMapper::new()))
			.cluster(factory.clone())
			.wait_strategy(WaitStrategy::HookOnly)
			.build();

		let first = engine.waiter().await.unwrap();
		let second = engine.waiter().await.unwrap();
		assert!(Arc::ptr_eq(&first, &second));

		// hookOnly does not wait on plain waits
		engine
			.wait(&vec![config_map("a")].into(), Duration::from_secs(1))
			.await
			.unwrap();

		engine.set_waiter(WaitStrategy::Legacy).await.unwrap();
		assert_eq!(engine.wait_strategy(), WaitStrategy::Legacy);
		assert!(!Arc::ptr_eq(&first, &engine.waiter().await.unwrap()));
		assert_eq!(factory.builds.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn test_waiter_without_cluster() {
		let mut engine = engine(&Arc::new(InMemoryMapper::new()));
		let err = engine.waiter().await.err().unwrap();
		assert_matches!(err, WaitError::Connection(ConnectionError::NotConfigured));
	}

	#[tokio::test]
	async fn test_unreachable_cluster() {
		let mut engine = ReconcileEngine::builder()
			.mapper(Arc::new(InMemoryMapper::new()))
			.cluster(Arc::new(CountingFactory {
				builds: AtomicUsize::new(0),
			}))
			.build();

		let err = engine.is_reachable().await.unwrap_err();
		assert_eq!(err.to_string(), "Kubernetes cluster unreachable");
	}
}
