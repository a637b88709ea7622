//! Waiting for objects to become ready or to disappear.
//!
//! Three strategies exist, selected by [`WaitStrategy`]:
//! - `legacy` polls every object at a fixed interval
//! - `watcher` watches each object until it is ready
//! - `hookOnly` only waits for hooks and deletions

mod hook_only;
mod legacy;
pub mod readiness;
mod status;

use std::{fmt, str::FromStr, sync::Arc, time::Duration};

use async_trait::async_trait;
use kube::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;

pub use self::{hook_only::HookOnlyWaiter, legacy::LegacyWaiter, status::StatusWaiter};
use super::{client::ConnectionError, mapper::dynamic_api, ApiError, ResourceId, ResourceInfo, ResourceList};

#[derive(Debug, Error)]
pub enum WaitError {
	#[error("unknown wait strategy {0:?}. Valid values are: legacy, watcher, hookOnly")]
	UnknownStrategy(String),

	#[error("building kubernetes client")]
	Connection(#[source] ConnectionError),

	#[error("timed out waiting for {}", display_ids(.pending))]
	Timeout { pending: Vec<ResourceId> },

	#[error("{id} failed: {reason}")]
	Failed { id: ResourceId, reason: String },

	#[error("reading {id}")]
	Get {
		id: ResourceId,
		#[source]
		source: ApiError,
	},

	#[error("watching {id}")]
	Watch {
		id: ResourceId,
		#[source]
		source: Box<kube::runtime::wait::Error>,
	},

	#[error("wait task panicked")]
	TaskPanicked(#[source] tokio::task::JoinError),
}

fn display_ids(ids: &[ResourceId]) -> String {
	ids.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
}

/// Waits on a set of objects.
#[async_trait]
pub trait Waiter: Send + Sync {
	/// Wait until every object exists and is ready.
	async fn wait(&self, resources: &ResourceList, timeout: Duration) -> Result<(), WaitError>;

	/// Wait until every object is gone.
	async fn wait_for_delete(&self, resources: &ResourceList, timeout: Duration) -> Result<(), WaitError>;

	/// Wait until every object is ready, used for hooks.
	async fn watch_until_ready(&self, resources: &ResourceList, timeout: Duration) -> Result<(), WaitError>;
}

/// Name of a waiting strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
pub enum WaitStrategy {
	#[serde(rename = "legacy")]
	#[value(name = "legacy")]
	Legacy,
	#[default]
	#[serde(rename = "watcher")]
	#[value(name = "watcher")]
	Watcher,
	#[serde(rename = "hookOnly")]
	#[value(name = "hookOnly")]
	HookOnly,
}

impl WaitStrategy {
	pub fn as_str(self) -> &'static str {
		match self {
			WaitStrategy::Legacy => "legacy",
			WaitStrategy::Watcher => "watcher",
			WaitStrategy::HookOnly => "hookOnly",
		}
	}
}

impl fmt::Display for WaitStrategy {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for WaitStrategy {
	type Err = WaitError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"legacy" => Ok(WaitStrategy::Legacy),
			"watcher" => Ok(WaitStrategy::Watcher),
			"hookOnly" => Ok(WaitStrategy::HookOnly),
			other => Err(WaitError::UnknownStrategy(other.to_string())),
		}
	}
}

/// Build the waiter implementing `strategy`.
pub fn new_waiter(strategy: WaitStrategy, client: Client) -> Arc<dyn Waiter> {
	tracing::debug!(%strategy, "building waiter");
	match strategy {
		WaitStrategy::Legacy => Arc::new(LegacyWaiter::new(client)),
		WaitStrategy::Watcher => Arc::new(StatusWaiter::new(client)),
		WaitStrategy::HookOnly => Arc::new(HookOnlyWaiter::new(client)),
	}
}

/// Stand-in deadline for timeouts too large to add to the current instant.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// The instant `timeout` from now, clamped to [`FAR_FUTURE`] on overflow.
fn deadline_after(timeout: Duration) -> Instant {
	let now = Instant::now();
	now.checked_add(timeout)
		.unwrap_or_else(|| now + FAR_FUTURE)
}

/// The live object, or `None` if it does not exist.
async fn fetch(client: &Client, info: &ResourceInfo) -> Result<Option<serde_json::Value>, WaitError> {
	let get_error = |source: ApiError| WaitError::Get {
		id: info.id.clone(),
		source,
	};
	let object = dynamic_api(client, info)
		.get_opt(&info.id.name)
		.await
		.map_err(|e| get_error(e.into()))?;
	object
		.map(|object| serde_json::to_value(object).map_err(|e| get_error(ApiError::Serialization(e))))
		.transpose()
}

#[cfg(test)]
mod tests {
	use assert_matches::assert_matches;
	use rstest::rstest;

	use super::*;

	#[rstest]
	#[case("legacy", WaitStrategy::Legacy)]
	#[case("watcher", WaitStrategy::Watcher)]
	#[case("hookOnly", WaitStrategy::HookOnly)]
	fn test_parse_strategy(#[case] name: &str, #[case] expected: WaitStrategy) {
		let strategy: WaitStrategy = name.parse().unwrap();
		assert_eq!(strategy, expected);
		assert_eq!(strategy.to_string(), name);
	}

	#[rstest]
	#[case("")]
	#[case("Watcher")]
	#[case("hookonly")]
	fn test_unknown_strategy(#[case] name: &str) {
		let err = name.parse::<WaitStrategy>().unwrap_err();
		assert_matches!(err, WaitError::UnknownStrategy(ref got) if got == name);
	}

	#[test]
	fn test_huge_timeout_is_clamped() {
		let deadline = deadline_after(Duration::from_secs(u64::MAX));
		assert!(deadline > Instant::now() + Duration::from_secs(86400 * 365));
	}

	#[rstest]
	#[case(WaitStrategy::Legacy)]
	#[case(WaitStrategy::Watcher)]
	#[case(WaitStrategy::HookOnly)]
	#[tokio::test]
	async fn test_huge_timeout_on_empty_list(#[case] strategy: WaitStrategy) {
		let client = Client::try_from(kube::Config::new("http://127.0.0.1:1".parse().unwrap())).unwrap();
		let waiter = new_waiter(strategy, client);
		let timeout = Duration::from_secs(u64::MAX);
		let empty = ResourceList::new();

		waiter.wait(&empty, timeout).await.unwrap();
		waiter.wait_for_delete(&empty, timeout).await.unwrap();
		waiter.watch_until_ready(&empty, timeout).await.unwrap();
	}

	#[test]
	fn test_strategy_from_yaml() {
		let strategy: WaitStrategy = serde_yaml::from_str("hookOnly").unwrap();
		assert_eq!(strategy, WaitStrategy::HookOnly);
		assert!(serde_yaml::from_str::<WaitStrategy>("sometimes").is_err());
	}
}
