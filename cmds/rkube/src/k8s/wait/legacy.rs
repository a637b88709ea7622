use std::time::Duration;

use async_trait::async_trait;
use kube::Client;
use tokio::time::Instant;
use tracing::instrument;

use super::{
	deadline_after, fetch,
	readiness::{readiness, ReadyStatus},
	WaitError, Waiter,
};
use crate::k8s::{ResourceId, ResourceList};

/// Polls every object with plain reads.
pub struct LegacyWaiter {
	client: Client,
	interval: Duration,
}

#[derive(Clone, Copy)]
enum Goal {
	Ready,
	Deleted,
}

impl LegacyWaiter {
	const POLL_INTERVAL: Duration = Duration::from_secs(2);

	pub fn new(client: Client) -> Self {
		Self {
			client,
			interval: Self::POLL_INTERVAL,
		}
	}

	pub fn with_interval(mut self, interval: Duration) -> Self {
		self.interval = interval;
		self
	}

	/// Objects not at `goal` yet.
	async fn pending(&self, resources: &ResourceList, goal: Goal) -> Result<Vec<ResourceId>, WaitError> {
		let mut pending = Vec::new();
		for info in resources {
			let live = fetch(&self.client, info).await?;
			let done = match (goal, live) {
				(Goal::Deleted, live) => live.is_none(),
				(Goal::Ready, None) => false,
				(Goal::Ready, Some(object)) => match readiness(&object) {
					ReadyStatus::Ready => true,
					ReadyStatus::Pending(reason) => {
						tracing::debug!(resource = %info.id, %reason, "not ready");
						false
					}
					ReadyStatus::Failed(reason) => {
						return Err(WaitError::Failed {
							id: info.id.clone(),
							reason,
						})
					}
				},
			};
			if !done {
				pending.push(info.id.clone());
			}
		}
		Ok(pending)
	}

	async fn poll(&self, resources: &ResourceList, timeout: Duration, goal: Goal) -> Result<(), WaitError> {
		let deadline = deadline_after(timeout);
		loop {
			let pending = self.pending(resources, goal).await?;
			if pending.is_empty() {
				return Ok(());
			}
			if Instant::now() + self.interval > deadline {
				return Err(WaitError::Timeout { pending });
			}
			tokio::time::sleep(self.interval).await;
		}
	}
}

#[async_trait]
impl Waiter for LegacyWaiter {
	#[instrument(skip_all, fields(count = resources.len(), timeout = ?timeout))]
	async fn wait(&self, resources: &ResourceList, timeout: Duration) -> Result<(), WaitError> {
		self.poll(resources, timeout, Goal::Ready).await
	}

	#[instrument(skip_all, fields(count = resources.len(), timeout = ?timeout))]
	async fn wait_for_delete(&self, resources: &ResourceList, timeout: Duration) -> Result<(), WaitError> {
		self.poll(resources, timeout, Goal::Deleted).await
	}

	#[instrument(skip_all, fields(count = resources.len(), timeout = ?timeout))]
	async fn watch_until_ready(&self, resources: &ResourceList, timeout: Duration) -> Result<(), WaitError> {
		self.poll(resources, timeout, Goal::Ready).await
	}
}
