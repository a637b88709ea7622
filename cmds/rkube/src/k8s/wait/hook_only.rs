use std::time::Duration;

use async_trait::async_trait;
use kube::Client;

use super::{StatusWaiter, WaitError, Waiter};
use crate::k8s::ResourceList;

/// Waits for hooks and deletions only. Plain waits return at once.
pub struct HookOnlyWaiter {
	inner: StatusWaiter,
}

impl HookOnlyWaiter {
	pub fn new(client: Client) -> Self {
		Self {
			inner: StatusWaiter::new(client),
		}
	}
}

#[async_trait]
impl Waiter for HookOnlyWaiter {
	async fn wait(&self, _resources: &ResourceList, _timeout: Duration) -> Result<(), WaitError> {
		Ok(())
	}

	async fn wait_for_delete(&self, resources: &ResourceList, timeout: Duration) -> Result<(), WaitError> {
		self.inner.wait_for_delete(resources, timeout).await
	}

	async fn watch_until_ready(&self, resources: &ResourceList, timeout: Duration) -> Result<(), WaitError> {
		self.inner.watch_until_ready(resources, timeout).await
	}
}
