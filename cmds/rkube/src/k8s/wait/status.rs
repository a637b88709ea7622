use std::time::Duration;

use async_trait::async_trait;
use kube::{
	api::{Api, DynamicObject},
	runtime::wait::await_condition,
	Client,
};
use tokio::{task::JoinSet, time::timeout_at};
use tracing::{instrument, Instrument};

use super::{
	deadline_after,
	readiness::{readiness, ReadyStatus},
	WaitError, Waiter,
};
use crate::k8s::{mapper::dynamic_api, ResourceId, ResourceList};

/// Watches every object, in parallel, until it reaches its goal.
pub struct StatusWaiter {
	client: Client,
}

#[derive(Clone, Copy, Debug)]
enum Goal {
	Ready,
	Deleted,
}

fn status_of(object: &DynamicObject) -> ReadyStatus {
	match serde_json::to_value(object) {
		Ok(value) => readiness(&value),
		Err(e) => ReadyStatus::Pending(format!("unreadable object: {e}")),
	}
}

async fn watch_object(api: Api<DynamicObject>, id: &ResourceId, goal: Goal) -> Result<(), WaitError> {
	let watch_error = |e| WaitError::Watch {
		id: id.clone(),
		source: Box::new(e),
	};

	match goal {
		Goal::Deleted => {
			await_condition(api, &id.name, |object: Option<&DynamicObject>| object.is_none())
				.await
				.map_err(watch_error)?;
			Ok(())
		}
		Goal::Ready => {
			let settled = |object: Option<&DynamicObject>| {
				object.is_some_and(|object| !matches!(status_of(object), ReadyStatus::Pending(_)))
			};
			let object = await_condition(api, &id.name, settled)
				.await
				.map_err(watch_error)?;
			match object.as_ref().map(status_of) {
				Some(ReadyStatus::Failed(reason)) => Err(WaitError::Failed {
					id: id.clone(),
					reason,
				}),
				_ => Ok(()),
			}
		}
	}
}

impl StatusWaiter {
	pub fn new(client: Client) -> Self {
		Self { client }
	}

	async fn watch_all(&self, resources: &ResourceList, timeout: Duration, goal: Goal) -> Result<(), WaitError> {
		let deadline = deadline_after(timeout);
		let mut join_set = JoinSet::new();

		for (index, info) in resources.iter().enumerate() {
			let api = dynamic_api(&self.client, info);
			let id = info.id.clone();
			let span = tracing::debug_span!("watch_object", resource = %id, ?goal);
			join_set.spawn(
				async move {
					let outcome = timeout_at(deadline, watch_object(api, &id, goal)).await;
					(index, id, outcome)
				}
				.instrument(span),
			);
		}

		let mut pending = Vec::new();
		while let Some(joined) = join_set.join_next().await {
			let (index, id, outcome) = joined.map_err(WaitError::TaskPanicked)?;
			match outcome {
				Ok(result) => result?,
				Err(_elapsed) => pending.push((index, id)),
			}
		}

		if pending.is_empty() {
			return Ok(());
		}
		pending.sort_by_key(|(index, _)| *index);
		Err(WaitError::Timeout {
			pending: pending.into_iter().map(|(_, id)| id).collect(),
		})
	}
}

#[async_trait]
impl Waiter for StatusWaiter {
	#[instrument(skip_all, fields(count = resources.len(), timeout = ?timeout))]
	async fn wait(&self, resources: &ResourceList, timeout: Duration) -> Result<(), WaitError> {
		self.watch_all(resources, timeout, Goal::Ready).await
	}

	#[instrument(skip_all, fields(count = resources.len(), timeout = ?timeout))]
	async fn wait_for_delete(&self, resources: &ResourceList, timeout: Duration) -> Result<(), WaitError> {
		self.watch_all(resources, timeout, Goal::Deleted).await
	}

	#[instrument(skip_all, fields(count = resources.len(), timeout = ?timeout))]
	async fn watch_until_ready(&self, resources: &ResourceList, timeout: Duration) -> Result<(), WaitError> {
		self.watch_all(resources, timeout, Goal::Ready).await
	}
}
