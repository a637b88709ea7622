//! Concurrent per-object operations, one kind at a time.
//!
//! The input is split into contiguous runs of the same kind ("waves"). Every
//! object of a wave is handled by its own task and a wave must finish before
//! the next one starts, so a Namespace listed before the objects living in it
//! exists by the time they are written.

use std::{future::Future, ops::Range, sync::Arc};

use thiserror::Error;
use tokio::{
	sync::mpsc,
	task::{JoinError, JoinSet},
};
use tracing::Instrument;

use super::{error::join, ApiError, ResourceId, ResourceInfo, ResourceList};

#[derive(Debug, Error)]
pub enum BatchError {
	#[error("no objects visited")]
	NoObjectsVisited,

	#[error("batch task panicked")]
	TaskPanicked(#[source] JoinError),

	#[error("{}", join(.0, ", "))]
	Failed(Vec<ResourceError>),
}

/// Failure of the operation on a single object.
#[derive(Debug, Error)]
#[error("{id}")]
pub struct ResourceError {
	pub id: ResourceId,
	#[source]
	pub source: ApiError,
}

/// Result of the operation on the object at `index` of the input.
#[derive(Debug)]
pub struct TaskOutcome<T> {
	pub index: usize,
	pub result: Result<T, ApiError>,
}

/// Index ranges of the contiguous same-kind runs of `infos`.
pub fn waves(infos: &[ResourceInfo]) -> Vec<Range<usize>> {
	let mut waves = Vec::new();
	let mut start = 0;
	for i in 1..=infos.len() {
		if i == infos.len() || infos[i].id.kind != infos[start].id.kind {
			waves.push(start..i);
			start = i;
		}
	}
	waves
}

/// Outcomes of a batch, in input order.
#[derive(Debug)]
pub struct Outcomes<T> {
	pub outcomes: Vec<TaskOutcome<T>>,
	/// First panic of a task. No wave after the panicking one was started.
	pub panic: Option<JoinError>,
}

/// Run `op` on every object of `infos`, one wave at a time.
///
/// Per-object failures are reported in the outcomes; only an empty input
/// fails the batch. A panicking task stops the batch after its wave, and the
/// outcomes gathered up to then are kept next to the panic.
pub async fn perform<T, F, Fut>(infos: &ResourceList, op: F) -> Result<Outcomes<T>, BatchError>
where
	T: Send + 'static,
	F: Fn(ResourceInfo) -> Fut + Send + Sync + 'static,
	Fut: Future<Output = Result<T, ApiError>> + Send + 'static,
{
	if infos.is_empty() {
		return Err(BatchError::NoObjectsVisited);
	}

	let (tx, mut rx) = mpsc::channel(infos.len());
	let producer = batch_perform(infos.as_slice(), Arc::new(op), tx);
	let consumer = async {
		let mut outcomes = Vec::with_capacity(infos.len());
		while let Some(outcome) = rx.recv().await {
			outcomes.push(outcome);
		}
		outcomes
	};

	let (panic, mut outcomes) = tokio::join!(producer, consumer);
	outcomes.sort_by_key(|outcome: &TaskOutcome<T>| outcome.index);
	Ok(Outcomes { outcomes, panic })
}

async fn batch_perform<T, F, Fut>(
	infos: &[ResourceInfo],
	op: Arc<F>,
	tx: mpsc::Sender<TaskOutcome<T>>,
) -> Option<JoinError>
where
	T: Send + 'static,
	F: Fn(ResourceInfo) -> Fut + Send + Sync + 'static,
	Fut: Future<Output = Result<T, ApiError>> + Send + 'static,
{
	for wave in waves(infos) {
		let kind = &infos[wave.start].id.kind;
		tracing::trace!(%kind, objects = wave.len(), "starting wave");

		let mut join_set = JoinSet::new();
		for index in wave {
			let info = infos[index].clone();
			let op = Arc::clone(&op);
			let tx = tx.clone();
			let span = tracing::debug_span!("batch_task", kind = %info.id.kind, name = %info.id.name);
			join_set.spawn(
				async move {
					let result = op(info).await;
					// The receiver outlives every sender
					let _ = tx.send(TaskOutcome { index, result }).await;
				}
				.instrument(span),
			);
		}

		// Siblings of a panicking task still run to completion
		let mut panic = None;
		while let Some(joined) = join_set.join_next().await {
			if let Err(e) = joined {
				tracing::error!(%kind, error = %e, "batch task panicked");
				panic.get_or_insert(e);
			}
		}
		if panic.is_some() {
			return panic;
		}
	}
	None
}
