//! Reconciling a previously applied set of objects into a new one.

use thiserror::Error;
use tracing::instrument;

use super::{
	engine::{Partial, ReconcileEngine, ReconcileResult},
	error::join,
	mapper::DeletionPropagation,
	patch::{plan_patch, PatchPlanError},
	resource::ResourceInfo,
	retry::retry_on_conflict,
	ApiError, ResourceId, ResourceList, KEEP_POLICY, RESOURCE_POLICY_ANNOTATION,
};

#[derive(Debug, Error)]
pub enum UpdateError {
	#[error("could not get information about the resource")]
	Probe {
		id: ResourceId,
		#[source]
		source: ApiError,
	},

	#[error("failed to create resource")]
	Create {
		id: ResourceId,
		#[source]
		source: ApiError,
	},

	/// The object exists in the cluster but was not part of the previous set.
	#[error("no {kind} with the name {name:?} found")]
	NotTracked { kind: String, name: String },

	#[error("{}", join(.0, " && "))]
	Apply(Vec<ApplyError>),
}

/// Failure to bring a single existing object to its target state.
#[derive(Debug, Error)]
pub enum ApplyError {
	#[error("failed to replace object")]
	Replace {
		id: ResourceId,
		#[source]
		source: ApiError,
	},

	#[error("failed to create patch")]
	PlanPatch {
		id: ResourceId,
		#[source]
		source: PatchPlanError,
	},

	#[error("cannot patch {:?} with kind {}", .id.name, .id.kind)]
	Patch {
		id: ResourceId,
		#[source]
		source: ApiError,
	},

	#[error("failed to refresh resource information")]
	Refresh {
		id: ResourceId,
		#[source]
		source: ApiError,
	},
}

impl ApplyError {
	pub fn id(&self) -> &ResourceId {
		match self {
			ApplyError::Replace { id, .. }
			| ApplyError::PlanPatch { id, .. }
			| ApplyError::Patch { id, .. }
			| ApplyError::Refresh { id, .. } => id,
		}
	}
}

impl ReconcileEngine {
	/// Reconcile the cluster from `original` to `target`.
	///
	/// Objects of `target` missing from the cluster are created, the others
	/// are patched (or replaced with `force`). Only when every object of
	/// `target` went through cleanly are the objects of `original` absent
	/// from `target` deleted, unless they carry the keep annotation.
	///
	/// Handles of `target` are refreshed with the server's view as they are
	/// written. The result lists what was done even when an error is returned.
	#[instrument(skip_all, fields(original = original.len(), target = target.len(), force))]
	pub async fn update(
		&self,
		original: &ResourceList,
		target: &mut ResourceList,
		force: bool,
	) -> Result<ReconcileResult, Partial<UpdateError>> {
		let mut result = ReconcileResult::default();
		let mut apply_errors = Vec::new();

		for info in target.iter_mut() {
			match self.mapper.get(info).await {
				Ok(_) => {}
				Err(e) if e.is_not_found() => {
					let created = self.create_one(info).await;
					result.created.push(info.clone());
					if let Err(source) = created {
						let error = UpdateError::Create {
							id: info.id.clone(),
							source,
						};
						return Err(Partial::new(result, error));
					}
					tracing::debug!(
						kind = %info.id.kind,
						name = %info.id.name,
						namespace = ?info.id.namespace,
						"created a new resource"
					);
					continue;
				}
				Err(source) => {
					let error = UpdateError::Probe {
						id: info.id.clone(),
						source,
					};
					return Err(Partial::new(result, error));
				}
			}

			let Some(original_info) = original.get(&info.id) else {
				let error = UpdateError::NotTracked {
					kind: info.id.kind.clone(),
					name: info.id.name.clone(),
				};
				return Err(Partial::new(result, error));
			};

			if let Err(e) = self.apply_one(info, original_info, force).await {
				tracing::debug!(resource = %info.id, error = %e, "error updating the resource");
				apply_errors.push(e);
			}
			result.updated.push(info.clone());
		}

		if !apply_errors.is_empty() {
			return Err(Partial::new(result, UpdateError::Apply(apply_errors)));
		}

		for mut info in original.difference(target) {
			tracing::debug!(resource = %info.id, "deleting resource");

			match self.mapper.get(&info).await {
				Ok(live) => info.refresh(live),
				Err(e) => {
					tracing::debug!(resource = %info.id, error = %e, "unable to get object");
					continue;
				}
			}

			if info.annotation(RESOURCE_POLICY_ANNOTATION) == Some(KEEP_POLICY) {
				tracing::debug!(
					resource = %info.id,
					annotation = RESOURCE_POLICY_ANNOTATION,
					"skipping delete due to annotation"
				);
				continue;
			}

			let deleted = retry_on_conflict(&self.retry, || {
				self.mapper.delete(&info, DeletionPropagation::Background)
			})
			.await;
			if let Err(e) = deleted {
				tracing::debug!(resource = %info.id, error = %e, "failed to delete resource");
				continue;
			}
			result.deleted.push(info);
		}

		Ok(result)
	}

	async fn create_one(&self, info: &mut ResourceInfo) -> Result<(), ApiError> {
		let live = retry_on_conflict(&self.retry, || {
			self.mapper.create(info, &self.field_manager)
		})
		.await?;
		info.refresh(live);
		Ok(())
	}

	async fn apply_one(&self, target: &mut ResourceInfo, original: &ResourceInfo, force: bool) -> Result<(), ApplyError> {
		let live = if force {
			let replaced = self
				.mapper
				.replace(target, &self.field_manager)
				.await
				.map_err(|source| ApplyError::Replace {
					id: target.id.clone(),
					source,
				})?;
			tracing::debug!(resource = %target.id, "replace succeeded");
			replaced
		} else {
			let planned = plan_patch(self.mapper.as_ref(), target, original)
				.await
				.map_err(|source| ApplyError::PlanPatch {
					id: target.id.clone(),
					source,
				})?;

			if planned.is_empty() {
				tracing::debug!(kind = %target.id.kind, name = %target.id.name, "no changes detected");
				let live = self.mapper.get(target).await.map_err(|source| ApplyError::Refresh {
					id: target.id.clone(),
					source,
				})?;
				target.refresh(live);
				return Ok(());
			}

			tracing::debug!(
				kind = %target.id.kind,
				name = %target.id.name,
				namespace = ?target.id.namespace,
				encoding = ?planned.encoding,
				"patching resource"
			);
			self.mapper
				.patch(target, &planned.body, planned.encoding, &self.field_manager)
				.await
				.map_err(|source| ApplyError::Patch {
					id: target.id.clone(),
					source,
				})?
		};

		target.refresh(live);
		Ok(())
	}
}
