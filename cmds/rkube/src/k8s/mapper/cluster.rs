//! [`ResourceMapper`] backed by a live API server.

use std::collections::HashSet;

use async_trait::async_trait;
use k8s::PatchEncoding;
use kube::{
	api::{DeleteParams, DynamicObject, Patch, PatchParams, PostParams},
	Client,
};
use serde_json::Value;
use tracing::instrument;

use super::{dynamic_api, ApiError, DeletionPropagation, FieldManager, MapperError, ResourceMapper};
use crate::k8s::{
	discovery::ApiResourceCache,
	manifest::{build_info, gvk_from_manifest, parse_manifests, ManifestError},
	resource::ResourceInfo,
	ResourceList,
};

pub struct KubeMapper {
	client: Client,
	default_namespace: String,
}

impl KubeMapper {
	pub fn new(client: Client, default_namespace: impl Into<String>) -> Self {
		Self {
			client,
			default_namespace: default_namespace.into(),
		}
	}

	pub fn client(&self) -> &Client {
		&self.client
	}
}

fn to_dynamic(value: &Value) -> Result<DynamicObject, ApiError> {
	serde_json::from_value(value.clone()).map_err(ApiError::Serialization)
}

fn to_value(object: &DynamicObject) -> Result<Value, ApiError> {
	serde_json::to_value(object).map_err(ApiError::Serialization)
}

#[async_trait]
impl ResourceMapper for KubeMapper {
	fn default_namespace(&self) -> &str {
		&self.default_namespace
	}

	#[instrument(skip_all, fields(bytes = manifests.len()))]
	async fn resolve(&self, manifests: &[u8]) -> Result<ResourceList, MapperError> {
		let documents = parse_manifests(manifests)?;

		let mut keys = HashSet::new();
		for document in &documents {
			keys.insert(gvk_from_manifest(document).ok_or(ManifestError::MissingApiVersionOrKind)?);
		}

		let cache = ApiResourceCache::build(&self.client, keys, false)
			.await
			.map_err(|e| MapperError::Discovery(Box::new(e)))?;

		let mut list = ResourceList::new();
		for document in documents {
			let gvk = gvk_from_manifest(&document).ok_or(ManifestError::MissingApiVersionOrKind)?;
			let mapping = cache
				.lookup(&gvk)
				.ok_or_else(|| MapperError::UnknownResourceType {
					api_version: gvk.api_version(),
					kind: gvk.kind.clone(),
				})?
				.clone();
			list.push(build_info(document, mapping, &self.default_namespace)?);
		}

		tracing::debug!(count = list.len(), "resolved manifests");
		Ok(list)
	}

	#[instrument(skip_all, fields(resource = %info.id))]
	async fn get(&self, info: &ResourceInfo) -> Result<Value, ApiError> {
		let object = dynamic_api(&self.client, info).get(&info.id.name).await?;
		to_value(&object)
	}

	#[instrument(skip_all, fields(resource = %info.id))]
	async fn create(&self, info: &ResourceInfo, field_manager: &FieldManager) -> Result<Value, ApiError> {
		let params = PostParams {
			field_manager: Some(field_manager.to_string()),
			..Default::default()
		};
		let object = to_dynamic(info.object.value())?;
		let created = dynamic_api(&self.client, info).create(&params, &object).await?;
		to_value(&created)
	}

	#[instrument(skip_all, fields(resource = %info.id, encoding = ?encoding))]
	async fn patch(
		&self,
		info: &ResourceInfo,
		body: &Value,
		encoding: PatchEncoding,
		field_manager: &FieldManager,
	) -> Result<Value, ApiError> {
		let params = PatchParams {
			field_manager: Some(field_manager.to_string()),
			..Default::default()
		};
		let patch = match encoding {
			PatchEncoding::Merge => Patch::Merge(body),
			PatchEncoding::Strategic => Patch::Strategic(body),
		};
		let patched = dynamic_api(&self.client, info)
			.patch(&info.id.name, &params, &patch)
			.await?;
		to_value(&patched)
	}

	#[instrument(skip_all, fields(resource = %info.id))]
	async fn replace(&self, info: &ResourceInfo, field_manager: &FieldManager) -> Result<Value, ApiError> {
		let api = dynamic_api(&self.client, info);
		let live = api.get(&info.id.name).await?;

		let mut object = to_dynamic(info.object.value())?;
		object.metadata.resource_version = live.metadata.resource_version;

		let params = PostParams {
			field_manager: Some(field_manager.to_string()),
			..Default::default()
		};
		let replaced = api.replace(&info.id.name, &params, &object).await?;
		to_value(&replaced)
	}

	#[instrument(skip_all, fields(resource = %info.id, propagation = ?propagation))]
	async fn delete(&self, info: &ResourceInfo, propagation: DeletionPropagation) -> Result<(), ApiError> {
		let params = DeleteParams {
			propagation_policy: Some(propagation.into()),
			..Default::default()
		};
		dynamic_api(&self.client, info)
			.delete(&info.id.name, &params)
			.await?;
		Ok(())
	}
}
