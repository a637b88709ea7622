//! List-merge metadata for built-in object types.
//!
//! Strategic merge patches need to know, for every list field, whether the
//! list is merged element-wise by a key, merged as a set of primitives, or
//! replaced atomically. The API server takes this from struct tags on the
//! built-in types. Here the same information lives in a static registry keyed
//! by `apiVersion/kind`. Types missing from the registry (custom resources and
//! CustomResourceDefinitions) have no strategic merge semantics at all.

use phf::phf_map;

/// How a list field is merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListStrategy {
	/// Elements are objects identified by the named field.
	MergeByKey(&'static str),
	/// Elements are primitives merged as a set.
	MergePrimitives,
}

/// A list field, addressed by the object keys leading to it. Array levels do
/// not contribute path segments.
#[derive(Debug)]
pub struct ListField {
	pub path: &'static [&'static str],
	pub strategy: ListStrategy,
}

impl ListField {
	const fn keyed(path: &'static [&'static str], key: &'static str) -> Self {
		Self {
			path,
			strategy: ListStrategy::MergeByKey(key),
		}
	}

	const fn primitives(path: &'static [&'static str]) -> Self {
		Self {
			path,
			strategy: ListStrategy::MergePrimitives,
		}
	}
}

/// A set of list fields rooted at a common prefix.
#[derive(Debug)]
pub struct FieldGroup {
	pub prefix: &'static [&'static str],
	pub fields: &'static [ListField],
}

/// Merge metadata for one registered type.
#[derive(Debug)]
pub struct PatchMeta {
	groups: &'static [FieldGroup],
}

const OBJECT_META: FieldGroup = FieldGroup {
	prefix: &["metadata"],
	fields: &[
		ListField::keyed(&["ownerReferences"], "uid"),
		ListField::primitives(&["finalizers"]),
	],
};

const POD_SPEC: &[ListField] = &[
	ListField::keyed(&["containers"], "name"),
	ListField::keyed(&["containers", "ports"], "containerPort"),
	ListField::keyed(&["containers", "env"], "name"),
	ListField::keyed(&["containers", "volumeMounts"], "mountPath"),
	ListField::keyed(&["containers", "volumeDevices"], "devicePath"),
	ListField::keyed(&["initContainers"], "name"),
	ListField::keyed(&["initContainers", "ports"], "containerPort"),
	ListField::keyed(&["initContainers", "env"], "name"),
	ListField::keyed(&["initContainers", "volumeMounts"], "mountPath"),
	ListField::keyed(&["initContainers", "volumeDevices"], "devicePath"),
	ListField::keyed(&["ephemeralContainers"], "name"),
	ListField::keyed(&["ephemeralContainers", "env"], "name"),
	ListField::keyed(&["ephemeralContainers", "volumeMounts"], "mountPath"),
	ListField::keyed(&["ephemeralContainers", "volumeDevices"], "devicePath"),
	ListField::keyed(&["volumes"], "name"),
	ListField::keyed(&["imagePullSecrets"], "name"),
	ListField::keyed(&["hostAliases"], "ip"),
	ListField::keyed(&["topologySpreadConstraints"], "topologyKey"),
	ListField::keyed(&["resourceClaims"], "name"),
	ListField::keyed(&["schedulingGates"], "name"),
];

const POD_TEMPLATE_META: FieldGroup = FieldGroup {
	prefix: &["spec", "template", "metadata"],
	fields: OBJECT_META.fields,
};

const POD: PatchMeta = PatchMeta {
	groups: &[
		OBJECT_META,
		FieldGroup {
			prefix: &["spec"],
			fields: POD_SPEC,
		},
	],
};

const POD_TEMPLATE: PatchMeta = PatchMeta {
	groups: &[
		OBJECT_META,
		FieldGroup {
			prefix: &["template", "spec"],
			fields: POD_SPEC,
		},
	],
};

/// Deployments, ReplicaSets, DaemonSets, StatefulSets, Jobs and
/// ReplicationControllers all embed a pod template at `spec.template`.
const WORKLOAD: PatchMeta = PatchMeta {
	groups: &[
		OBJECT_META,
		POD_TEMPLATE_META,
		FieldGroup {
			prefix: &["spec", "template", "spec"],
			fields: POD_SPEC,
		},
	],
};

const CRON_JOB: PatchMeta = PatchMeta {
	groups: &[
		OBJECT_META,
		FieldGroup {
			prefix: &["spec", "jobTemplate", "spec", "template", "spec"],
			fields: POD_SPEC,
		},
	],
};

const SERVICE: PatchMeta = PatchMeta {
	groups: &[
		OBJECT_META,
		FieldGroup {
			prefix: &["spec"],
			fields: &[ListField::keyed(&["ports"], "port")],
		},
	],
};

/// Registered types without list fields of their own.
const PLAIN: PatchMeta = PatchMeta {
	groups: &[OBJECT_META],
};

static REGISTRY: phf::Map<&'static str, PatchMeta> = phf_map! {
	"v1/Pod" => POD,
	"v1/PodTemplate" => POD_TEMPLATE,
	"v1/ReplicationController" => WORKLOAD,
	"apps/v1/Deployment" => WORKLOAD,
	"apps/v1/ReplicaSet" => WORKLOAD,
	"apps/v1/DaemonSet" => WORKLOAD,
	"apps/v1/StatefulSet" => WORKLOAD,
	"batch/v1/Job" => WORKLOAD,
	"batch/v1/CronJob" => CRON_JOB,
	"v1/Service" => SERVICE,
	"v1/ConfigMap" => PLAIN,
	"v1/Secret" => PLAIN,
	"v1/Namespace" => PLAIN,
	"v1/ServiceAccount" => PLAIN,
	"v1/Endpoints" => PLAIN,
	"v1/LimitRange" => PLAIN,
	"v1/ResourceQuota" => PLAIN,
	"v1/PersistentVolume" => PLAIN,
	"v1/PersistentVolumeClaim" => PLAIN,
	"rbac.authorization.k8s.io/v1/Role" => PLAIN,
	"rbac.authorization.k8s.io/v1/ClusterRole" => PLAIN,
	"rbac.authorization.k8s.io/v1/RoleBinding" => PLAIN,
	"rbac.authorization.k8s.io/v1/ClusterRoleBinding" => PLAIN,
	"networking.k8s.io/v1/Ingress" => PLAIN,
	"networking.k8s.io/v1/IngressClass" => PLAIN,
	"networking.k8s.io/v1/NetworkPolicy" => PLAIN,
	"policy/v1/PodDisruptionBudget" => PLAIN,
	"autoscaling/v1/HorizontalPodAutoscaler" => PLAIN,
	"autoscaling/v2/HorizontalPodAutoscaler" => PLAIN,
	"storage.k8s.io/v1/StorageClass" => PLAIN,
	"scheduling.k8s.io/v1/PriorityClass" => PLAIN,
	"admissionregistration.k8s.io/v1/ValidatingWebhookConfiguration" => PLAIN,
	"admissionregistration.k8s.io/v1/MutatingWebhookConfiguration" => PLAIN,
};

/// Find the merge metadata of a registered type.
pub fn lookup(api_version: &str, kind: &str) -> Option<&'static PatchMeta> {
	REGISTRY.get(format!("{api_version}/{kind}").as_str())
}

impl PatchMeta {
	/// Strategy for the list at `path`, or `None` if the list is atomic.
	pub fn list_strategy<S: AsRef<str>>(&self, path: &[S]) -> Option<ListStrategy> {
		self.groups.iter().find_map(|group| {
			let rest = strip_prefix(path, group.prefix)?;
			group
				.fields
				.iter()
				.find(|field| segments_eq(rest, field.path))
				.map(|field| field.strategy)
		})
	}
}

fn strip_prefix<'a, S: AsRef<str>>(path: &'a [S], prefix: &[&str]) -> Option<&'a [S]> {
	if path.len() < prefix.len() || !segments_eq(&path[..prefix.len()], prefix) {
		return None;
	}
	Some(&path[prefix.len()..])
}

fn segments_eq<S: AsRef<str>>(a: &[S], b: &[&str]) -> bool {
	a.len() == b.len() && a.iter().zip(b).all(|(a, b)| a.as_ref() == *b)
}

#[cfg(test)]
mod tests {
	use rstest::rstest;

	use super::*;

	#[rstest]
	#[case::deployment("apps/v1", "Deployment", true)]
	#[case::core_pod("v1", "Pod", true)]
	#[case::secret("v1", "Secret", true)]
	#[case::crd("apiextensions.k8s.io/v1", "CustomResourceDefinition", false)]
	#[case::custom_resource("example.com/v1", "Widget", false)]
	#[case::unknown_version("apps/v1beta1", "Deployment", false)]
	fn test_lookup(#[case] api_version: &str, #[case] kind: &str, #[case] registered: bool) {
		assert_eq!(lookup(api_version, kind).is_some(), registered);
	}

	#[rstest]
	#[case::containers(&["spec", "template", "spec", "containers"], Some(ListStrategy::MergeByKey("name")))]
	#[case::container_ports(
		&["spec", "template", "spec", "containers", "ports"],
		Some(ListStrategy::MergeByKey("containerPort"))
	)]
	#[case::finalizers(&["metadata", "finalizers"], Some(ListStrategy::MergePrimitives))]
	#[case::template_owner_refs(
		&["spec", "template", "metadata", "ownerReferences"],
		Some(ListStrategy::MergeByKey("uid"))
	)]
	#[case::container_args(&["spec", "template", "spec", "containers", "args"], None)]
	#[case::wrong_prefix(&["spec", "containers"], None)]
	fn test_deployment_list_strategy(#[case] path: &[&str], #[case] expected: Option<ListStrategy>) {
		let meta = lookup("apps/v1", "Deployment").unwrap();
		assert_eq!(meta.list_strategy(path), expected);
	}

	#[test]
	fn test_service_ports_keyed_by_port() {
		let meta = lookup("v1", "Service").unwrap();
		assert_eq!(
			meta.list_strategy(&["spec", "ports"]),
			Some(ListStrategy::MergeByKey("port"))
		);
	}

	#[test]
	fn test_cron_job_nested_template() {
		let meta = lookup("batch/v1", "CronJob").unwrap();
		let path = ["spec", "jobTemplate", "spec", "template", "spec", "volumes"];
		assert_eq!(meta.list_strategy(&path), Some(ListStrategy::MergeByKey("name")));
	}
}
