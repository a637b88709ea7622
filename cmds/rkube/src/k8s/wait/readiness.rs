//! Readiness rules shared by every waiter.

use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadyStatus {
	Ready,
	/// Not ready yet, with a human-readable reason.
	Pending(String),
	/// Will never become ready.
	Failed(String),
}

fn int(object: &Value, pointer: &str) -> Option<i64> {
	object.pointer(pointer).and_then(Value::as_i64)
}

fn str_at<'a>(object: &'a Value, pointer: &str) -> Option<&'a str> {
	object.pointer(pointer).and_then(Value::as_str)
}

/// `status` of the condition of `type`, if the object reports it.
fn condition<'a>(object: &'a Value, condition_type: &str) -> Option<&'a Value> {
	object
		.pointer("/status/conditions")?
		.as_array()?
		.iter()
		.find(|c| c["type"] == condition_type)
}

fn condition_true(object: &Value, condition_type: &str) -> bool {
	condition(object, condition_type).is_some_and(|c| c["status"] == "True")
}

/// Whether the controller has seen the latest spec.
fn generation_observed(object: &Value) -> bool {
	match (
		int(object, "/metadata/generation"),
		int(object, "/status/observedGeneration"),
	) {
		(Some(generation), Some(observed)) => observed >= generation,
		(Some(_), None) => false,
		_ => true,
	}
}

fn replicas_ready(object: &Value, desired: i64, ready_field: &str) -> ReadyStatus {
	let ready = int(object, &format!("/status/{ready_field}")).unwrap_or(0);
	if ready >= desired {
		ReadyStatus::Ready
	} else {
		ReadyStatus::Pending(format!("{ready} of {desired} replicas ready"))
	}
}

fn deployment(object: &Value) -> ReadyStatus {
	if object.pointer("/spec/paused") == Some(&Value::Bool(true)) {
		return ReadyStatus::Ready;
	}
	let desired = int(object, "/spec/replicas").unwrap_or(1);
	let updated = int(object, "/status/updatedReplicas").unwrap_or(0);
	if updated < desired {
		return ReadyStatus::Pending(format!("{updated} of {desired} replicas updated"));
	}
	replicas_ready(object, desired, "availableReplicas")
}

fn stateful_set(object: &Value) -> ReadyStatus {
	if str_at(object, "/spec/updateStrategy/type") == Some("OnDelete") {
		return ReadyStatus::Ready;
	}
	let desired = int(object, "/spec/replicas").unwrap_or(1);
	let current = str_at(object, "/status/currentRevision");
	let update = str_at(object, "/status/updateRevision");
	if update.is_some() && current != update {
		return ReadyStatus::Pending("rolling update in progress".to_string());
	}
	replicas_ready(object, desired, "readyReplicas")
}

fn daemon_set(object: &Value) -> ReadyStatus {
	if str_at(object, "/spec/updateStrategy/type") == Some("OnDelete") {
		return ReadyStatus::Ready;
	}
	let desired = int(object, "/status/desiredNumberScheduled").unwrap_or(0);
	let updated = int(object, "/status/updatedNumberScheduled").unwrap_or(0);
	if updated < desired {
		return ReadyStatus::Pending(format!("{updated} of {desired} pods updated"));
	}
	let ready = int(object, "/status/numberReady").unwrap_or(0);
	if ready < desired {
		return ReadyStatus::Pending(format!("{ready} of {desired} pods ready"));
	}
	ReadyStatus::Ready
}

fn pod(object: &Value) -> ReadyStatus {
	match str_at(object, "/status/phase") {
		Some("Succeeded") => ReadyStatus::Ready,
		Some("Failed") => ReadyStatus::Failed("pod failed".to_string()),
		_ if condition_true(object, "Ready") => ReadyStatus::Ready,
		_ => ReadyStatus::Pending("pod not ready".to_string()),
	}
}

fn job(object: &Value) -> ReadyStatus {
	if condition_true(object, "Failed") {
		let message = condition(object, "Failed")
			.and_then(|c| c["message"].as_str())
			.unwrap_or("job failed");
		return ReadyStatus::Failed(message.to_string());
	}
	if condition_true(object, "Complete") {
		return ReadyStatus::Ready;
	}
	ReadyStatus::Pending("job not complete".to_string())
}

fn service(object: &Value) -> ReadyStatus {
	if str_at(object, "/spec/type") != Some("LoadBalancer") {
		return ReadyStatus::Ready;
	}
	let has_ingress = object
		.pointer("/status/loadBalancer/ingress")
		.and_then(Value::as_array)
		.is_some_and(|ingress| !ingress.is_empty());
	if has_ingress {
		ReadyStatus::Ready
	} else {
		ReadyStatus::Pending("load balancer has no ingress address".to_string())
	}
}

/// Readiness of a live object.
pub fn readiness(object: &Value) -> ReadyStatus {
	let kind = object["kind"].as_str().unwrap_or_default();

	let rolls_out = matches!(
		kind,
		"Deployment" | "StatefulSet" | "DaemonSet" | "ReplicaSet" | "ReplicationController"
	);
	if rolls_out && !generation_observed(object) {
		return ReadyStatus::Pending("spec update not observed yet".to_string());
	}

	match kind {
		"Deployment" => deployment(object),
		"StatefulSet" => stateful_set(object),
		"DaemonSet" => daemon_set(object),
		"ReplicaSet" | "ReplicationController" => {
			replicas_ready(object, int(object, "/spec/replicas").unwrap_or(1), "readyReplicas")
		}
		"Pod" => pod(object),
		"Job" => job(object),
		"PersistentVolumeClaim" => match str_at(object, "/status/phase") {
			Some("Bound") => ReadyStatus::Ready,
			_ => ReadyStatus::Pending("claim not bound".to_string()),
		},
		"Service" => service(object),
		"CustomResourceDefinition" => {
			if condition_true(object, "Established") {
				ReadyStatus::Ready
			} else {
				ReadyStatus::Pending("not established".to_string())
			}
		}
		_ => ReadyStatus::Ready,
	}
}
