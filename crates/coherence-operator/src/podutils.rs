use k8s_openapi::api::core::v1::{Pod, PodCondition, PodStatus};
use strum::{Display, EnumString};

use crate::crd::LABEL_REVISION_HASH;

/// While the `phase` field of a Pod is a string only the values from this enum are allowed.
#[derive(Clone, Copy, Debug, Display, EnumString, Eq, PartialEq)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

pub fn pod_phase(pod: &Pod) -> Option<PodPhase> {
    pod.status
        .as_ref()
        .and_then(|status| status.phase.as_deref())
        .and_then(|phase| phase.parse().ok())
}

pub fn is_pod_running(pod: &Pod) -> bool {
    pod_phase(pod) == Some(PodPhase::Running)
}

/// A Pod is ready when it is not being deleted, is `Running` and its `Ready` condition is `True`.
pub fn is_pod_ready(pod: &Pod) -> bool {
    pod.metadata.deletion_timestamp.is_none()
        && is_pod_running(pod)
        && pod.status.as_ref().is_some_and(is_pod_ready_condition_true)
}

fn is_pod_ready_condition_true(status: &PodStatus) -> bool {
    matches!(
        get_pod_condition(status, "Ready"),
        Some(PodCondition { status, .. }) if status == "True"
    )
}

fn get_pod_condition<'a>(status: &'a PodStatus, condition: &str) -> Option<&'a PodCondition> {
    status
        .conditions
        .as_ref()?
        .iter()
        .find(|c| c.type_ == condition)
}

/// The StatefulSet revision the Pod was created from.
pub fn pod_revision(pod: &Pod) -> Option<&str> {
    pod.metadata
        .labels
        .as_ref()?
        .get(LABEL_REVISION_HASH)
        .map(String::as_str)
}

pub fn pod_node(pod: &Pod) -> Option<&str> {
    pod.spec.as_ref()?.node_name.as_deref()
}
