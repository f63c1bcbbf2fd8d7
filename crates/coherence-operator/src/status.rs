//! Phase and condition bookkeeping for [`CoherenceClusterStatus`].
//!
//! The phase is derived from what is observed on the StatefulSet. Every phase change records a
//! `True` condition for the new phase and, when leaving a phase that tracks an activity, a `False`
//! condition for the old one.

use k8s_openapi::{api::apps::v1::StatefulSetStatus, apimachinery::pkg::apis::meta::v1::Time};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::{
    crd::CoherenceCluster,
    store::{ResourceStore, StoreError},
};

#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Display,
    EnumString,
    Eq,
    Hash,
    JsonSchema,
    PartialEq,
    Serialize,
)]
#[serde(rename_all = "PascalCase")]
pub enum Phase {
    Initialized,
    Created,
    Ready,
    Waiting,
    Scaling,
    RollingUpgrade,
    Stopped,
    Failed,
}

impl Phase {
    /// Phases that describe an ongoing activity. Leaving one records a `False` condition.
    fn records_exit(self) -> bool {
        matches!(
            self,
            Self::Ready | Self::Scaling | Self::RollingUpgrade | Self::Waiting | Self::Stopped
        )
    }
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GridCondition {
    #[serde(rename = "type")]
    pub type_: Phase,
    pub status: ConditionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    /// Last time the condition transitioned from one status to another.
    pub last_transition_time: Option<Time>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl GridCondition {
    pub fn new(type_: Phase, status: ConditionStatus) -> Self {
        Self {
            type_,
            status,
            last_transition_time: None,
            reason: None,
            message: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>, message: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self.message = Some(message.into());
        self
    }
}

#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CoherenceClusterStatus {
    pub phase: Option<Phase>,
    #[serde(default)]
    pub replicas: i32,
    #[serde(default)]
    pub current_replicas: i32,
    #[serde(default)]
    pub ready_replicas: i32,
    #[serde(default)]
    pub conditions: Vec<GridCondition>,
    #[serde(default)]
    pub actions_executed: bool,
}

impl CoherenceClusterStatus {
    /// Folds an observation of the StatefulSet into the status.
    ///
    /// Returns whether anything changed, so repeated calls with the same input return `false`.
    pub fn update(&mut self, desired_replicas: i32, observed: Option<&StatefulSetStatus>) -> bool {
        let mut updated = self.ensure_initialized(desired_replicas);

        match observed {
            Some(sts) => {
                let current = sts.current_replicas.unwrap_or(0);
                let ready = sts.ready_replicas.unwrap_or(0);
                updated |= set_if_changed(&mut self.current_replicas, current);
                updated |= set_if_changed(&mut self.ready_replicas, ready);

                if sts.current_revision == sts.update_revision {
                    if self.phase != Some(Phase::Ready)
                        && self.replicas == ready
                        && self.replicas == current
                    {
                        updated |= self.set_phase(Phase::Ready);
                    }
                } else {
                    updated |= self.set_phase(Phase::RollingUpgrade);
                }
            }
            None => {
                updated |= set_if_changed(&mut self.current_replicas, 0);
                updated |= set_if_changed(&mut self.ready_replicas, 0);
            }
        }

        if desired_replicas == 0 {
            updated |= self.set_phase(Phase::Stopped);
        }
        updated
    }

    fn ensure_initialized(&mut self, desired_replicas: i32) -> bool {
        let mut updated = set_if_changed(&mut self.replicas, desired_replicas);
        if self.phase.is_none() {
            updated |= self.set_phase(Phase::Initialized);
        }
        updated
    }

    /// Moves to `phase`, recording the exit of the previous phase where that phase tracks an
    /// activity.
    pub fn set_phase(&mut self, phase: Phase) -> bool {
        if self.phase == Some(phase) {
            return false;
        }
        if let Some(old) = self.phase.filter(|old| old.records_exit()) {
            self.set_condition(GridCondition::new(old, ConditionStatus::False));
        }
        self.phase = Some(phase);
        self.set_condition(GridCondition::new(phase, ConditionStatus::True));
        true
    }

    /// Sets the phase and attaches a reason to its condition.
    pub fn set_phase_with_reason(
        &mut self,
        phase: Phase,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> bool {
        let changed = self.set_phase(phase);
        changed
            | self.set_condition(
                GridCondition::new(phase, ConditionStatus::True).with_reason(reason, message),
            )
    }

    /// Adds or replaces the condition of the same type.
    ///
    /// The transition time is only bumped when the status flips. Returns whether anything changed.
    pub fn set_condition(&mut self, mut condition: GridCondition) -> bool {
        match self
            .conditions
            .iter_mut()
            .find(|existing| existing.type_ == condition.type_)
        {
            Some(existing) => {
                if existing.status == condition.status {
                    if existing.reason == condition.reason && existing.message == condition.message
                    {
                        return false;
                    }
                    condition.last_transition_time = existing.last_transition_time.clone();
                } else {
                    condition.last_transition_time = Some(now());
                }
                *existing = condition;
            }
            None => {
                condition.last_transition_time = Some(now());
                self.conditions.push(condition);
            }
        }
        true
    }

    pub fn condition(&self, type_: Phase) -> Option<&GridCondition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }
}

/// Applies `mutate` to a copy of the cluster's status and writes it back if anything changed.
pub async fn persist_status<F>(
    store: &dyn ResourceStore,
    cluster: &CoherenceCluster,
    mutate: F,
) -> Result<bool, StoreError>
where
    F: FnOnce(&mut CoherenceClusterStatus) -> bool + Send,
{
    let mut status = cluster.status.clone().unwrap_or_default();
    if !mutate(&mut status) {
        return Ok(false);
    }
    store.update_cluster_status(&cluster.key(), &status).await?;
    Ok(true)
}

pub async fn persist_phase(
    store: &dyn ResourceStore,
    cluster: &CoherenceCluster,
    phase: Phase,
) -> Result<bool, StoreError> {
    persist_status(store, cluster, |status| status.set_phase(phase)).await
}

fn set_if_changed(field: &mut i32, value: i32) -> bool {
    if *field == value {
        false
    } else {
        *field = value;
        true
    }
}

fn now() -> Time {
    Time(k8s_openapi::jiff::Timestamp::now())
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn observed(
        current: i32,
        ready: i32,
        current_rev: &str,
        update_rev: &str,
    ) -> StatefulSetStatus {
        StatefulSetStatus {
            replicas: current,
            current_replicas: Some(current),
            ready_replicas: Some(ready),
            current_revision: Some(current_rev.to_owned()),
            update_revision: Some(update_rev.to_owned()),
            ..StatefulSetStatus::default()
        }
    }

    #[test]
    fn update_is_idempotent() {
        let sts = observed(3, 3, "a", "a");
        let mut status = CoherenceClusterStatus::default();

        assert!(status.update(3, Some(&sts)));
        let snapshot = status.clone();
        assert!(!status.update(3, Some(&sts)));
        assert_eq!(status, snapshot);
        assert_eq!(status.phase, Some(Phase::Ready));
    }

    #[rstest]
    #[case::ready(3, observed(3, 3, "a", "a"), Phase::Ready)]
    #[case::not_all_ready(3, observed(3, 2, "a", "a"), Phase::Initialized)]
    #[case::revision_mismatch(3, observed(3, 3, "a", "b"), Phase::RollingUpgrade)]
    #[case::stopped(0, observed(0, 0, "a", "a"), Phase::Stopped)]
    fn update_derives_phase(
        #[case] desired: i32,
        #[case] sts: StatefulSetStatus,
        #[case] expected: Phase,
    ) {
        let mut status = CoherenceClusterStatus::default();
        status.update(desired, Some(&sts));
        assert_eq!(status.phase, Some(expected));
    }

    #[test]
    fn update_without_statefulset_zeroes_counts() {
        let mut status = CoherenceClusterStatus {
            phase: Some(Phase::Ready),
            replicas: 3,
            current_replicas: 3,
            ready_replicas: 3,
            ..CoherenceClusterStatus::default()
        };
        assert!(status.update(3, None));
        assert_eq!((status.current_replicas, status.ready_replicas), (0, 0));
    }

    #[test]
    fn leaving_an_activity_phase_records_exit_condition() {
        let mut status = CoherenceClusterStatus::default();
        status.set_phase(Phase::Scaling);
        status.set_phase(Phase::Ready);

        let scaling = status.condition(Phase::Scaling).unwrap();
        assert_eq!(scaling.status, ConditionStatus::False);
        let ready = status.condition(Phase::Ready).unwrap();
        assert_eq!(ready.status, ConditionStatus::True);
    }

    #[test]
    fn leaving_created_records_no_exit_condition() {
        let mut status = CoherenceClusterStatus::default();
        status.set_phase(Phase::Created);
        status.set_phase(Phase::Ready);

        assert_eq!(
            status.condition(Phase::Created).unwrap().status,
            ConditionStatus::True
        );
    }

    #[test]
    fn set_phase_to_same_phase_is_noop() {
        let mut status = CoherenceClusterStatus::default();
        assert!(status.set_phase(Phase::Waiting));
        assert!(!status.set_phase(Phase::Waiting));
        assert_eq!(status.conditions.len(), 1);
    }

    #[test]
    fn unchanged_condition_status_keeps_transition_time() {
        let mut status = CoherenceClusterStatus::default();
        status.set_condition(GridCondition::new(Phase::Waiting, ConditionStatus::True));
        let first = status.condition(Phase::Waiting).unwrap().last_transition_time.clone();

        assert!(status.set_condition(
            GridCondition::new(Phase::Waiting, ConditionStatus::True)
                .with_reason("StatusQuorum", "waiting")
        ));
        let second = status.condition(Phase::Waiting).unwrap();
        assert_eq!(second.last_transition_time, first);
        assert_eq!(second.reason.as_deref(), Some("StatusQuorum"));
    }
}
