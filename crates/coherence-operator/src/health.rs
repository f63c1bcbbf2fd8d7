//! Decides whether a cluster is safe to mutate by running probes against its Pods.

use std::sync::Arc;

use k8s_openapi::api::{apps::v1::StatefulSet, core::v1::Pod};
use kube::{ResourceExt, runtime::events::EventType};

use crate::{
    config::ControllerConfig,
    crd::{CoherenceCluster, GridProbe},
    podutils::{is_pod_ready, is_pod_running},
    probe::{PodProber, ProbeResult},
    store::{EventSink, ResourceStore, StoreError},
};

const REASON_CHECK_STATUS_HA: &str = "CheckStatusHA";

/// The result of asking the grid to suspend its services before shutdown.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SuspendOutcome {
    Skipped,
    Successful,
    Failed,
}

pub struct ClusterHealth {
    store: Arc<dyn ResourceStore>,
    prober: Arc<dyn PodProber>,
    events: Arc<dyn EventSink>,
    skip_service_suspend: bool,
}

impl ClusterHealth {
    pub fn new(
        store: Arc<dyn ResourceStore>,
        prober: Arc<dyn PodProber>,
        events: Arc<dyn EventSink>,
        config: &ControllerConfig,
    ) -> Self {
        Self {
            store,
            prober,
            events,
            skip_service_suspend: config.skip_service_suspend,
        }
    }

    /// Lists the Pods matched by the StatefulSet's selector.
    pub async fn pods_for(&self, sts: &StatefulSet) -> Result<Vec<Pod>, StoreError> {
        let selector = sts
            .spec
            .as_ref()
            .and_then(|spec| spec.selector.match_labels.clone())
            .unwrap_or_default();
        self.store
            .list_pods(&sts.namespace().unwrap_or_default(), &selector)
            .await
    }

    /// Runs the cluster's Status HA probe against the StatefulSet's Pods.
    pub async fn is_status_ha(&self, cluster: &CoherenceCluster, sts: &StatefulSet) -> bool {
        tracing::info!(
            cluster = %cluster.key(),
            statefulset = %sts.name_any(),
            "checking StatefulSet for StatusHA"
        );
        self.execute_probe(cluster, sts, &cluster.scaling_probe()).await
    }

    pub async fn execute_probe(
        &self,
        cluster: &CoherenceCluster,
        sts: &StatefulSet,
        probe: &GridProbe,
    ) -> bool {
        match self.pods_for(sts).await {
            Ok(pods) => {
                self.execute_probe_for_subset(cluster, sts, probe, &pods, &pods)
                    .await
            }
            Err(err) => {
                tracing::warn!(
                    cluster = %cluster.key(),
                    error = &err as &dyn std::error::Error,
                    "failed to list Pods for StatefulSet"
                );
                self.events
                    .publish(
                        cluster,
                        EventType::Warning,
                        REASON_CHECK_STATUS_HA,
                        format!("Failed to get Pods for StatefulSet {}: {err}", sts.name_any()),
                    )
                    .await;
                false
            }
        }
    }

    /// Probes `candidates` once every Pod in `all_pods` is ready and their number matches the
    /// StatefulSet's replica count.
    ///
    /// Candidates are tried in order. The first Running candidate that gives a definite answer
    /// decides the result, candidates that are not Running or whose probe could not be evaluated
    /// are skipped.
    pub async fn execute_probe_for_subset(
        &self,
        cluster: &CoherenceCluster,
        sts: &StatefulSet,
        probe: &GridProbe,
        all_pods: &[Pod],
        candidates: &[Pod],
    ) -> bool {
        let key = cluster.key();

        if let Some(pod) = all_pods.iter().find(|pod| !is_pod_ready(pod)) {
            let note = format!(
                "Cannot execute probe, one or more Pods is not in a ready state - {}",
                pod.name_any()
            );
            tracing::info!(cluster = %key, "{note}");
            self.events
                .publish(cluster, EventType::Warning, REASON_CHECK_STATUS_HA, note)
                .await;
            return false;
        }

        let expected = sts.spec.as_ref().and_then(|spec| spec.replicas).unwrap_or(1);
        let count = all_pods.len();
        if count == 0 {
            tracing::info!(cluster = %key, "skipping probe, no Pods found in StatefulSet");
            return true;
        }
        if usize::try_from(expected).ok() != Some(count) {
            let note = format!(
                "Pod count of {count} does not yet match StatefulSet replica count: {expected}"
            );
            tracing::info!(cluster = %key, "{note}");
            self.events
                .publish(cluster, EventType::Normal, REASON_CHECK_STATUS_HA, note)
                .await;
            return false;
        }

        let service = cluster.wka_service_name();
        for pod in candidates {
            if !is_pod_running(pod) {
                tracing::info!(
                    cluster = %key,
                    pod = %pod.name_any(),
                    "skipping probe for Pod that is not in the Running phase"
                );
                continue;
            }

            let outcome = self.prober.run(pod, probe, &service).await;
            let note = format!(
                "Executed probe using Pod {} result={} ({})",
                pod.name_any(),
                outcome.result,
                outcome.diagnostic
            );
            match outcome.result {
                ProbeResult::Success | ProbeResult::Failure => {
                    tracing::info!(cluster = %key, "{note}");
                    self.events
                        .publish(cluster, EventType::Normal, REASON_CHECK_STATUS_HA, note)
                        .await;
                    return outcome.result == ProbeResult::Success;
                }
                ProbeResult::Unknown => {
                    tracing::warn!(cluster = %key, "{note}");
                    self.events
                        .publish(cluster, EventType::Warning, REASON_CHECK_STATUS_HA, note)
                        .await;
                }
            }
        }
        false
    }

    /// Asks the grid to suspend its services ahead of a shutdown.
    pub async fn suspend_services(
        &self,
        cluster: &CoherenceCluster,
        sts: &StatefulSet,
    ) -> SuspendOutcome {
        let key = cluster.key();
        let skip_reason = if self.skip_service_suspend {
            Some("service suspension is disabled for this operator")
        } else if !cluster.suspend_services_on_shutdown() {
            Some("spec.suspendServicesOnShutdown is set to false")
        } else {
            None
        };
        if let Some(reason) = skip_reason {
            let note = format!(
                "Skipping suspension of Coherence services in StatefulSet {}, {reason}",
                sts.name_any()
            );
            tracing::info!(cluster = %key, "{note}");
            self.events
                .publish(cluster, EventType::Warning, "ServiceSuspendSkipped", note)
                .await;
            return SuspendOutcome::Skipped;
        }

        tracing::info!(
            cluster = %key,
            statefulset = %sts.name_any(),
            "suspending Coherence services"
        );
        if self.execute_probe(cluster, sts, &cluster.suspend_probe()).await {
            self.events
                .publish(
                    cluster,
                    EventType::Normal,
                    "ServiceSuspended",
                    format!("suspended Coherence services in StatefulSet {}", sts.name_any()),
                )
                .await;
            SuspendOutcome::Successful
        } else {
            self.events
                .publish(
                    cluster,
                    EventType::Warning,
                    "ServiceSuspendFailed",
                    format!(
                        "failed to suspend Coherence services in StatefulSet {}",
                        sts.name_any()
                    ),
                )
                .await;
            SuspendOutcome::Failed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Harness, pod, stateful_set};

    fn pods(ready: bool) -> Vec<Pod> {
        (0..3)
            .map(|i| pod(&format!("storage-{i}"), &format!("node-{i}"), "rev-1", ready))
            .collect()
    }

    #[tokio::test]
    async fn first_running_pod_decides() {
        let harness = Harness::new();
        let sts = stateful_set(3, 3, "rev-1", "rev-1");
        let pods = pods(true);

        let safe = harness
            .health()
            .execute_probe_for_subset(&harness.cluster(), &sts, &GridProbe::default(), &pods, &pods)
            .await;

        assert!(safe);
        assert_eq!(harness.prober.calls(), vec!["storage-0"]);
    }

    #[tokio::test]
    async fn first_failure_is_final() {
        let harness = Harness::new();
        harness.prober.set("storage-0", ProbeResult::Failure);
        let sts = stateful_set(3, 3, "rev-1", "rev-1");
        let pods = pods(true);

        let safe = harness
            .health()
            .execute_probe_for_subset(&harness.cluster(), &sts, &GridProbe::default(), &pods, &pods)
            .await;

        assert!(!safe);
        assert_eq!(harness.prober.calls(), vec!["storage-0"]);
    }

    #[tokio::test]
    async fn unknown_results_fall_through_to_next_candidate() {
        let harness = Harness::new();
        harness.prober.set("storage-0", ProbeResult::Unknown);
        let sts = stateful_set(3, 3, "rev-1", "rev-1");
        let pods = pods(true);

        let safe = harness
            .health()
            .execute_probe_for_subset(&harness.cluster(), &sts, &GridProbe::default(), &pods, &pods)
            .await;

        assert!(safe);
        assert_eq!(harness.prober.calls(), vec!["storage-0", "storage-1"]);
    }

    #[tokio::test]
    async fn unready_pod_fails_without_probing() {
        let harness = Harness::new();
        let sts = stateful_set(3, 3, "rev-1", "rev-1");
        let mut pods = pods(true);
        pods[2] = pod("storage-2", "node-2", "rev-1", false);

        let safe = harness
            .health()
            .execute_probe_for_subset(&harness.cluster(), &sts, &GridProbe::default(), &pods, &pods)
            .await;

        assert!(!safe);
        assert!(harness.prober.calls().is_empty());
    }

    #[tokio::test]
    async fn pod_count_must_match_replicas() {
        let harness = Harness::new();
        let sts = stateful_set(4, 3, "rev-1", "rev-1");
        let pods = pods(true);

        let safe = harness
            .health()
            .execute_probe_for_subset(&harness.cluster(), &sts, &GridProbe::default(), &pods, &pods)
            .await;

        assert!(!safe);
        assert!(harness.prober.calls().is_empty());
    }

    #[tokio::test]
    async fn no_pods_is_trivially_safe() {
        let harness = Harness::new();
        let sts = stateful_set(3, 0, "rev-1", "rev-1");

        let safe = harness
            .health()
            .execute_probe_for_subset(&harness.cluster(), &sts, &GridProbe::default(), &[], &[])
            .await;

        assert!(safe);
    }

    #[tokio::test]
    async fn non_running_candidates_are_skipped() {
        let harness = Harness::new();
        let sts = stateful_set(3, 3, "rev-1", "rev-1");
        let pods = pods(true);
        let mut pending = pod("storage-9", "node-9", "rev-1", false);
        pending.status.as_mut().unwrap().phase = Some("Pending".to_owned());
        let candidates = vec![pending, pods[1].clone()];

        let safe = harness
            .health()
            .execute_probe_for_subset(
                &harness.cluster(),
                &sts,
                &GridProbe::default(),
                &pods,
                &candidates,
            )
            .await;

        assert!(safe);
        assert_eq!(harness.prober.calls(), vec!["storage-1"]);
    }

    #[tokio::test]
    async fn status_ha_lists_pods_through_the_store() {
        let harness = Harness::new();
        harness.store.put_pods(pods(true));
        let sts = stateful_set(3, 3, "rev-1", "rev-1");

        assert!(harness.health().is_status_ha(&harness.cluster(), &sts).await);
        assert_eq!(harness.prober.calls(), vec!["storage-0"]);
    }

    #[tokio::test]
    async fn suspend_is_skipped_when_disabled() {
        let mut harness = Harness::new();
        harness.config.skip_service_suspend = true;
        let sts = stateful_set(3, 3, "rev-1", "rev-1");

        let outcome = harness.health().suspend_services(&harness.cluster(), &sts).await;

        assert_eq!(outcome, SuspendOutcome::Skipped);
        assert!(harness.prober.calls().is_empty());
        assert!(harness.events.has_reason("ServiceSuspendSkipped"));
    }

    #[tokio::test]
    async fn suspend_reports_probe_failure() {
        let harness = Harness::new();
        harness.store.put_pods(pods(true));
        harness.prober.set("storage-0", ProbeResult::Failure);
        let sts = stateful_set(3, 3, "rev-1", "rev-1");

        let outcome = harness.health().suspend_services(&harness.cluster(), &sts).await;

        assert_eq!(outcome, SuspendOutcome::Failed);
        assert!(harness.events.has_reason("ServiceSuspendFailed"));
    }
}
