//! The operator's finalizer, which suspends grid services before a cluster is deleted.

use std::sync::Arc;

use kube::{ResourceExt, runtime::events::EventType};
use serde_json::json;
use snafu::{ResultExt, Snafu};

use crate::{
    config::ControllerConfig,
    crd::{ANNOTATION_ERROR_COUNT, ANNOTATION_FINALIZER_BYPASS, CoherenceCluster, FINALIZER_NAME},
    health::{ClusterHealth, SuspendOutcome},
    store::{EventSink, ObjectKey, ResourceStore, StoreError},
};

/// Failed suspension attempts after which deletion goes ahead regardless.
pub const MAX_SUSPEND_ATTEMPTS: u32 = 3;

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to update finalizers of {key}"))]
    PatchFinalizers { source: StoreError, key: ObjectKey },

    #[snafu(display("failed to record suspend attempt on {key}"))]
    RecordAttempt { source: StoreError, key: ObjectKey },

    #[snafu(display("failed to get StatefulSet {key}"))]
    GetStatefulSet { source: StoreError, key: ObjectKey },

    #[snafu(display("failed to suspend services of {key} (attempt {attempt})"))]
    SuspendServices { key: ObjectKey, attempt: u32 },
}

/// Checks whether our finalizer is in the list of finalizers of the cluster.
pub fn has_finalizer(cluster: &CoherenceCluster) -> bool {
    cluster.finalizers().iter().any(|f| f == FINALIZER_NAME)
}

/// Adds our finalizer, keeping any finalizers other controllers put there.
pub async fn add_finalizer(
    store: &dyn ResourceStore,
    cluster: &CoherenceCluster,
) -> Result<CoherenceCluster> {
    let mut finalizers = cluster.finalizers().to_vec();
    finalizers.push(FINALIZER_NAME.to_owned());
    patch_finalizers(store, cluster, finalizers).await
}

pub async fn remove_finalizer(
    store: &dyn ResourceStore,
    cluster: &CoherenceCluster,
) -> Result<CoherenceCluster> {
    let finalizers = cluster
        .finalizers()
        .iter()
        .filter(|f| *f != FINALIZER_NAME)
        .cloned()
        .collect();
    patch_finalizers(store, cluster, finalizers).await
}

async fn patch_finalizers(
    store: &dyn ResourceStore,
    cluster: &CoherenceCluster,
    finalizers: Vec<String>,
) -> Result<CoherenceCluster> {
    // Merge patches replace lists whole, so this is the full new list.
    let patch = json!({ "metadata": { "finalizers": finalizers } });
    let key = cluster.key();
    store
        .patch_cluster_metadata(&key, &patch)
        .await
        .context(PatchFinalizersSnafu { key })
}

pub struct Finalizer {
    store: Arc<dyn ResourceStore>,
    health: Arc<ClusterHealth>,
    events: Arc<dyn EventSink>,
    skip_service_suspend: bool,
}

impl Finalizer {
    pub fn new(
        store: Arc<dyn ResourceStore>,
        health: Arc<ClusterHealth>,
        events: Arc<dyn EventSink>,
        config: &ControllerConfig,
    ) -> Self {
        Self {
            store,
            health,
            events,
            skip_service_suspend: config.skip_service_suspend,
        }
    }

    /// Runs the shutdown tasks for a cluster that is being deleted.
    ///
    /// An error means the finalizer has to stay and the deletion is retried later.
    #[tracing::instrument(skip(self, cluster), fields(cluster = %cluster.key()))]
    pub async fn finalize(&self, cluster: &CoherenceCluster) -> Result<()> {
        if cluster.has_annotation(ANNOTATION_FINALIZER_BYPASS) {
            tracing::info!("bypassing service suspension due to finalizer-bypass annotation");
            self.events
                .publish(
                    cluster,
                    EventType::Normal,
                    "FinalizerBypassed",
                    "Service suspension bypassed due to finalizer-bypass annotation".to_owned(),
                )
                .await;
            return Ok(());
        }
        if self.skip_service_suspend {
            tracing::info!("skipping service suspension, disabled for this operator");
            return Ok(());
        }
        if !cluster.suspend_services_on_shutdown() {
            tracing::info!("skipping service suspension, spec.suspendServicesOnShutdown is false");
            return Ok(());
        }
        if cluster.replicas() == 0 {
            tracing::info!("skipping service suspension, replicas is zero");
            return Ok(());
        }

        let key = cluster.key();
        let sts = self
            .store
            .get_stateful_set(&key)
            .await
            .context(GetStatefulSetSnafu { key: key.clone() })?;
        let Some(sts) = sts else {
            return Ok(());
        };
        let ready = sts
            .status
            .as_ref()
            .and_then(|status| status.ready_replicas)
            .unwrap_or(0);
        if ready == 0 {
            tracing::info!("skipping service suspension, no Pods are ready");
            return Ok(());
        }

        if self.health.suspend_services(cluster, &sts).await != SuspendOutcome::Failed {
            return Ok(());
        }

        let failures = cluster.error_count();
        if failures >= MAX_SUSPEND_ATTEMPTS {
            tracing::warn!(
                failures,
                "service suspension failed multiple times, allowing deletion to proceed"
            );
            self.events
                .publish(
                    cluster,
                    EventType::Warning,
                    "ServiceSuspensionFailed",
                    "Service suspension failed multiple times, allowing deletion to proceed anyway"
                        .to_owned(),
                )
                .await;
            return Ok(());
        }

        let attempt = failures + 1;
        let patch = json!({
            "metadata": { "annotations": { (ANNOTATION_ERROR_COUNT): attempt.to_string() } }
        });
        self.store
            .patch_cluster_metadata(&key, &patch)
            .await
            .context(RecordAttemptSnafu { key: key.clone() })?;
        tracing::info!(attempt, "service suspension failed, deletion blocked");
        SuspendServicesSnafu { key, attempt }.fail()
    }
}
