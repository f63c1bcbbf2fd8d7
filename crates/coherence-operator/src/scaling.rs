//! Moves a StatefulSet's replica count toward the desired count.

use std::{sync::Arc, time::Duration};

use k8s_openapi::api::apps::v1::StatefulSet;
use kube::{ResourceExt, runtime::events::EventType};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

use crate::{
    config::ControllerConfig,
    crd::CoherenceCluster,
    health::ClusterHealth,
    patch,
    reconciler::ReconcileAction,
    status::{Phase, persist_phase},
    store::{EventSink, ObjectKey, ResourceStore},
};

/// Wait between two single-replica steps of a safe scale.
pub const SAFE_SCALE_STEP_INTERVAL: Duration = Duration::from_secs(60);

const REASON_SCALING: &str = "Scaling";

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to scale StatefulSet {key} from {from} to {to}"))]
    ScaleStatefulSet {
        source: patch::Error,
        key: ObjectKey,
        from: i32,
        to: i32,
    },
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, JsonSchema, PartialEq, Serialize)]
pub enum ScalingPolicy {
    /// One member at a time, only while the cluster is Status HA.
    Safe,
    /// Straight to the desired count.
    Parallel,
    /// Parallel when adding members, safe when removing them.
    ParallelUpSafeDown,
}

pub struct ScalingEngine {
    store: Arc<dyn ResourceStore>,
    health: Arc<ClusterHealth>,
    events: Arc<dyn EventSink>,
    status_ha_retry: Duration,
}

impl ScalingEngine {
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
            status_ha_retry: config.status_ha_retry,
        }
    }

    /// Applies the cluster's effective scaling policy to move `sts` from `current` to `desired`
    /// replicas.
    #[tracing::instrument(skip(self, cluster, sts), fields(cluster = %cluster.key()))]
    pub async fn scale(
        &self,
        cluster: &CoherenceCluster,
        sts: &StatefulSet,
        current: i32,
        desired: i32,
    ) -> Result<ReconcileAction> {
        if let Err(err) = persist_phase(self.store.as_ref(), cluster, Phase::Scaling).await {
            tracing::error!(
                error = &err as &dyn std::error::Error,
                "failed to update cluster phase to Scaling"
            );
        }

        match cluster.effective_scaling_policy() {
            ScalingPolicy::Safe => self.safe_scale(cluster, sts, current, desired).await,
            ScalingPolicy::Parallel => self.parallel_scale(cluster, sts, current, desired).await,
            ScalingPolicy::ParallelUpSafeDown if desired > current => {
                self.parallel_scale(cluster, sts, current, desired).await
            }
            ScalingPolicy::ParallelUpSafeDown => {
                self.safe_scale(cluster, sts, current, desired).await
            }
        }
    }

    /// Steps one replica toward `desired`, provided the cluster is Status HA.
    ///
    /// A single member cluster has nothing to protect so it always steps.
    async fn safe_scale(
        &self,
        cluster: &CoherenceCluster,
        sts: &StatefulSet,
        current: i32,
        desired: i32,
    ) -> Result<ReconcileAction> {
        let ha = current == 1 || self.health.is_status_ha(cluster, sts).await;
        if !ha {
            tracing::info!(
                current,
                desired,
                retry = %humantime::format_duration(self.status_ha_retry),
                "cluster is not StatusHA, safe scaling deferred"
            );
            return Ok(ReconcileAction::requeue_after(self.status_ha_retry));
        }

        let step = if desired > current { current + 1 } else { current - 1 };
        self.parallel_scale(cluster, sts, current, step).await?;

        if step == desired {
            Ok(ReconcileAction::done())
        } else {
            Ok(ReconcileAction::requeue_after(SAFE_SCALE_STEP_INTERVAL))
        }
    }

    /// Patches the replica count straight to `desired`.
    async fn parallel_scale(
        &self,
        cluster: &CoherenceCluster,
        sts: &StatefulSet,
        current: i32,
        desired: i32,
    ) -> Result<ReconcileAction> {
        let key = ObjectKey::new(sts.namespace().unwrap_or_default(), sts.name_any());
        let mut scaled = sts.clone();
        if let Some(spec) = scaled.spec.as_mut() {
            spec.replicas = Some(desired);
        }

        let result = patch::three_way_patch_with_callback(
            self.store.as_ref(),
            &key,
            sts,
            &scaled,
            sts,
            || async {},
        )
        .await
        .context(ScaleStatefulSetSnafu {
            key: key.clone(),
            from: current,
            to: desired,
        });

        match &result {
            Ok(_) => {
                let note = format!(
                    "scaled StatefulSet {} from {current} to {desired}",
                    sts.name_any()
                );
                tracing::info!(statefulset = %key, "{note}");
                self.events
                    .publish(cluster, EventType::Normal, REASON_SCALING, note)
                    .await;
            }
            Err(err) => {
                tracing::error!(
                    statefulset = %key,
                    error = err as &dyn std::error::Error,
                    "scaling failed"
                );
                self.events
                    .publish(
                        cluster,
                        EventType::Warning,
                        REASON_SCALING,
                        format!(
                            "failed to scale StatefulSet {} from {current} to {desired}: {err}",
                            sts.name_any()
                        ),
                    )
                    .await;
            }
        }
        result.map(|_| ReconcileAction::done())
    }
}
