//! The top-level state machine for one `CoherenceCluster`.
//!
//! Each pass takes the per-resource lock, compares the cluster with its StatefulSet and takes at
//! most one step toward the desired state: create, scale, patch, upgrade or delete. Long waits are
//! expressed as requeue delays rather than blocking.

use std::{cmp::Ordering, sync::Arc, time::Duration};

use k8s_openapi::api::apps::v1::StatefulSet;
use kube::{
    ResourceExt,
    core::DynamicObject,
    runtime::{controller::Action, events::EventType, reflector::ObjectRef},
};
use snafu::{ResultExt, Snafu};
use strum::{EnumDiscriminants, IntoStaticStr};

use crate::{
    builder::{self, StatefulSetBuilder, last_applied_annotation, parse_last_applied},
    config::ControllerConfig,
    crd::CoherenceCluster,
    finalizer::{self, Finalizer, add_finalizer, has_finalizer, remove_finalizer},
    health::{ClusterHealth, SuspendOutcome},
    lock::ResourceLocks,
    logging::controller::ReconcilerError,
    patch,
    probe::PodProber,
    quorum::{self, QuorumState, evaluate_start_quorum},
    scaling::{self, ScalingEngine},
    status::{Phase, persist_phase, persist_status},
    store::{EventSink, NodeLookup, ObjectKey, ResourceStore, StoreError},
    upgrade::{self, ResolvedStrategy, UpgradeCoordinator},
};

/// Delay before creation is retried while the start quorum is not met.
pub const QUORUM_RETRY: Duration = Duration::from_secs(30);

/// Delay before an update or a scale to zero is retried when the cluster is not safe to touch.
pub const UNSAFE_RETRY: Duration = Duration::from_secs(60);

/// kube has no "requeue right now", the shortest delay used instead.
const REQUEUE_NOW_DELAY: Duration = Duration::from_secs(1);

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu, EnumDiscriminants)]
#[strum_discriminants(derive(IntoStaticStr))]
pub enum Error {
    #[snafu(display("failed to get cluster {key}"))]
    GetCluster { source: StoreError, key: ObjectKey },

    #[snafu(display("failed to get StatefulSet {key}"))]
    GetStatefulSet { source: StoreError, key: ObjectKey },

    #[snafu(display("failed to finalize cluster"))]
    Finalize { source: finalizer::Error },

    #[snafu(display("failed to update finalizers"))]
    UpdateFinalizers { source: finalizer::Error },

    #[snafu(display("failed to update status of cluster {key}"))]
    UpdateStatus { source: StoreError, key: ObjectKey },

    #[snafu(display("failed to evaluate start quorum"))]
    EvaluateQuorum { source: quorum::Error },

    #[snafu(display("failed to build StatefulSet"))]
    BuildStatefulSet { source: builder::Error },

    #[snafu(display("failed to create StatefulSet {key}"))]
    CreateStatefulSet { source: StoreError, key: ObjectKey },

    #[snafu(display("failed to delete StatefulSet {key}"))]
    DeleteStatefulSet { source: StoreError, key: ObjectKey },

    #[snafu(display("failed to scale StatefulSet"))]
    Scale { source: scaling::Error },

    #[snafu(display("failed to upgrade StatefulSet"))]
    Upgrade { source: upgrade::Error },

    #[snafu(display("failed to compute patch for StatefulSet {key}"))]
    CreatePatch { source: patch::Error, key: ObjectKey },

    #[snafu(display("failed to patch StatefulSet {key}"))]
    ApplyPatch { source: patch::Error, key: ObjectKey },

    #[snafu(display(
        "failed to suspend services prior to updating single member StatefulSet {key}"
    ))]
    SuspendBeforeUpdate { key: ObjectKey },
}

impl ReconcilerError for Error {
    fn category(&self) -> &'static str {
        ErrorDiscriminants::from(self).into()
    }

    fn secondary_object(&self) -> Option<ObjectRef<DynamicObject>> {
        match self {
            Error::GetStatefulSet { key, .. }
            | Error::CreateStatefulSet { key, .. }
            | Error::DeleteStatefulSet { key, .. }
            | Error::CreatePatch { key, .. }
            | Error::ApplyPatch { key, .. }
            | Error::SuspendBeforeUpdate { key } => Some(
                ObjectRef::<StatefulSet>::new(&key.name)
                    .within(&key.namespace)
                    .erase(),
            ),
            _ => None,
        }
    }
}

/// What the scheduler should do with a resource after a pass.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ReconcileAction {
    pub requeue: bool,
    /// Zero means as soon as possible.
    pub requeue_after: Duration,
}

impl ReconcileAction {
    /// Nothing more to do until something changes.
    pub fn done() -> Self {
        Self::default()
    }

    pub fn requeue_now() -> Self {
        Self {
            requeue: true,
            requeue_after: Duration::ZERO,
        }
    }

    pub fn requeue_after(delay: Duration) -> Self {
        Self {
            requeue: true,
            requeue_after: delay,
        }
    }
}

impl From<ReconcileAction> for Action {
    fn from(action: ReconcileAction) -> Self {
        match action {
            ReconcileAction { requeue: false, .. } => Action::await_change(),
            ReconcileAction { requeue_after, .. } if requeue_after.is_zero() => {
                Action::requeue(REQUEUE_NOW_DELAY)
            }
            ReconcileAction { requeue_after, .. } => Action::requeue(requeue_after),
        }
    }
}

/// The outside world, as seen by the reconciler.
#[derive(Clone)]
pub struct Capabilities {
    pub store: Arc<dyn ResourceStore>,
    pub prober: Arc<dyn PodProber>,
    pub events: Arc<dyn EventSink>,
    pub nodes: Arc<dyn NodeLookup>,
}

pub struct Reconciler {
    store: Arc<dyn ResourceStore>,
    events: Arc<dyn EventSink>,
    health: Arc<ClusterHealth>,
    scaling: ScalingEngine,
    upgrades: UpgradeCoordinator,
    finalizer: Finalizer,
    builder: Arc<dyn StatefulSetBuilder>,
    locks: ResourceLocks,
}

impl Reconciler {
    pub fn new(
        capabilities: Capabilities,
        builder: Arc<dyn StatefulSetBuilder>,
        config: ControllerConfig,
    ) -> Self {
        let Capabilities {
            store,
            prober,
            events,
            nodes,
        } = capabilities;
        let health = Arc::new(ClusterHealth::new(
            store.clone(),
            prober,
            events.clone(),
            &config,
        ));
        Self {
            scaling: ScalingEngine::new(store.clone(), health.clone(), events.clone(), &config),
            upgrades: UpgradeCoordinator::new(
                store.clone(),
                health.clone(),
                events.clone(),
                nodes,
                &config,
            ),
            finalizer: Finalizer::new(store.clone(), health.clone(), events.clone(), &config),
            store,
            events,
            health,
            builder,
            locks: ResourceLocks::default(),
        }
    }

    pub fn locks(&self) -> &ResourceLocks {
        &self.locks
    }

    /// Runs one pass for the cluster `key`.
    ///
    /// A pass for a key that is already being reconciled returns immediately with a requeue.
    #[tracing::instrument(skip(self), fields(cluster = %key))]
    pub async fn reconcile(&self, key: &ObjectKey) -> Result<ReconcileAction> {
        let Some(_guard) = self.locks.try_lock(key) else {
            tracing::info!("cluster is already locked, requeue request");
            return Ok(ReconcileAction::requeue_now());
        };

        let cluster = self
            .store
            .get_cluster(key)
            .await
            .context(GetClusterSnafu { key: key.clone() })?;
        let Some(cluster) = cluster else {
            return self.cluster_removed(key).await;
        };

        if cluster.metadata.deletion_timestamp.is_some() {
            if has_finalizer(&cluster) {
                self.finalizer
                    .finalize(&cluster)
                    .await
                    .context(FinalizeSnafu)?;
                remove_finalizer(self.store.as_ref(), &cluster)
                    .await
                    .context(UpdateFinalizersSnafu)?;
                tracing::info!("finalized cluster");
            }
            return Ok(ReconcileAction::done());
        }

        let mut cluster = cluster;
        if !has_finalizer(&cluster) {
            tracing::info!("adding finalizer to cluster");
            cluster = add_finalizer(self.store.as_ref(), &cluster)
                .await
                .context(UpdateFinalizersSnafu)?;
        }

        if cluster.status.as_ref().and_then(|s| s.phase).is_none() {
            persist_phase(self.store.as_ref(), &cluster, Phase::Initialized)
                .await
                .context(UpdateStatusSnafu { key: key.clone() })?;
            cluster = self.refetch(key, cluster).await?;
        }

        let sts = self
            .store
            .get_stateful_set(key)
            .await
            .context(GetStatefulSetSnafu { key: key.clone() })?;
        if sts
            .as_ref()
            .is_some_and(|sts| sts.metadata.deletion_timestamp.is_some())
        {
            tracing::info!("StatefulSet is being deleted");
            return Ok(ReconcileAction::done());
        }

        let action = match sts {
            Some(sts) if cluster.replicas() == 0 => self.scale_to_zero(&cluster, &sts).await?,
            None if cluster.replicas() == 0 => ReconcileAction::done(),
            None => self.create(&cluster).await?,
            Some(sts) => self.update(&cluster, &sts).await?,
        };

        self.refresh_status(key).await?;
        Ok(action)
    }

    async fn refetch(
        &self,
        key: &ObjectKey,
        fallback: CoherenceCluster,
    ) -> Result<CoherenceCluster> {
        Ok(self
            .store
            .get_cluster(key)
            .await
            .context(GetClusterSnafu { key: key.clone() })?
            .unwrap_or(fallback))
    }

    /// The cluster is gone, any StatefulSet left behind goes with it.
    async fn cluster_removed(&self, key: &ObjectKey) -> Result<ReconcileAction> {
        let sts = self
            .store
            .get_stateful_set(key)
            .await
            .context(GetStatefulSetSnafu { key: key.clone() })?;
        if sts.is_some_and(|sts| sts.metadata.deletion_timestamp.is_none()) {
            tracing::info!("cluster not found, deleting its StatefulSet");
            self.store
                .delete_stateful_set(key)
                .await
                .context(DeleteStatefulSetSnafu { key: key.clone() })?;
        }
        Ok(ReconcileAction::done())
    }

    async fn scale_to_zero(
        &self,
        cluster: &CoherenceCluster,
        sts: &StatefulSet,
    ) -> Result<ReconcileAction> {
        let key = cluster.key();
        self.events
            .publish(
                cluster,
                EventType::Normal,
                "Scaling",
                format!("scaling StatefulSet {} down to zero", sts.name_any()),
            )
            .await;
        if let Err(err) = persist_status(self.store.as_ref(), cluster, |status| {
            std::mem::replace(&mut status.actions_executed, false)
        })
        .await
        {
            tracing::warn!(
                error = &err as &dyn std::error::Error,
                "failed to reset executed actions"
            );
        }

        if self.health.suspend_services(cluster, sts).await == SuspendOutcome::Failed {
            self.events
                .publish(
                    cluster,
                    EventType::Warning,
                    "Scaling",
                    format!(
                        "failed suspending Coherence services in StatefulSet {}",
                        sts.name_any()
                    ),
                )
                .await;
            return Ok(ReconcileAction::requeue_after(UNSAFE_RETRY));
        }

        self.store
            .delete_stateful_set(&key)
            .await
            .context(DeleteStatefulSetSnafu { key })?;
        Ok(ReconcileAction::done())
    }

    async fn create(&self, cluster: &CoherenceCluster) -> Result<ReconcileAction> {
        let key = cluster.key();
        if let QuorumState::Unmet(reason) = evaluate_start_quorum(self.store.as_ref(), cluster)
            .await
            .context(EvaluateQuorumSnafu)?
        {
            tracing::info!(%reason, "start quorum not met, creation deferred");
            self.events
                .publish(cluster, EventType::Normal, "Waiting", reason.clone())
                .await;
            persist_status(self.store.as_ref(), cluster, |status| {
                status.set_phase_with_reason(Phase::Waiting, "StatusQuorum", reason)
            })
            .await
            .context(UpdateStatusSnafu { key })?;
            return Ok(ReconcileAction::requeue_after(QUORUM_RETRY));
        }

        let sts = self.builder.build(cluster).context(BuildStatefulSetSnafu)?;
        self.store
            .create_stateful_set(&sts)
            .await
            .context(CreateStatefulSetSnafu { key: key.clone() })?;
        persist_phase(self.store.as_ref(), cluster, Phase::Created)
            .await
            .context(UpdateStatusSnafu { key })?;
        tracing::info!("created StatefulSet");
        self.events
            .publish(
                cluster,
                EventType::Normal,
                "Created",
                format!("created StatefulSet {}", sts.name_any()),
            )
            .await;
        Ok(ReconcileAction::done())
    }

    /// Scale-up runs after any pending update so the larger set is not upgraded. Scale-down runs
    /// first so the smaller set is.
    async fn update(
        &self,
        cluster: &CoherenceCluster,
        current: &StatefulSet,
    ) -> Result<ReconcileAction> {
        let desired = self.builder.build(cluster).context(BuildStatefulSetSnafu)?;
        let desired_replicas = cluster.replicas();
        let current_replicas = replicas_of(current);

        match current_replicas.cmp(&desired_replicas) {
            Ordering::Less => {
                let action = self.patch(cluster, current, desired).await?;
                if action.requeue {
                    return Ok(action);
                }
                self.scaling
                    .scale(cluster, current, current_replicas, desired_replicas)
                    .await
                    .context(ScaleSnafu)
            }
            Ordering::Greater => {
                let action = self
                    .scaling
                    .scale(cluster, current, current_replicas, desired_replicas)
                    .await
                    .context(ScaleSnafu)?;
                if action.requeue_after.is_zero() {
                    Ok(ReconcileAction::requeue_now())
                } else {
                    Ok(action)
                }
            }
            Ordering::Equal => self.patch(cluster, current, desired).await,
        }
    }

    async fn patch(
        &self,
        cluster: &CoherenceCluster,
        current: &StatefulSet,
        mut desired: StatefulSet,
    ) -> Result<ReconcileAction> {
        let key = cluster.key();
        if last_applied_annotation(current) == last_applied_annotation(&desired) {
            return self.maybe_rolling_upgrade(cluster, current).await;
        }

        let mut original = match parse_last_applied(current) {
            Ok(Some(original)) => original,
            Ok(None) => desired.clone(),
            Err(err) => {
                tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    "ignoring unreadable last applied state"
                );
                desired.clone()
            }
        };
        let mut live = current.clone();
        normalize(&mut original, current);
        normalize(&mut desired, current);
        normalize(&mut live, current);
        desired.metadata.creation_timestamp = current.metadata.creation_timestamp.clone();

        let patch = patch::three_way_patch(&original, &desired, &live)
            .context(CreatePatchSnafu { key: key.clone() })?;
        if patch.is_empty() {
            return Ok(ReconcileAction::done());
        }

        let status = current.status.clone().unwrap_or_default();
        let ready = status.ready_replicas.unwrap_or(0);
        if cluster.ha_before_update() {
            let replicas = replicas_of(current);
            if ready != replicas {
                tracing::info!(ready, replicas, "not all replicas are ready, update deferred");
                return Ok(ReconcileAction::requeue_after(UNSAFE_RETRY));
            }
            if !self.health.is_status_ha(cluster, current).await {
                tracing::info!("cluster is not StatusHA, update deferred");
                return Ok(ReconcileAction::requeue_after(UNSAFE_RETRY));
            }
        } else {
            tracing::warn!("updating StatefulSet without a StatusHA check, update was forced");
        }

        if ready == 1 {
            match self.health.suspend_services(cluster, current).await {
                SuspendOutcome::Failed => return SuspendBeforeUpdateSnafu { key }.fail(),
                SuspendOutcome::Skipped => {
                    tracing::info!("service suspension skipped for single member update");
                }
                SuspendOutcome::Successful => {}
            }
        }

        let store = self.store.as_ref();
        patch::apply_with_callback(store, &key, &patch, || async move {
            if let Err(err) = persist_phase(store, cluster, Phase::RollingUpgrade).await {
                tracing::error!(
                    error = &err as &dyn std::error::Error,
                    "failed to update cluster phase to RollingUpgrade"
                );
            }
        })
        .await
        .context(ApplyPatchSnafu { key })?;
        Ok(ReconcileAction::done())
    }

    async fn maybe_rolling_upgrade(
        &self,
        cluster: &CoherenceCluster,
        current: &StatefulSet,
    ) -> Result<ReconcileAction> {
        let strategy = ResolvedStrategy::for_cluster(cluster);
        if !strategy.is_operator_managed() {
            return Ok(ReconcileAction::done());
        }
        let status = current.status.clone().unwrap_or_default();
        let ready = status.ready_replicas.unwrap_or(0);
        let current_count = status.current_replicas.unwrap_or(0);
        let stable = match current.spec.as_ref().and_then(|spec| spec.replicas) {
            None => ready == 1 && current_count == 1,
            Some(replicas) => {
                current_count + status.updated_replicas.unwrap_or(0) == replicas
                    && ready == replicas
            }
        };
        if !stable || status.current_revision == status.update_revision {
            return Ok(ReconcileAction::done());
        }
        self.upgrades
            .rolling_upgrade(cluster, current, &strategy)
            .await
            .context(UpgradeSnafu)
    }

    /// Folds the latest StatefulSet observation into the status and runs the cluster's actions
    /// the first time it is Ready.
    async fn refresh_status(&self, key: &ObjectKey) -> Result<()> {
        let Some(cluster) = self
            .store
            .get_cluster(key)
            .await
            .context(GetClusterSnafu { key: key.clone() })?
        else {
            return Ok(());
        };
        let sts = self
            .store
            .get_stateful_set(key)
            .await
            .context(GetStatefulSetSnafu { key: key.clone() })?;

        let mut status = cluster.status.clone().unwrap_or_default();
        let mut changed = status.update(
            cluster.replicas(),
            sts.as_ref().and_then(|sts| sts.status.as_ref()),
        );

        if let Some(sts) = &sts {
            if status.phase == Some(Phase::Ready)
                && !status.actions_executed
                && cluster.replicas() != 0
            {
                for action in &cluster.spec.actions {
                    if !self.health.execute_probe(&cluster, sts, &action.probe).await {
                        tracing::info!(
                            action = action.name.as_deref().unwrap_or_default(),
                            "action probe execution failed"
                        );
                    }
                }
                status.actions_executed = true;
                changed = true;
            }
        }

        if changed {
            self.store
                .update_cluster_status(key, &status)
                .await
                .context(UpdateStatusSnafu { key: key.clone() })?;
        }
        Ok(())
    }
}

fn replicas_of(sts: &StatefulSet) -> i32 {
    sts.spec.as_ref().and_then(|spec| spec.replicas).unwrap_or(1)
}

/// Pins or blanks the fields a template update must never touch.
fn normalize(sts: &mut StatefulSet, current: &StatefulSet) {
    sts.metadata.finalizers = current.metadata.finalizers.clone();
    sts.status = None;
    if let Some(spec) = sts.spec.as_mut() {
        spec.replicas = current.spec.as_ref().and_then(|spec| spec.replicas);
        spec.volume_claim_templates = None;
        if let Some(pod) = spec.template.spec.as_mut() {
            for container in &mut pod.containers {
                if let Some(env) = container.env.as_mut() {
                    env.sort_by(|a, b| a.name.cmp(&b.name));
                }
            }
        }
    }
}
