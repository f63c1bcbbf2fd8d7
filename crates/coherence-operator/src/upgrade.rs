//! Recycles Pods of a StatefulSet whose template changed, one placement domain at a time.
//!
//! With `Pod` and `Manual` strategies the operator leaves the rollout to Kubernetes (or the user).
//! With `Node` and `NodeLabel` the StatefulSet uses `OnDelete` and the operator deletes all stale
//! Pods sharing a Node (or Node label value) together, but only while the cluster is Status HA.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use k8s_openapi::api::{apps::v1::StatefulSet, core::v1::Pod};
use kube::{ResourceExt, runtime::events::EventType};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

use crate::{
    config::ControllerConfig,
    crd::CoherenceCluster,
    health::ClusterHealth,
    podutils::{pod_node, pod_revision},
    reconciler::ReconcileAction,
    store::{EventSink, NodeLookup, ObjectKey, ResourceStore, StoreError},
};

/// How long an upgrade waits before asking again when the cluster is not Status HA.
pub const UPGRADE_RETRY: Duration = Duration::from_secs(60);

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to list Pods of StatefulSet {key}"))]
    ListPods { source: StoreError, key: ObjectKey },

    #[snafu(display("failed to resolve placement of Pod {pod}"))]
    ResolvePlacement { source: StoreError, pod: String },

    #[snafu(display("failed to delete Pod {pod}"))]
    DeletePod { source: StoreError, pod: ObjectKey },
}

/// The rolling update strategy as written on the resource.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
pub enum UpgradeStrategy {
    /// Kubernetes' own rolling update, one Pod at a time.
    #[default]
    Pod,
    /// All Pods on one Node at a time.
    Node,
    /// All Pods on Nodes sharing a label value at a time, see `rollingUpdateLabel`.
    NodeLabel,
    /// Pods are never recycled by the operator or by Kubernetes.
    Manual,
}

/// The upgrade behaviour resolved for one cluster.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ResolvedStrategy {
    ByPod,
    Manual,
    ByNode,
    ByNodeLabel(String),
}

impl ResolvedStrategy {
    /// `NodeLabel` without a label falls back to grouping by Node name.
    pub fn for_cluster(cluster: &CoherenceCluster) -> Self {
        match cluster.spec.rolling_update_strategy.unwrap_or_default() {
            UpgradeStrategy::Pod => Self::ByPod,
            UpgradeStrategy::Manual => Self::Manual,
            UpgradeStrategy::Node => Self::ByNode,
            UpgradeStrategy::NodeLabel => match &cluster.spec.rolling_update_label {
                Some(label) => Self::ByNodeLabel(label.clone()),
                None => Self::ByNode,
            },
        }
    }

    /// Whether the operator deletes Pods itself, rather than leaving it to the StatefulSet
    /// controller.
    pub fn is_operator_managed(&self) -> bool {
        matches!(self, Self::ByNode | Self::ByNodeLabel(_))
    }

    fn placement(&self, lookup: &Arc<dyn NodeLookup>) -> Option<Box<dyn PlacementIdentifier>> {
        match self {
            Self::ByPod | Self::Manual => None,
            Self::ByNode => Some(Box::new(NodeName)),
            Self::ByNodeLabel(label) => {
                Some(Box::new(NodeLabel::new(label.clone(), lookup.clone())))
            }
        }
    }

    fn identifier_name(&self) -> &str {
        match self {
            Self::ByNodeLabel(label) => label,
            _ => "NodeName",
        }
    }
}

/// Maps a Pod to the placement domain it runs in.
#[async_trait]
pub trait PlacementIdentifier: Send {
    async fn identify(&mut self, pod: &Pod) -> Result<String, StoreError>;
}

pub struct NodeName;

#[async_trait]
impl PlacementIdentifier for NodeName {
    async fn identify(&mut self, pod: &Pod) -> Result<String, StoreError> {
        Ok(pod_node(pod).unwrap_or_default().to_owned())
    }
}

/// Groups by the value of a Node label. Values are cached per Node name for the lifetime of the
/// identifier. Nodes without the label map to the empty string.
pub struct NodeLabel {
    label: String,
    lookup: Arc<dyn NodeLookup>,
    cache: HashMap<String, String>,
}

impl NodeLabel {
    pub fn new(label: String, lookup: Arc<dyn NodeLookup>) -> Self {
        Self {
            label,
            lookup,
            cache: HashMap::new(),
        }
    }
}

#[async_trait]
impl PlacementIdentifier for NodeLabel {
    async fn identify(&mut self, pod: &Pod) -> Result<String, StoreError> {
        let node = pod_node(pod).unwrap_or_default();
        if let Some(value) = self.cache.get(node) {
            return Ok(value.clone());
        }
        let value = self
            .lookup
            .node_label(node, &self.label)
            .await?
            .unwrap_or_default();
        self.cache.insert(node.to_owned(), value.clone());
        Ok(value)
    }
}

/// Pods grouped by placement domain.
#[derive(Debug, Default)]
struct PodGroups {
    /// Pods not yet at the update revision.
    stale: BTreeMap<String, Vec<Pod>>,
    all: BTreeMap<String, Vec<Pod>>,
}

async fn group_pods(
    pods: &[Pod],
    revision: &str,
    placement: &mut dyn PlacementIdentifier,
) -> Result<PodGroups> {
    let mut groups = PodGroups::default();
    for pod in pods {
        let id = placement
            .identify(pod)
            .await
            .context(ResolvePlacementSnafu { pod: pod.name_any() })?;
        groups.all.entry(id.clone()).or_default().push(pod.clone());
        if pod_revision(pod) != Some(revision) {
            groups.stale.entry(id).or_default().push(pod.clone());
        }
    }
    Ok(groups)
}

pub struct UpgradeCoordinator {
    store: Arc<dyn ResourceStore>,
    health: Arc<ClusterHealth>,
    events: Arc<dyn EventSink>,
    node_lookup: Arc<dyn NodeLookup>,
    node_lookup_enabled: bool,
}

impl UpgradeCoordinator {
    pub fn new(
        store: Arc<dyn ResourceStore>,
        health: Arc<ClusterHealth>,
        events: Arc<dyn EventSink>,
        node_lookup: Arc<dyn NodeLookup>,
        config: &ControllerConfig,
    ) -> Self {
        Self {
            store,
            health,
            events,
            node_lookup,
            node_lookup_enabled: config.node_lookup_enabled,
        }
    }

    /// Recycles the next placement domain holding stale Pods.
    ///
    /// Never requeues after recycling. The recreated Pods becoming ready changes the StatefulSet,
    /// which triggers the next pass.
    #[tracing::instrument(skip(self, cluster, sts), fields(cluster = %cluster.key()))]
    pub async fn rolling_upgrade(
        &self,
        cluster: &CoherenceCluster,
        sts: &StatefulSet,
        strategy: &ResolvedStrategy,
    ) -> Result<ReconcileAction> {
        let Some(mut placement) = strategy.placement(&self.node_lookup) else {
            return Ok(ReconcileAction::done());
        };
        let key = ObjectKey::new(sts.namespace().unwrap_or_default(), sts.name_any());
        let status = sts.status.clone().unwrap_or_default();
        let ready = status.ready_replicas.unwrap_or(0);

        let replicas = match sts.spec.as_ref().and_then(|spec| spec.replicas) {
            None if ready == 0 => return Ok(ReconcileAction::done()),
            None => 1,
            Some(replicas) if ready != replicas => return Ok(ReconcileAction::done()),
            Some(replicas) => replicas,
        };
        let Some(revision) = status.update_revision.as_deref() else {
            return Ok(ReconcileAction::done());
        };
        if status.current_revision.as_deref() == Some(revision) {
            return Ok(ReconcileAction::done());
        }
        if !self.node_lookup_enabled {
            tracing::info!("cannot perform rolling upgrade by Node, Node lookup is disabled");
            return Ok(ReconcileAction::done());
        }

        tracing::info!(statefulset = %key, "performing rolling upgrade of StatefulSet by Node");
        let pods = self
            .health
            .pods_for(sts)
            .await
            .context(ListPodsSnafu { key: key.clone() })?;
        if pods.is_empty() || usize::try_from(replicas).ok() != Some(pods.len()) {
            tracing::info!(
                replicas,
                found = pods.len(),
                "Pod count does not match replicas, upgrade deferred"
            );
            return Ok(ReconcileAction::done());
        }

        let (unit, domain) = match pods.as_slice() {
            [single] => {
                if pod_revision(single) == Some(revision) {
                    return Ok(ReconcileAction::done());
                }
                // Nothing else could take over from a single member.
                return self.recycle(cluster, std::slice::from_ref(single), "").await;
            }
            _ => {
                let groups = group_pods(&pods, revision, placement.as_mut()).await?;
                if groups.all.len() == 1 {
                    tracing::info!(
                        identifier = strategy.identifier_name(),
                        domain = groups.all.keys().next().map(String::as_str).unwrap_or_default(),
                        "all Pods share a single placement domain and cannot be upgraded safely"
                    );
                    return Ok(ReconcileAction::done());
                }
                match groups.stale.into_iter().next() {
                    Some((domain, unit)) => (unit, domain),
                    None => return Ok(ReconcileAction::done()),
                }
            }
        };

        let probe = cluster.scaling_probe();
        if !self
            .health
            .execute_probe_for_subset(cluster, sts, &probe, &pods, &unit)
            .await
        {
            tracing::info!(
                identifier = strategy.identifier_name(),
                %domain,
                "Pods failed Status HA check, upgrade deferred"
            );
            return Ok(ReconcileAction::requeue_after(UPGRADE_RETRY));
        }

        self.recycle(cluster, &unit, &domain).await
    }

    async fn recycle(
        &self,
        cluster: &CoherenceCluster,
        unit: &[Pod],
        domain: &str,
    ) -> Result<ReconcileAction> {
        tracing::info!(%domain, count = unit.len(), "upgrading Pods of placement domain");
        for pod in unit {
            let key = ObjectKey::new(pod.namespace().unwrap_or_default(), pod.name_any());
            self.store
                .delete_pod(&key)
                .await
                .context(DeletePodSnafu { pod: key.clone() })?;
            tracing::info!(pod = %key, "deleted Pod to trigger upgrade");
        }
        let names = unit.iter().map(ResourceExt::name_any).collect::<Vec<_>>();
        self.events
            .publish(
                cluster,
                EventType::Normal,
                "RollingUpgrade",
                format!("recycled Pods {names:?} to upgrade them"),
            )
            .await;
        Ok(ReconcileAction::done())
    }
}
