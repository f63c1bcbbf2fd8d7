//! The `CoherenceCluster` custom resource and the well-known names the operator uses on it.

use std::{collections::BTreeMap, time::Duration};

use k8s_openapi::{
    api::core::v1::{ExecAction, HTTPGetAction, TCPSocketAction},
    apimachinery::pkg::util::intstr::IntOrString,
};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{
    scaling::ScalingPolicy,
    status::CoherenceClusterStatus,
    store::ObjectKey,
    upgrade::UpgradeStrategy,
};

pub const FINALIZER_NAME: &str = "coherence.oracle.com/operator";
pub const ANNOTATION_FINALIZER_BYPASS: &str = "coherence.oracle.com/finalizer-bypass";
pub const ANNOTATION_ERROR_COUNT: &str = "coherence.oracle.com/error-count";
pub const ANNOTATION_LAST_APPLIED: &str = "coherence.oracle.com/last-applied";

pub const LABEL_CLUSTER: &str = "coherenceCluster";
pub const LABEL_DEPLOYMENT: &str = "coherenceDeployment";
pub const LABEL_REVISION_HASH: &str = "controller-revision-hash";

pub const CONTAINER_NAME: &str = "coherence";
pub const PORT_NAME_HEALTH: &str = "health";
pub const DEFAULT_HEALTH_PORT: i32 = 6676;
pub const DEFAULT_IMAGE: &str = "ghcr.io/oracle/coherence-ce:14.1.2-0-1";

pub const DEFAULT_REPLICAS: i32 = 3;
const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(1);
const DEFAULT_SCALING_PROBE_TIMEOUT_SECONDS: i32 = 10;
const DEFAULT_SUSPEND_TIMEOUT_SECONDS: i32 = 60;

/// A Coherence data grid cluster, run as a single StatefulSet.
#[derive(CustomResource, Serialize, Deserialize, Default, Clone, Debug, JsonSchema, PartialEq)]
#[kube(
    group = "coherence.oracle.com",
    version = "v1",
    kind = "CoherenceCluster",
    plural = "coherenceclusters",
    shortname = "coh",
    namespaced,
    status = "CoherenceClusterStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct CoherenceClusterSpec {
    /// Number of storage members. Defaults to 3 when omitted.
    pub replicas: Option<i32>,

    /// The Coherence image to run. Falls back to the operator default.
    pub image: Option<String>,

    /// Extra labels added to every Pod.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    /// How replica count changes are applied.
    #[serde(default)]
    pub scaling: ScalingSpec,

    /// Whether members of this cluster store data. Affects the default scaling policy.
    pub storage_enabled: Option<bool>,

    /// How Pods are recycled when the Pod template changes.
    pub rolling_update_strategy: Option<UpgradeStrategy>,

    /// The Node label used to group Pods when `rollingUpdateStrategy` is `NodeLabel`.
    pub rolling_update_label: Option<String>,

    /// Other clusters that must be ready before this one is created.
    #[serde(default)]
    pub start_quorum: Vec<StartQuorum>,

    /// The probe used to suspend grid services before shutdown.
    pub suspend_probe: Option<GridProbe>,

    /// Timeout in seconds for the default suspend probe.
    pub suspend_service_timeout: Option<i32>,

    /// Suspend grid services before the cluster is scaled to zero or deleted. Defaults to true.
    pub suspend_services_on_shutdown: Option<bool>,

    /// Require the cluster to be Status HA before applying a Pod template change. Defaults to true.
    pub ha_before_update: Option<bool>,

    /// Probes executed once, after the cluster first becomes ready.
    #[serde(default)]
    pub actions: Vec<ClusterAction>,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScalingSpec {
    pub policy: Option<ScalingPolicy>,

    /// The Status HA probe. Defaults to `GET /ha` on the `health` port.
    pub probe: Option<GridProbe>,
}

#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartQuorum {
    /// Name of the cluster this one depends on.
    pub deployment: String,

    /// Namespace of the dependency, defaults to the namespace of this cluster.
    pub namespace: Option<String>,

    /// Minimum number of ready Pods. When unset or zero the dependency must be fully ready.
    pub pod_count: Option<i32>,
}

#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterAction {
    pub name: Option<String>,
    pub probe: GridProbe,
}

/// A health check executed against one Pod of the cluster.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GridProbe {
    /// What to run. A probe without a handler always succeeds.
    pub handler: Option<ProbeAction>,

    pub timeout_seconds: Option<i32>,
}

#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ProbeAction {
    Exec(ExecAction),
    HttpGet(HTTPGetAction),
    TcpSocket(TCPSocketAction),
}

impl GridProbe {
    pub fn http_get(path: &str, port: &str, timeout_seconds: i32) -> Self {
        Self {
            handler: Some(ProbeAction::HttpGet(HTTPGetAction {
                path: Some(path.to_owned()),
                port: IntOrString::String(port.to_owned()),
                ..HTTPGetAction::default()
            })),
            timeout_seconds: Some(timeout_seconds),
        }
    }

    /// The configured timeout, or one second when unset or not positive.
    pub fn timeout(&self) -> Duration {
        match self.timeout_seconds {
            Some(secs) if secs > 0 => Duration::from_secs(u64::from(secs.unsigned_abs())),
            _ => DEFAULT_PROBE_TIMEOUT,
        }
    }
}

impl CoherenceCluster {
    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(self.namespace().unwrap_or_default(), self.name_any())
    }

    pub fn replicas(&self) -> i32 {
        self.spec.replicas.unwrap_or(DEFAULT_REPLICAS)
    }

    /// The explicit scaling policy, otherwise derived from whether the members store data.
    pub fn effective_scaling_policy(&self) -> ScalingPolicy {
        match (self.spec.scaling.policy, self.spec.storage_enabled) {
            (Some(policy), _) => policy,
            (None, None | Some(true)) => ScalingPolicy::ParallelUpSafeDown,
            (None, Some(false)) => ScalingPolicy::Parallel,
        }
    }

    pub fn scaling_probe(&self) -> GridProbe {
        self.spec.scaling.probe.clone().unwrap_or_else(|| {
            GridProbe::http_get("/ha", PORT_NAME_HEALTH, DEFAULT_SCALING_PROBE_TIMEOUT_SECONDS)
        })
    }

    pub fn suspend_probe(&self) -> GridProbe {
        self.spec.suspend_probe.clone().unwrap_or_else(|| {
            let timeout = self
                .spec
                .suspend_service_timeout
                .unwrap_or(DEFAULT_SUSPEND_TIMEOUT_SECONDS);
            GridProbe::http_get("/suspend", PORT_NAME_HEALTH, timeout)
        })
    }

    pub fn suspend_services_on_shutdown(&self) -> bool {
        self.spec.suspend_services_on_shutdown.unwrap_or(true)
    }

    pub fn ha_before_update(&self) -> bool {
        self.spec.ha_before_update.unwrap_or(true)
    }

    pub fn has_annotation(&self, name: &str) -> bool {
        self.annotations().contains_key(name)
    }

    /// The number of failed shutdown attempts recorded on the resource. Unparseable values count
    /// as zero.
    pub fn error_count(&self) -> u32 {
        self.annotations()
            .get(ANNOTATION_ERROR_COUNT)
            .and_then(|count| count.trim().parse().ok())
            .unwrap_or(0)
    }

    /// Name of the headless service used for well known addresses.
    pub fn wka_service_name(&self) -> String {
        format!("{}-wka", self.name_any())
    }

    /// Labels identifying every Pod of this cluster.
    pub fn selector_labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (LABEL_CLUSTER.to_owned(), self.name_any()),
            (LABEL_DEPLOYMENT.to_owned(), self.name_any()),
        ])
    }
}
