//! Capability interfaces the reconciler needs from the outside world.
//!
//! The Kubernetes-backed implementations live in [`crate::client`]; tests use in-memory fakes.

use std::{collections::BTreeMap, fmt};

use async_trait::async_trait;
use k8s_openapi::api::{apps::v1::StatefulSet, core::v1::Pod};
use kube::runtime::events::EventType;
use snafu::Snafu;

use crate::{crd::CoherenceCluster, status::CoherenceClusterStatus};

/// Namespace and name of a namespaced object.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StoreError {
    #[snafu(display("Kubernetes API request for {key} failed"))]
    Kube { source: kube::Error, key: ObjectKey },

    #[snafu(display("failed to read output of command in Pod {key}"))]
    ReadOutput {
        source: std::io::Error,
        key: ObjectKey,
    },

    #[snafu(display("{message}"))]
    Unavailable { message: String },
}

#[async_trait]
pub trait ResourceStore: Send + Sync {
    async fn get_cluster(&self, key: &ObjectKey) -> Result<Option<CoherenceCluster>, StoreError>;

    /// Applies a JSON merge patch to the cluster's metadata (finalizers and annotations).
    async fn patch_cluster_metadata(
        &self,
        key: &ObjectKey,
        patch: &serde_json::Value,
    ) -> Result<CoherenceCluster, StoreError>;

    async fn update_cluster_status(
        &self,
        key: &ObjectKey,
        status: &CoherenceClusterStatus,
    ) -> Result<(), StoreError>;

    async fn get_stateful_set(&self, key: &ObjectKey) -> Result<Option<StatefulSet>, StoreError>;

    async fn create_stateful_set(&self, sts: &StatefulSet) -> Result<StatefulSet, StoreError>;

    /// Applies a JSON merge patch to the StatefulSet.
    async fn patch_stateful_set(
        &self,
        key: &ObjectKey,
        patch: &serde_json::Value,
    ) -> Result<StatefulSet, StoreError>;

    async fn delete_stateful_set(&self, key: &ObjectKey) -> Result<(), StoreError>;

    async fn list_pods(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<Pod>, StoreError>;

    async fn delete_pod(&self, key: &ObjectKey) -> Result<(), StoreError>;
}

/// Records Kubernetes events against a cluster.
///
/// Publishing is fire-and-forget, failures are logged by the implementation.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(
        &self,
        cluster: &CoherenceCluster,
        type_: EventType,
        reason: &str,
        note: String,
    );
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Runs a command inside a container of a running Pod.
#[async_trait]
pub trait RemoteExec: Send + Sync {
    async fn exec(
        &self,
        pod: &ObjectKey,
        container: &str,
        command: &[String],
    ) -> Result<ExecOutput, StoreError>;
}

/// Resolves Node labels, used to group Pods by placement domain.
#[async_trait]
pub trait NodeLookup: Send + Sync {
    async fn node_label(&self, node: &str, label: &str) -> Result<Option<String>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_display() {
        assert_eq!(ObjectKey::new("grid", "storage").to_string(), "grid/storage");
    }
}
