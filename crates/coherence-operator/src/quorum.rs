//! Start quorum: clusters that must be ready before another cluster is created.

use snafu::{ResultExt, Snafu};

use crate::{
    crd::{CoherenceCluster, StartQuorum},
    status::Phase,
    store::{ObjectKey, ResourceStore, StoreError},
};

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to look up start quorum dependency {key}"))]
    GetDependency { source: StoreError, key: ObjectKey },
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum QuorumState {
    Met,
    /// Creation has to wait, with a reason naming every unmet dependency.
    Unmet(String),
}

/// Checks every declared dependency and collects the ones that are not yet satisfied.
pub async fn evaluate_start_quorum(
    store: &dyn ResourceStore,
    cluster: &CoherenceCluster,
) -> Result<QuorumState> {
    let mut waiting_for = Vec::new();
    for quorum in &cluster.spec.start_quorum {
        if let Some(unmet) = check_dependency(store, cluster, quorum).await? {
            waiting_for.push(unmet);
        }
    }
    if waiting_for.is_empty() {
        Ok(QuorumState::Met)
    } else {
        Ok(QuorumState::Unmet(format!(
            "Waiting for creation quorum to be met: \"{}\"",
            waiting_for.join("\" and \"")
        )))
    }
}

async fn check_dependency(
    store: &dyn ResourceStore,
    cluster: &CoherenceCluster,
    quorum: &StartQuorum,
) -> Result<Option<String>> {
    let key = ObjectKey::new(
        quorum
            .namespace
            .clone()
            .unwrap_or_else(|| cluster.key().namespace),
        quorum.deployment.clone(),
    );
    let Some(dependency) = store
        .get_cluster(&key)
        .await
        .context(GetDependencySnafu { key: key.clone() })?
    else {
        return Ok(Some(format!("deployment '{key}' to be created")));
    };

    let status = dependency.status.unwrap_or_default();
    match quorum.pod_count.filter(|count| *count > 0) {
        None if status.phase != Some(Phase::Ready) => {
            Ok(Some(format!("deployment '{key}' to be ready")))
        }
        Some(count) if status.ready_replicas < count => Ok(Some(format!(
            "deployment '{key}' to have {count} ready Pods (ready={})",
            status.ready_replicas
        ))),
        _ => Ok(None),
    }
}
