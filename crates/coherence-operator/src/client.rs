//! Kubernetes-backed implementations of the capabilities in [`crate::store`].

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::{
    api::{
        apps::v1::StatefulSet,
        core::v1::{Node, Pod},
    },
    apimachinery::pkg::apis::meta::v1::Status,
};
use kube::{
    Api, Resource, ResourceExt,
    api::{AttachParams, DeleteParams, ListParams, Patch, PatchParams, PostParams},
    runtime::events::{Event, EventType, Recorder, Reporter},
};
use serde_json::json;
use snafu::{OptionExt, ResultExt};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::{
    crd::CoherenceCluster,
    status::CoherenceClusterStatus,
    store::{
        EventSink, ExecOutput, KubeSnafu, NodeLookup, ObjectKey, ReadOutputSnafu, RemoteExec,
        ResourceStore, StoreError, UnavailableSnafu,
    },
};

/// Reads and writes clusters, StatefulSets and Pods through the API server.
#[derive(Clone)]
pub struct KubeStore {
    client: kube::Client,
    post_params: PostParams,
    patch_params: PatchParams,
    delete_params: DeleteParams,
}

impl KubeStore {
    pub fn new(client: kube::Client, field_manager: Option<String>) -> Self {
        Self {
            client,
            post_params: PostParams {
                field_manager: field_manager.clone(),
                ..PostParams::default()
            },
            patch_params: PatchParams {
                field_manager,
                ..PatchParams::default()
            },
            delete_params: DeleteParams::background(),
        }
    }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope, DynamicType = ()>,
    {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl ResourceStore for KubeStore {
    async fn get_cluster(&self, key: &ObjectKey) -> Result<Option<CoherenceCluster>, StoreError> {
        self.api::<CoherenceCluster>(&key.namespace)
            .get_opt(&key.name)
            .await
            .context(KubeSnafu { key: key.clone() })
    }

    async fn patch_cluster_metadata(
        &self,
        key: &ObjectKey,
        patch: &serde_json::Value,
    ) -> Result<CoherenceCluster, StoreError> {
        self.api::<CoherenceCluster>(&key.namespace)
            .patch(&key.name, &self.patch_params, &Patch::Merge(patch))
            .await
            .context(KubeSnafu { key: key.clone() })
    }

    async fn update_cluster_status(
        &self,
        key: &ObjectKey,
        status: &CoherenceClusterStatus,
    ) -> Result<(), StoreError> {
        let patch = json!({ "status": status });
        self.api::<CoherenceCluster>(&key.namespace)
            .patch_status(&key.name, &self.patch_params, &Patch::Merge(&patch))
            .await
            .context(KubeSnafu { key: key.clone() })?;
        Ok(())
    }

    async fn get_stateful_set(&self, key: &ObjectKey) -> Result<Option<StatefulSet>, StoreError> {
        self.api::<StatefulSet>(&key.namespace)
            .get_opt(&key.name)
            .await
            .context(KubeSnafu { key: key.clone() })
    }

    async fn create_stateful_set(&self, sts: &StatefulSet) -> Result<StatefulSet, StoreError> {
        let key = ObjectKey::new(sts.namespace().unwrap_or_default(), sts.name_any());
        self.api::<StatefulSet>(&key.namespace)
            .create(&self.post_params, sts)
            .await
            .context(KubeSnafu { key })
    }

    async fn patch_stateful_set(
        &self,
        key: &ObjectKey,
        patch: &serde_json::Value,
    ) -> Result<StatefulSet, StoreError> {
        self.api::<StatefulSet>(&key.namespace)
            .patch(&key.name, &self.patch_params, &Patch::Merge(patch))
            .await
            .context(KubeSnafu { key: key.clone() })
    }

    async fn delete_stateful_set(&self, key: &ObjectKey) -> Result<(), StoreError> {
        self.api::<StatefulSet>(&key.namespace)
            .delete(&key.name, &self.delete_params)
            .await
            .context(KubeSnafu { key: key.clone() })?;
        Ok(())
    }

    async fn list_pods(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<Pod>, StoreError> {
        let selector = selector
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",");
        let pods = self
            .api::<Pod>(namespace)
            .list(&ListParams::default().labels(&selector))
            .await
            .context(KubeSnafu {
                key: ObjectKey::new(namespace, selector.clone()),
            })?;
        Ok(pods.items)
    }

    async fn delete_pod(&self, key: &ObjectKey) -> Result<(), StoreError> {
        self.api::<Pod>(&key.namespace)
            .delete(&key.name, &self.delete_params)
            .await
            .context(KubeSnafu { key: key.clone() })?;
        Ok(())
    }
}

/// Publishes events through a [`Recorder`], logging failures.
#[derive(Clone)]
pub struct KubeEventSink {
    recorder: Recorder,
}

impl KubeEventSink {
    pub fn new(client: kube::Client, controller_name: &str) -> Self {
        Self {
            recorder: Recorder::new(
                client,
                Reporter {
                    controller: controller_name.to_owned(),
                    instance: std::env::var("POD_NAME").ok(),
                },
            ),
        }
    }
}

#[async_trait]
impl EventSink for KubeEventSink {
    async fn publish(
        &self,
        cluster: &CoherenceCluster,
        type_: EventType,
        reason: &str,
        note: String,
    ) {
        let event = Event {
            type_,
            reason: reason.to_owned(),
            note: Some(note),
            action: "Reconcile".to_owned(),
            secondary: None,
        };
        if let Err(err) = self
            .recorder
            .publish(&event, &cluster.object_ref(&()))
            .await
        {
            tracing::warn!(
                cluster = %cluster.key(),
                reason,
                error = &err as &dyn std::error::Error,
                "failed to publish event"
            );
        }
    }
}

/// Runs commands through the Pod `exec` subresource.
#[derive(Clone)]
pub struct KubeExec {
    client: kube::Client,
}

impl KubeExec {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl RemoteExec for KubeExec {
    async fn exec(
        &self,
        pod: &ObjectKey,
        container: &str,
        command: &[String],
    ) -> Result<ExecOutput, StoreError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &pod.namespace);
        let params = AttachParams::default()
            .container(container)
            .stdin(false)
            .stdout(true)
            .stderr(true);
        let mut attached = api
            .exec(&pod.name, command.to_vec(), &params)
            .await
            .context(KubeSnafu { key: pod.clone() })?;

        let (stdout, stderr) = (attached.stdout(), attached.stderr());
        let (stdout, stderr) = tokio::try_join!(read_all(stdout, pod), read_all(stderr, pod))?;
        let status = match attached.take_status() {
            Some(status) => status.await,
            None => None,
        };
        let status = status.context(UnavailableSnafu {
            message: format!("no exit status returned by command in Pod {pod}"),
        })?;
        Ok(ExecOutput {
            exit_code: exit_code(&status),
            stdout,
            stderr,
        })
    }
}

async fn read_all(
    stream: Option<impl AsyncRead + Unpin>,
    pod: &ObjectKey,
) -> Result<String, StoreError> {
    let mut output = String::new();
    if let Some(mut stream) = stream {
        stream
            .read_to_string(&mut output)
            .await
            .context(ReadOutputSnafu { key: pod.clone() })?;
    }
    Ok(output)
}

/// The API server reports a non-zero exit code as a `Failure` with an `ExitCode` cause.
fn exit_code(status: &Status) -> i32 {
    if status.status.as_deref() == Some("Success") {
        return 0;
    }
    status
        .details
        .iter()
        .flat_map(|details| details.causes.iter().flatten())
        .find(|cause| cause.reason.as_deref() == Some("ExitCode"))
        .and_then(|cause| cause.message.as_deref())
        .and_then(|code| code.parse().ok())
        .unwrap_or(1)
}

/// Reads Node labels. Needs cluster-wide read access to Nodes.
#[derive(Clone)]
pub struct KubeNodeLookup {
    client: kube::Client,
}

impl KubeNodeLookup {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl NodeLookup for KubeNodeLookup {
    async fn node_label(&self, node: &str, label: &str) -> Result<Option<String>, StoreError> {
        let node = Api::<Node>::all(self.client.clone())
            .get_opt(node)
            .await
            .context(KubeSnafu {
                key: ObjectKey::new("", node),
            })?;
        Ok(node.and_then(|node| node.labels().get(label).cloned()))
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{StatusCause, StatusDetails};
    use rstest::rstest;

    use super::*;

    fn status(status: &str, exit_code: Option<&str>) -> Status {
        Status {
            status: Some(status.to_owned()),
            details: exit_code.map(|code| StatusDetails {
                causes: Some(vec![StatusCause {
                    reason: Some("ExitCode".to_owned()),
                    message: Some(code.to_owned()),
                    ..StatusCause::default()
                }]),
                ..StatusDetails::default()
            }),
            ..Status::default()
        }
    }

    #[rstest]
    #[case::success(status("Success", None), 0)]
    #[case::exit_code(status("Failure", Some("3")), 3)]
    #[case::no_cause(status("Failure", None), 1)]
    #[case::garbled_cause(status("Failure", Some("three")), 1)]
    fn exec_exit_code(#[case] status: Status, #[case] expected: i32) {
        assert_eq!(exit_code(&status), expected);
    }
}
