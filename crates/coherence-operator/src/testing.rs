//! In-memory fakes for the capability traits, and fixtures shared by the unit tests.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use k8s_openapi::{
    api::{
        apps::v1::{StatefulSet, StatefulSetSpec, StatefulSetStatus},
        core::v1::{Container, ContainerPort, Pod, PodCondition, PodSpec, PodStatus},
    },
    apimachinery::pkg::apis::meta::v1::LabelSelector,
};
use kube::{ResourceExt, api::ObjectMeta, runtime::events::EventType};
use serde::{Serialize, de::DeserializeOwned};

use crate::{
    builder::{DefaultStatefulSetBuilder, StatefulSetBuilder},
    config::ControllerConfig,
    crd::{
        CONTAINER_NAME, CoherenceCluster, CoherenceClusterSpec, DEFAULT_HEALTH_PORT, FINALIZER_NAME,
        GridProbe, LABEL_CLUSTER, LABEL_DEPLOYMENT, LABEL_REVISION_HASH, PORT_NAME_HEALTH,
    },
    health::ClusterHealth,
    probe::{PodProber, ProbeOutcome, ProbeResult},
    reconciler::{Capabilities, Reconciler},
    scaling::ScalingEngine,
    status::CoherenceClusterStatus,
    store::{
        EventSink, ExecOutput, NodeLookup, ObjectKey, RemoteExec, ResourceStore, StoreError,
        UnavailableSnafu,
    },
    upgrade::UpgradeCoordinator,
};

pub const NAMESPACE: &str = "grid";
pub const NAME: &str = "storage";

fn labels() -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_CLUSTER.to_owned(), NAME.to_owned()),
        (LABEL_DEPLOYMENT.to_owned(), NAME.to_owned()),
    ])
}

/// A Running Pod of the `grid/storage` cluster.
pub fn pod(name: &str, node: &str, revision: &str, ready: bool) -> Pod {
    let mut labels = labels();
    labels.insert(LABEL_REVISION_HASH.to_owned(), revision.to_owned());
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_owned()),
            namespace: Some(NAMESPACE.to_owned()),
            labels: Some(labels),
            ..ObjectMeta::default()
        },
        spec: Some(PodSpec {
            node_name: Some(node.to_owned()),
            containers: vec![Container {
                name: CONTAINER_NAME.to_owned(),
                ports: Some(vec![ContainerPort {
                    name: Some(PORT_NAME_HEALTH.to_owned()),
                    container_port: DEFAULT_HEALTH_PORT,
                    ..ContainerPort::default()
                }]),
                ..Container::default()
            }],
            ..PodSpec::default()
        }),
        status: Some(PodStatus {
            phase: Some("Running".to_owned()),
            pod_ip: Some("10.0.0.1".to_owned()),
            conditions: Some(vec![PodCondition {
                type_: "Ready".to_owned(),
                status: if ready { "True" } else { "False" }.to_owned(),
                ..PodCondition::default()
            }]),
            ..PodStatus::default()
        }),
    }
}

/// The `grid/storage` StatefulSet with `replicas` current Pods of which `ready` are ready.
pub fn stateful_set(replicas: i32, ready: i32, current_rev: &str, update_rev: &str) -> StatefulSet {
    StatefulSet {
        metadata: ObjectMeta {
            name: Some(NAME.to_owned()),
            namespace: Some(NAMESPACE.to_owned()),
            ..ObjectMeta::default()
        },
        spec: Some(StatefulSetSpec {
            replicas: Some(replicas),
            selector: LabelSelector {
                match_labels: Some(labels()),
                ..LabelSelector::default()
            },
            ..StatefulSetSpec::default()
        }),
        status: Some(StatefulSetStatus {
            replicas,
            ready_replicas: Some(ready),
            current_replicas: Some(replicas),
            updated_replicas: Some(if current_rev == update_rev { replicas } else { 0 }),
            current_revision: Some(current_rev.to_owned()),
            update_revision: Some(update_rev.to_owned()),
            ..StatefulSetStatus::default()
        }),
    }
}

fn merge<T: Serialize + DeserializeOwned>(object: &T, patch: &serde_json::Value) -> T {
    let mut doc = serde_json::to_value(object).unwrap();
    json_patch::merge(&mut doc, patch);
    serde_json::from_value(doc).unwrap()
}

fn key_of<K: ResourceExt>(object: &K) -> ObjectKey {
    ObjectKey::new(object.namespace().unwrap_or_default(), object.name_any())
}

#[derive(Default)]
struct StoreState {
    clusters: BTreeMap<ObjectKey, CoherenceCluster>,
    stateful_sets: BTreeMap<ObjectKey, StatefulSet>,
    pods: BTreeMap<ObjectKey, Pod>,
    created: Vec<ObjectKey>,
    deleted_stateful_sets: Vec<ObjectKey>,
    deleted_pods: Vec<String>,
    sts_patches: usize,
    fail_patches: bool,
    fail_pod_deletes: bool,
}

#[derive(Default)]
pub struct FakeStore {
    state: Mutex<StoreState>,
}

impl FakeStore {
    pub fn put_cluster(&self, cluster: CoherenceCluster) {
        let mut state = self.state.lock().unwrap();
        state.clusters.insert(key_of(&cluster), cluster);
    }

    pub fn cluster(&self, key: &ObjectKey) -> Option<CoherenceCluster> {
        self.state.lock().unwrap().clusters.get(key).cloned()
    }

    pub fn update_cluster(&self, key: &ObjectKey, f: impl FnOnce(&mut CoherenceCluster)) {
        let mut state = self.state.lock().unwrap();
        f(state.clusters.get_mut(key).unwrap());
    }

    pub fn put_stateful_set(&self, sts: StatefulSet) {
        let mut state = self.state.lock().unwrap();
        state.stateful_sets.insert(key_of(&sts), sts);
    }

    pub fn stateful_set(&self, key: &ObjectKey) -> Option<StatefulSet> {
        self.state.lock().unwrap().stateful_sets.get(key).cloned()
    }

    /// Replica count of the `grid/storage` StatefulSet.
    pub fn replicas(&self) -> Option<i32> {
        self.stateful_set(&ObjectKey::new(NAMESPACE, NAME))
            .and_then(|sts| sts.spec)
            .and_then(|spec| spec.replicas)
    }

    pub fn put_pods(&self, pods: Vec<Pod>) {
        for pod in pods {
            self.put_pod(pod);
        }
    }

    pub fn put_pod(&self, pod: Pod) {
        let mut state = self.state.lock().unwrap();
        state.pods.insert(key_of(&pod), pod);
    }

    pub fn deleted_pods(&self) -> Vec<String> {
        self.state.lock().unwrap().deleted_pods.clone()
    }

    pub fn created(&self) -> Vec<ObjectKey> {
        self.state.lock().unwrap().created.clone()
    }

    pub fn deleted_stateful_sets(&self) -> Vec<ObjectKey> {
        self.state.lock().unwrap().deleted_stateful_sets.clone()
    }

    pub fn stateful_set_patches(&self) -> usize {
        self.state.lock().unwrap().sts_patches
    }

    pub fn fail_patches(&self) {
        self.state.lock().unwrap().fail_patches = true;
    }

    pub fn fail_pod_deletes(&self) {
        self.state.lock().unwrap().fail_pod_deletes = true;
    }
}

fn unavailable(message: &str) -> StoreError {
    UnavailableSnafu { message }.build()
}

#[async_trait]
impl ResourceStore for FakeStore {
    async fn get_cluster(&self, key: &ObjectKey) -> Result<Option<CoherenceCluster>, StoreError> {
        Ok(self.cluster(key))
    }

    async fn patch_cluster_metadata(
        &self,
        key: &ObjectKey,
        patch: &serde_json::Value,
    ) -> Result<CoherenceCluster, StoreError> {
        let mut state = self.state.lock().unwrap();
        let cluster = state
            .clusters
            .get_mut(key)
            .ok_or_else(|| unavailable("cluster not found"))?;
        *cluster = merge(cluster, patch);
        Ok(cluster.clone())
    }

    async fn update_cluster_status(
        &self,
        key: &ObjectKey,
        status: &CoherenceClusterStatus,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        let cluster = state
            .clusters
            .get_mut(key)
            .ok_or_else(|| unavailable("cluster not found"))?;
        cluster.status = Some(status.clone());
        Ok(())
    }

    async fn get_stateful_set(&self, key: &ObjectKey) -> Result<Option<StatefulSet>, StoreError> {
        Ok(self.stateful_set(key))
    }

    async fn create_stateful_set(&self, sts: &StatefulSet) -> Result<StatefulSet, StoreError> {
        let mut state = self.state.lock().unwrap();
        let key = key_of(sts);
        state.created.push(key.clone());
        state.stateful_sets.insert(key, sts.clone());
        Ok(sts.clone())
    }

    async fn patch_stateful_set(
        &self,
        key: &ObjectKey,
        patch: &serde_json::Value,
    ) -> Result<StatefulSet, StoreError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_patches {
            return Err(unavailable("patch rejected"));
        }
        state.sts_patches += 1;
        let sts = state
            .stateful_sets
            .get_mut(key)
            .ok_or_else(|| unavailable("StatefulSet not found"))?;
        *sts = merge(sts, patch);
        Ok(sts.clone())
    }

    async fn delete_stateful_set(&self, key: &ObjectKey) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        state.stateful_sets.remove(key);
        state.deleted_stateful_sets.push(key.clone());
        Ok(())
    }

    async fn list_pods(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<Pod>, StoreError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .pods
            .values()
            .filter(|pod| pod.namespace().as_deref() == Some(namespace))
            .filter(|pod| {
                let labels = pod.labels();
                selector.iter().all(|(k, v)| labels.get(k) == Some(v))
            })
            .cloned()
            .collect())
    }

    async fn delete_pod(&self, key: &ObjectKey) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_pod_deletes {
            return Err(unavailable("delete rejected"));
        }
        state.pods.remove(key);
        state.deleted_pods.push(key.name.clone());
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct RecordedEvent {
    pub is_warning: bool,
    pub reason: String,
    pub note: String,
}

#[derive(Default)]
pub struct FakeEvents {
    events: Mutex<Vec<RecordedEvent>>,
}

impl FakeEvents {
    pub fn all(&self) -> Vec<RecordedEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn has_reason(&self, reason: &str) -> bool {
        self.all().iter().any(|event| event.reason == reason)
    }

    pub fn has_note(&self, note: &str) -> bool {
        self.all().iter().any(|event| event.note.contains(note))
    }

    pub fn has_warning(&self, reason: &str) -> bool {
        self.all()
            .iter()
            .any(|event| event.is_warning && event.reason == reason)
    }
}

#[async_trait]
impl EventSink for FakeEvents {
    async fn publish(
        &self,
        _cluster: &CoherenceCluster,
        type_: EventType,
        reason: &str,
        note: String,
    ) {
        self.events.lock().unwrap().push(RecordedEvent {
            is_warning: matches!(type_, EventType::Warning),
            reason: reason.to_owned(),
            note,
        });
    }
}

/// Answers probes from a per-Pod table, succeeding by default.
pub struct FakeProber {
    results: Mutex<HashMap<String, ProbeResult>>,
    default: Mutex<ProbeResult>,
    calls: Mutex<Vec<String>>,
}

impl Default for FakeProber {
    fn default() -> Self {
        Self {
            results: Mutex::default(),
            default: Mutex::new(ProbeResult::Success),
            calls: Mutex::default(),
        }
    }
}

impl FakeProber {
    pub fn set(&self, pod: &str, result: ProbeResult) {
        self.results.lock().unwrap().insert(pod.to_owned(), result);
    }

    pub fn set_default(&self, result: ProbeResult) {
        *self.default.lock().unwrap() = result;
    }

    /// Names of the probed Pods, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl PodProber for FakeProber {
    async fn run(&self, pod: &Pod, _probe: &GridProbe, _service: &str) -> ProbeOutcome {
        let name = pod.name_any();
        self.calls.lock().unwrap().push(name.clone());
        let result = self
            .results
            .lock()
            .unwrap()
            .get(&name)
            .copied()
            .unwrap_or(*self.default.lock().unwrap());
        match result {
            ProbeResult::Success => ProbeOutcome::success("fake"),
            ProbeResult::Failure => ProbeOutcome::failure("fake"),
            ProbeResult::Unknown => ProbeOutcome::unknown("fake"),
        }
    }
}

#[derive(Default)]
pub struct FakeExec {
    response: Mutex<Option<Result<ExecOutput, String>>>,
    calls: Mutex<Vec<(String, String, Vec<String>)>>,
}

impl FakeExec {
    pub fn respond(&self, output: ExecOutput) {
        *self.response.lock().unwrap() = Some(Ok(output));
    }

    pub fn fail(&self, message: &str) {
        *self.response.lock().unwrap() = Some(Err(message.to_owned()));
    }

    pub fn calls(&self) -> Vec<(String, String, Vec<String>)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl RemoteExec for FakeExec {
    async fn exec(
        &self,
        pod: &ObjectKey,
        container: &str,
        command: &[String],
    ) -> Result<ExecOutput, StoreError> {
        self.calls
            .lock()
            .unwrap()
            .push((pod.to_string(), container.to_owned(), command.to_vec()));
        match self.response.lock().unwrap().clone() {
            None => Ok(ExecOutput::default()),
            Some(Ok(output)) => Ok(output),
            Some(Err(message)) => Err(unavailable(&message)),
        }
    }
}

#[derive(Default)]
pub struct FakeNodes {
    labels: Mutex<HashMap<(String, String), String>>,
    lookups: Mutex<usize>,
}

impl FakeNodes {
    pub fn set(&self, node: &str, label: &str, value: &str) {
        self.labels
            .lock()
            .unwrap()
            .insert((node.to_owned(), label.to_owned()), value.to_owned());
    }

    pub fn lookups(&self) -> usize {
        *self.lookups.lock().unwrap()
    }
}

#[async_trait]
impl NodeLookup for FakeNodes {
    async fn node_label(&self, node: &str, label: &str) -> Result<Option<String>, StoreError> {
        *self.lookups.lock().unwrap() += 1;
        Ok(self
            .labels
            .lock()
            .unwrap()
            .get(&(node.to_owned(), label.to_owned()))
            .cloned())
    }
}

/// A `grid/storage` cluster held in a [`FakeStore`], with fakes for every other capability.
pub struct Harness {
    pub store: Arc<FakeStore>,
    pub prober: Arc<FakeProber>,
    pub events: Arc<FakeEvents>,
    pub nodes: Arc<FakeNodes>,
    pub config: ControllerConfig,
}

impl Harness {
    pub fn new() -> Self {
        let mut cluster = CoherenceCluster::new(
            NAME,
            CoherenceClusterSpec {
                replicas: Some(3),
                ..CoherenceClusterSpec::default()
            },
        );
        cluster.metadata.namespace = Some(NAMESPACE.to_owned());
        cluster.metadata.uid = Some("4f6ab9a0-5cb1-4a04-9d5e-ec0a0d0f4a11".to_owned());
        cluster.metadata.finalizers = Some(vec![FINALIZER_NAME.to_owned()]);

        let store = Arc::new(FakeStore::default());
        store.put_cluster(cluster);
        Self {
            store,
            prober: Arc::default(),
            events: Arc::default(),
            nodes: Arc::default(),
            config: ControllerConfig::default(),
        }
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(NAMESPACE, NAME)
    }

    pub fn cluster(&self) -> CoherenceCluster {
        self.store.cluster(&self.key()).unwrap()
    }

    pub fn update_cluster(&self, f: impl FnOnce(&mut CoherenceCluster)) {
        self.store.update_cluster(&self.key(), f);
    }

    pub fn update_spec(&self, f: impl FnOnce(&mut CoherenceClusterSpec)) {
        self.update_cluster(|cluster| f(&mut cluster.spec));
    }

    pub fn update_status(&self, f: impl FnOnce(&mut CoherenceClusterStatus)) {
        self.update_cluster(|cluster| f(cluster.status.get_or_insert_with(Default::default)));
    }

    /// The StatefulSet the default builder produces for the current cluster, with an observed
    /// status.
    pub fn desired_stateful_set(
        &self,
        ready: i32,
        current_rev: &str,
        update_rev: &str,
    ) -> StatefulSet {
        let cluster = self.cluster();
        let mut sts = DefaultStatefulSetBuilder.build(&cluster).unwrap();
        let replicas = cluster.replicas();
        sts.status = stateful_set(replicas, ready, current_rev, update_rev).status;
        sts
    }

    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            store: self.store.clone(),
            prober: self.prober.clone(),
            events: self.events.clone(),
            nodes: self.nodes.clone(),
        }
    }

    pub fn health(&self) -> ClusterHealth {
        ClusterHealth::new(
            self.store.clone(),
            self.prober.clone(),
            self.events.clone(),
            &self.config,
        )
    }

    pub fn scaling(&self) -> ScalingEngine {
        ScalingEngine::new(
            self.store.clone(),
            Arc::new(self.health()),
            self.events.clone(),
            &self.config,
        )
    }

    pub fn upgrades(&self) -> UpgradeCoordinator {
        UpgradeCoordinator::new(
            self.store.clone(),
            Arc::new(self.health()),
            self.events.clone(),
            self.nodes.clone(),
            &self.config,
        )
    }

    pub fn reconciler(&self) -> Reconciler {
        Reconciler::new(
            self.capabilities(),
            Arc::new(DefaultStatefulSetBuilder),
            self.config.clone(),
        )
    }
}
