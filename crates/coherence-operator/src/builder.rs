//! Builds the desired StatefulSet for a [`CoherenceCluster`].

use std::collections::BTreeMap;

use k8s_openapi::{
    api::{
        apps::v1::{StatefulSet, StatefulSetSpec, StatefulSetUpdateStrategy},
        core::v1::{Container, ContainerPort, PodSpec, PodTemplateSpec},
    },
    apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta},
};
use kube::{Resource, ResourceExt};
use snafu::{OptionExt, ResultExt, Snafu};

use crate::{
    crd::{
        ANNOTATION_LAST_APPLIED, CONTAINER_NAME, CoherenceCluster, DEFAULT_HEALTH_PORT,
        DEFAULT_IMAGE, PORT_NAME_HEALTH,
    },
    store::ObjectKey,
    upgrade::ResolvedStrategy,
};

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("cannot build owner reference for {key}, the object has no uid"))]
    OwnerReference { key: ObjectKey },

    #[snafu(display("failed to serialize last applied state of {key}"))]
    SerializeLastApplied {
        source: serde_json::Error,
        key: ObjectKey,
    },

    #[snafu(display("failed to parse last applied state of StatefulSet {key}"))]
    ParseLastApplied {
        source: serde_json::Error,
        key: ObjectKey,
    },
}

/// Produces the StatefulSet a cluster should be running as.
pub trait StatefulSetBuilder: Send + Sync {
    fn build(&self, cluster: &CoherenceCluster) -> Result<StatefulSet>;
}

/// A single `coherence` container exposing the health port, one Pod per member.
///
/// Pods are created and deleted in parallel (`Parallel` Pod management), so scaling by more than
/// one member is not serialized by the StatefulSet controller.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultStatefulSetBuilder;

impl StatefulSetBuilder for DefaultStatefulSetBuilder {
    fn build(&self, cluster: &CoherenceCluster) -> Result<StatefulSet> {
        let key = cluster.key();
        let owner = cluster
            .controller_owner_ref(&())
            .context(OwnerReferenceSnafu { key: key.clone() })?;

        let selector = cluster.selector_labels();
        let mut labels = cluster.spec.labels.clone();
        labels.extend(selector.clone());

        // Only the Pod strategy lets the StatefulSet controller replace Pods on its own.
        let update_type = match ResolvedStrategy::for_cluster(cluster) {
            ResolvedStrategy::ByPod => "RollingUpdate",
            ResolvedStrategy::Manual
            | ResolvedStrategy::ByNode
            | ResolvedStrategy::ByNodeLabel(_) => "OnDelete",
        };

        let spec = StatefulSetSpec {
            replicas: Some(cluster.replicas()),
            selector: LabelSelector {
                match_labels: Some(selector),
                ..LabelSelector::default()
            },
            service_name: Some(cluster.wka_service_name()),
            pod_management_policy: Some("Parallel".to_owned()),
            update_strategy: Some(StatefulSetUpdateStrategy {
                type_: Some(update_type.to_owned()),
                ..StatefulSetUpdateStrategy::default()
            }),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels.clone()),
                    ..ObjectMeta::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: CONTAINER_NAME.to_owned(),
                        image: Some(
                            cluster
                                .spec
                                .image
                                .clone()
                                .unwrap_or_else(|| DEFAULT_IMAGE.to_owned()),
                        ),
                        ports: Some(vec![ContainerPort {
                            name: Some(PORT_NAME_HEALTH.to_owned()),
                            container_port: DEFAULT_HEALTH_PORT,
                            ..ContainerPort::default()
                        }]),
                        ..Container::default()
                    }],
                    ..PodSpec::default()
                }),
            },
            ..StatefulSetSpec::default()
        };

        let last_applied = last_applied(&key, &labels, &spec)?;
        Ok(StatefulSet {
            metadata: ObjectMeta {
                name: Some(cluster.name_any()),
                namespace: cluster.namespace(),
                labels: Some(labels),
                annotations: Some(BTreeMap::from([(
                    ANNOTATION_LAST_APPLIED.to_owned(),
                    last_applied,
                )])),
                owner_references: Some(vec![owner]),
                ..ObjectMeta::default()
            },
            spec: Some(spec),
            status: None,
        })
    }
}

/// The part of a StatefulSet the operator owns, recorded so later updates can tell which fields
/// it set before.
fn last_applied(
    key: &ObjectKey,
    labels: &BTreeMap<String, String>,
    spec: &StatefulSetSpec,
) -> Result<String> {
    let snapshot = StatefulSet {
        metadata: ObjectMeta {
            labels: Some(labels.clone()),
            ..ObjectMeta::default()
        },
        spec: Some(spec.clone()),
        status: None,
    };
    serde_json::to_string(&snapshot).context(SerializeLastAppliedSnafu { key: key.clone() })
}

pub fn last_applied_annotation(sts: &StatefulSet) -> Option<&str> {
    sts.annotations().get(ANNOTATION_LAST_APPLIED).map(String::as_str)
}

/// The snapshot recorded on `sts` by the last build, if any.
pub fn parse_last_applied(sts: &StatefulSet) -> Result<Option<StatefulSet>> {
    last_applied_annotation(sts)
        .map(|json| {
            serde_json::from_str(json).context(ParseLastAppliedSnafu {
                key: ObjectKey::new(sts.namespace().unwrap_or_default(), sts.name_any()),
            })
        })
        .transpose()
}
