//! Command line interface of the operator binary.

use std::time::Duration;

use clap::{Args, Parser};
use k8s_openapi::NamespaceResourceScope;
use kube::{Api, Resource};

use crate::config::ControllerConfig;

#[derive(Debug, PartialEq, Eq, Parser)]
#[command(
    name = "coherence-operator",
    version,
    about = "Operator for Coherence data grid clusters"
)]
pub enum Command {
    /// Print the CoherenceCluster CRD.
    Crd,

    /// Run the operator.
    Run(RunArguments),
}

#[derive(Debug, PartialEq, Eq, Args)]
pub struct RunArguments {
    /// Watch a single namespace instead of all namespaces
    #[arg(long, env, default_value = "")]
    pub watch_namespace: WatchNamespace,

    /// How long safe scaling waits before checking the cluster's Status HA again
    #[arg(long, env, default_value = "1m", value_parser = humantime::parse_duration)]
    pub status_ha_retry: Duration,

    /// Allow reading Node labels, needed for rolling upgrades by Node or Node label
    #[arg(long, env, default_value_t = true, action = clap::ArgAction::Set)]
    pub node_lookup_enabled: bool,

    /// Never suspend grid services before scaling to zero or deleting a cluster
    #[arg(long, env)]
    pub skip_service_suspend: bool,

    /// Field manager recorded on objects written by the operator
    #[arg(long, env, default_value = "coherence-operator")]
    pub field_manager: String,
}

impl RunArguments {
    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            status_ha_retry: self.status_ha_retry,
            node_lookup_enabled: self.node_lookup_enabled,
            skip_service_suspend: self.skip_service_suspend,
        }
    }
}

#[derive(Clone, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum WatchNamespace {
    All,
    One(String),
}

impl From<&str> for WatchNamespace {
    fn from(s: &str) -> Self {
        if s.is_empty() {
            Self::All
        } else {
            Self::One(s.to_owned())
        }
    }
}

impl WatchNamespace {
    /// An API for the watched namespace, or for all namespaces.
    pub fn get_api<K>(&self, client: &kube::Client) -> Api<K>
    where
        K: Resource<DynamicType = (), Scope = NamespaceResourceScope>,
    {
        match self {
            Self::All => Api::all(client.clone()),
            Self::One(namespace) => Api::namespaced(client.clone(), namespace),
        }
    }
}
