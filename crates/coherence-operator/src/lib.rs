//! A Kubernetes operator managing the lifecycle of Coherence data grid clusters.
//!
//! Each `CoherenceCluster` is backed by one StatefulSet. The [`reconciler::Reconciler`] creates,
//! scales, updates and finalizes it while keeping the grid's data safe.

pub mod builder;
pub mod cli;
pub mod client;
pub mod config;
pub mod crd;
pub mod finalizer;
pub mod health;
pub mod lock;
pub mod logging;
pub mod patch;
pub mod podutils;
pub mod probe;
pub mod quorum;
pub mod reconciler;
pub mod scaling;
pub mod status;
pub mod store;
pub mod upgrade;

#[cfg(test)]
mod testing;
