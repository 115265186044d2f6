#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Resolves cluster identifiers to concrete clusters.
//!
//! Hosted clusters are found by listing HyperShift `HostedCluster` records on
//! a management cluster. AKS clusters are found by fanning out over every
//! subscription visible to the cloud inventory.

mod fleet;
mod hosted;

pub use self::{
    fleet::FleetDiscovery,
    hosted::{cluster_info, find_by_id, find_by_resource, HostedClusterDiscovery},
};
