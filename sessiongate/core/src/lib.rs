#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod access;
pub mod clock;
pub mod cluster;
pub mod credential;
mod error;
pub mod identifier;
pub mod poll;
pub mod session;

pub use self::{
    access::{AccessRequest, Privilege},
    clock::{Clock, ManualClock, SystemClock},
    cluster::{
        AksClusterInfo, CloudInventory, ClusterInfo, DiscoverClusters, DiscoverFleet, FleetFilter,
        InventoryRecord, Subscription,
    },
    credential::{AuthMaterial, Credential, ProvideCredentials, Target},
    error::{BoxError, Error, ErrorKind, Result},
    identifier::{ClusterId, ClusterIdentifier, ManagementCluster, ResourceRef},
    poll::{poll_until_ready, PollConfig, Progress},
    session::{SessionId, SessionOptions, SessionRegistry},
};

/// Label carrying a hosted cluster's opaque id.
pub const CLUSTER_ID_LABEL: &str = "api.openshift.com/id";

/// Label carrying a hosted cluster's user-facing name.
pub const CLUSTER_NAME_LABEL: &str = "api.openshift.com/name";
