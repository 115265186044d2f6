use crate::{
    identifier::{ClusterId, ClusterIdentifier, ResourceRef},
    Error, Result,
};
use serde::Serialize;
use std::collections::BTreeMap;

/// A resolved hosted cluster.
///
/// Produced fresh on every discovery call; nothing here is persisted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterInfo {
    pub id: String,
    pub name: String,

    /// Namespace of the HostedCluster record. The control plane namespace
    /// is derived from this and `name`.
    pub base_namespace: String,

    pub subscription_id: String,
    pub resource_group: String,
    pub resource_ref: Option<ResourceRef>,

    /// The hosted API server address, if the control plane has published one.
    pub api_endpoint: Option<String>,
}

/// An AKS cluster found by fleet discovery.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AksClusterInfo {
    pub name: String,
    pub resource_group: String,
    pub subscription_id: String,
    pub subscription_name: String,
    pub location: String,
    pub state: Option<String>,
    pub tags: BTreeMap<String, String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FleetFilter {
    pub tag_key: String,
    pub tag_value: String,
    pub region: Option<String>,
    pub name: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Subscription {
    pub id: String,
    pub display_name: String,
}

/// A single resource as returned by the cloud inventory.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InventoryRecord {
    pub name: String,
    pub resource_group: String,
    pub location: String,
    pub provisioning_state: Option<String>,
    pub tags: BTreeMap<String, String>,
}

/// Resolves hosted cluster identifiers to cluster records.
#[async_trait::async_trait]
pub trait DiscoverClusters: Send + Sync {
    async fn discover_by_id(&self, id: &ClusterId) -> Result<ClusterInfo>;

    async fn discover_by_resource(&self, resource: &ResourceRef) -> Result<ClusterInfo>;

    /// Lists every discoverable cluster, skipping records without an id.
    async fn list_all(&self) -> Result<Vec<ClusterInfo>>;

    async fn discover(&self, target: &ClusterIdentifier) -> Result<ClusterInfo> {
        match target {
            ClusterIdentifier::Id(id) => self.discover_by_id(id).await,
            ClusterIdentifier::Resource(r) => self.discover_by_resource(r).await,
        }
    }
}

/// Enumerates AKS clusters across every reachable subscription.
#[async_trait::async_trait]
pub trait DiscoverFleet: Send + Sync {
    async fn discover_fleet(&self, filter: &FleetFilter) -> Result<Vec<AksClusterInfo>>;

    /// Resolves a filter to exactly one cluster.
    async fn find_single(&self, filter: &FleetFilter) -> Result<AksClusterInfo> {
        let what = match filter.name.as_deref() {
            Some(name) => format!("AKS cluster {name:?}"),
            None => format!("AKS cluster with {}={}", filter.tag_key, filter.tag_value),
        };
        select_one(what, self.discover_fleet(filter).await?)
    }
}

/// Lists subscriptions and resources from the cloud provider.
#[async_trait::async_trait]
pub trait CloudInventory: Send + Sync + 'static {
    async fn list_subscriptions(&self) -> Result<Vec<Subscription>>;

    async fn list_resources(
        &self,
        subscription_id: &str,
        resource_type: &str,
    ) -> Result<Vec<InventoryRecord>>;
}

/// Applies the zero/one/many policy: no match is `NotFound`, more than one is
/// `Ambiguous`.
pub fn select_one<T>(what: impl Into<String>, mut matches: Vec<T>) -> Result<T> {
    let what = what.into();
    match matches.len() {
        0 => Err(Error::NotFound(what)),
        1 => Ok(matches.remove(0)),
        count => Err(Error::Ambiguous { what, count }),
    }
}

// === impl ClusterInfo ===

impl ClusterInfo {
    pub fn namespace(&self) -> String {
        format!("{}-{}", self.base_namespace, self.name)
    }
}

// === impl AksClusterInfo ===

impl AksClusterInfo {
    pub fn resource_ref(&self) -> ResourceRef {
        ResourceRef::managed_cluster(&self.subscription_id, &self.resource_group, &self.name)
    }
}

// === impl FleetFilter ===

impl FleetFilter {
    pub const CLUSTER_TYPE_TAG: &'static str = "clusterType";

    pub fn new(tag_key: impl Into<String>, tag_value: impl Into<String>) -> Self {
        Self {
            tag_key: tag_key.into(),
            tag_value: tag_value.into(),
            region: None,
            name: None,
        }
    }

    pub fn management_clusters() -> Self {
        Self::new(Self::CLUSTER_TYPE_TAG, "mgmt-cluster")
    }

    pub fn service_clusters() -> Self {
        Self::new(Self::CLUSTER_TYPE_TAG, "svc-cluster")
    }

    pub fn with_region(self, region: Option<String>) -> Self {
        Self { region, ..self }
    }

    pub fn with_name(self, name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..self
        }
    }

    pub fn matches(&self, record: &InventoryRecord) -> bool {
        if record.tags.get(&self.tag_key) != Some(&self.tag_value) {
            return false;
        }
        if let Some(region) = &self.region {
            if !record.location.eq_ignore_ascii_case(region) {
                return false;
            }
        }
        match &self.name {
            Some(name) => record.name == *name,
            None => true,
        }
    }
}
