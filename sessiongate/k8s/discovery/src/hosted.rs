use kube::api::ListParams;
use sessiongate_core::{
    cluster::select_one,
    identifier::{HCP_PROVIDER, HCP_TYPE},
    ClusterId, ClusterInfo, DiscoverClusters, Error, ResourceRef, Result, CLUSTER_ID_LABEL,
    CLUSTER_NAME_LABEL,
};
use sessiongate_k8s_api::{Api, Client, HostedCluster, ResourceExt};

/// Finds hosted clusters by listing `HostedCluster` records across all
/// namespaces of a management cluster.
#[derive(Clone)]
pub struct HostedClusterDiscovery {
    api: Api<HostedCluster>,
}

// === impl HostedClusterDiscovery ===

impl HostedClusterDiscovery {
    pub fn new(client: Client) -> Self {
        Self {
            api: Api::all(client),
        }
    }

    async fn list(&self, selector: Option<String>) -> Result<Vec<HostedCluster>> {
        let mut params = ListParams::default();
        if let Some(selector) = selector.as_deref() {
            params = params.labels(selector);
        }
        let list = self
            .api
            .list(&params)
            .await
            .map_err(|error| sessiongate_k8s_api::classify("listing hosted clusters", error))?;
        tracing::debug!(selector = selector.as_deref(), count = list.items.len(), "Listed hosted clusters");
        Ok(list.items)
    }
}

#[async_trait::async_trait]
impl DiscoverClusters for HostedClusterDiscovery {
    async fn discover_by_id(&self, id: &ClusterId) -> Result<ClusterInfo> {
        let items = self.list(Some(format!("{CLUSTER_ID_LABEL}={id}"))).await?;
        find_by_id(&items, id)
    }

    async fn discover_by_resource(&self, resource: &ResourceRef) -> Result<ClusterInfo> {
        let items = self
            .list(Some(format!("{CLUSTER_NAME_LABEL}={}", resource.name())))
            .await?;
        find_by_resource(&items, resource)
    }

    async fn list_all(&self) -> Result<Vec<ClusterInfo>> {
        let items = self.list(None).await?;
        Ok(items
            .iter()
            .filter_map(|hc| match cluster_info(hc) {
                Ok(info) => Some(info),
                Err(error) => {
                    tracing::debug!(
                        namespace = %hc.namespace().unwrap_or_default(),
                        name = %hc.name_any(),
                        %error,
                        "Skipping hosted cluster"
                    );
                    None
                }
            })
            .collect())
    }
}

/// Converts a `HostedCluster` into a cluster record.
///
/// Records without an id label or without Azure platform details cannot be
/// addressed and are rejected.
pub fn cluster_info(hc: &HostedCluster) -> Result<ClusterInfo> {
    let name = hc.name_any();
    let id = hc
        .labels()
        .get(CLUSTER_ID_LABEL)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| {
            Error::invalid(
                "hosted cluster",
                format!("{name} has no {CLUSTER_ID_LABEL} label"),
            )
        })?;
    let azure = hc.spec.platform.azure.as_ref().ok_or_else(|| {
        Error::invalid("hosted cluster", format!("{name} has no Azure platform"))
    })?;
    let base_namespace = hc
        .namespace()
        .ok_or_else(|| Error::invalid("hosted cluster", format!("{name} has no namespace")))?;

    // The user-facing resource name is carried in a label; fall back to the
    // object name for records that predate it.
    let resource_name = hc
        .labels()
        .get(CLUSTER_NAME_LABEL)
        .filter(|n| !n.is_empty())
        .unwrap_or(&name);
    let resource_ref = ResourceRef::new(
        &azure.subscription_id,
        &azure.resource_group,
        HCP_PROVIDER,
        HCP_TYPE,
        resource_name,
    );

    Ok(ClusterInfo {
        id: id.clone(),
        base_namespace,
        subscription_id: azure.subscription_id.clone(),
        resource_group: azure.resource_group.clone(),
        resource_ref: Some(resource_ref),
        api_endpoint: hc
            .status
            .as_ref()
            .and_then(|s| s.control_plane_endpoint.as_ref())
            .map(|ep| ep.url()),
        name,
    })
}

/// Selects the single record carrying the given id label.
pub fn find_by_id(items: &[HostedCluster], id: &ClusterId) -> Result<ClusterInfo> {
    let matches = items
        .iter()
        .filter(|hc| hc.labels().get(CLUSTER_ID_LABEL).map(String::as_str) == Some(id.as_str()))
        .collect::<Vec<_>>();
    let hc = select_one(format!("hosted cluster with id {id}"), matches)?;
    cluster_info(hc)
}

/// Selects the single record whose derived resource id matches `resource`.
pub fn find_by_resource(items: &[HostedCluster], resource: &ResourceRef) -> Result<ClusterInfo> {
    let matches = items
        .iter()
        .filter_map(|hc| cluster_info(hc).ok())
        .filter(|info| {
            info.resource_ref.as_ref().is_some_and(|r| {
                r.is_owned_by(resource.subscription_id(), resource.resource_group())
                    && r.name().eq_ignore_ascii_case(resource.name())
            })
        })
        .collect::<Vec<_>>();
    select_one(format!("hosted cluster {resource}"), matches)
}
