use crate::kubeconfig;
use chrono::Utc;
use sessiongate_azure::{aks_scope, ArmClient, TokenSource};
use sessiongate_core::{
    AuthMaterial, Credential, DiscoverFleet, FleetFilter, ManagementCluster, ResourceRef, Result,
};
use std::sync::Arc;

/// Mints bearer credentials for AKS management clusters.
#[derive(Clone)]
pub struct ManagementCredentials {
    arm: ArmClient,
    tokens: Arc<dyn TokenSource>,
    fleet: Arc<dyn DiscoverFleet>,
}

// === impl ManagementCredentials ===

impl ManagementCredentials {
    pub fn new(arm: ArmClient, tokens: Arc<dyn TokenSource>, fleet: Arc<dyn DiscoverFleet>) -> Self {
        Self { arm, tokens, fleet }
    }

    /// Resolves a management cluster reference to its AKS resource id. Bare
    /// names are looked up among the fleet's management clusters, optionally
    /// within one region.
    pub async fn resolve(
        &self,
        cluster: &ManagementCluster,
        region: Option<String>,
    ) -> Result<ResourceRef> {
        match cluster {
            ManagementCluster::Resource(resource) => Ok(resource.clone()),
            ManagementCluster::Name(name) => {
                let filter = FleetFilter::management_clusters()
                    .with_region(region)
                    .with_name(name);
                let found = self.fleet.find_single(&filter).await?;
                tracing::debug!(%name, subscription = %found.subscription_id, "Resolved management cluster");
                Ok(found.resource_ref())
            }
        }
    }

    /// The credential expires with the bearer token.
    pub async fn credential(&self, cluster: &ResourceRef) -> Result<Credential> {
        let user_kubeconfig = self.arm.cluster_user_kubeconfig(cluster).await?;
        let endpoint = kubeconfig::cluster_endpoint(&user_kubeconfig)?;
        let token = self.tokens.token(&aks_scope()).await?;
        Ok(Credential {
            endpoint: endpoint.server,
            ca_data: endpoint.ca_pem,
            auth: AuthMaterial::Bearer(token.token),
            not_before: Utc::now(),
            not_after: token.expires_on,
        })
    }

    pub async fn credential_for(&self, cluster: &ManagementCluster) -> Result<Credential> {
        let resource = self.resolve(cluster, None).await?;
        self.credential(&resource).await
    }
}
