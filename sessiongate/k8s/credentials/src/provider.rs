use crate::{kubeconfig, CsrMinter, ManagementCredentials};
use sessiongate_core::{
    AccessRequest, Credential, DiscoverClusters, ProvideCredentials, Progress, Result, Target,
};
use sessiongate_k8s_discovery::HostedClusterDiscovery;
use std::sync::Arc;

/// Mints credentials for any session target.
///
/// Hosted control planes are reached through a management cluster
/// credential minted on every call, so a long poll never outlives its bearer
/// token.
#[derive(Clone)]
pub struct ClusterCredentials {
    management: ManagementCredentials,
    minter: Arc<CsrMinter>,
}

impl ClusterCredentials {
    pub fn new(management: ManagementCredentials) -> Self {
        Self {
            management,
            minter: Arc::new(CsrMinter::default()),
        }
    }
}

#[async_trait::async_trait]
impl ProvideCredentials for ClusterCredentials {
    async fn get_credential(
        &self,
        target: &Target,
        request: &AccessRequest,
    ) -> Result<Progress<Credential>> {
        let management = self.management.credential_for(target.management()).await?;
        let Some(cluster) = target.hosted_cluster() else {
            return Ok(Progress::Ready(management));
        };

        let client = kubeconfig::client(&management).await?;
        let info = HostedClusterDiscovery::new(client.clone())
            .discover(cluster)
            .await?;
        tracing::debug!(cluster = %info.id, namespace = %info.namespace(), "Resolved hosted cluster");
        self.minter.mint(&client, &info, request).await
    }

    fn release(&self, name: &str) {
        self.minter.forget(name);
    }
}
