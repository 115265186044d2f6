use sessiongate_core::{
    identifier::{AKS_PROVIDER, AKS_TYPE},
    AksClusterInfo, CloudInventory, DiscoverFleet, FleetFilter, Result,
};
use std::{sync::Arc, time::Duration};
use tokio::{sync::mpsc, task::JoinSet, time};
use tracing::{info_span, Instrument};

/// Discovers AKS clusters by querying every subscription concurrently.
///
/// A subscription that fails or times out contributes no clusters; only a
/// failure to list the subscriptions themselves is an error. Dropping the
/// discovery future aborts any subscription queries still in flight.
#[derive(Debug)]
pub struct FleetDiscovery<I> {
    inventory: Arc<I>,
    subscription_timeout: Duration,
}

// === impl FleetDiscovery ===

impl<I> FleetDiscovery<I> {
    pub const DEFAULT_SUBSCRIPTION_TIMEOUT: Duration = Duration::from_secs(30);

    pub fn new(inventory: Arc<I>) -> Self {
        Self {
            inventory,
            subscription_timeout: Self::DEFAULT_SUBSCRIPTION_TIMEOUT,
        }
    }

    pub fn with_subscription_timeout(self, subscription_timeout: Duration) -> Self {
        Self {
            subscription_timeout,
            ..self
        }
    }
}

impl<I> Clone for FleetDiscovery<I> {
    fn clone(&self) -> Self {
        Self {
            inventory: self.inventory.clone(),
            subscription_timeout: self.subscription_timeout,
        }
    }
}

#[async_trait::async_trait]
impl<I: CloudInventory> DiscoverFleet for FleetDiscovery<I> {
    async fn discover_fleet(&self, filter: &FleetFilter) -> Result<Vec<AksClusterInfo>> {
        let subscriptions = self.inventory.list_subscriptions().await?;
        tracing::debug!(count = subscriptions.len(), "Searching subscriptions");

        let (tx, mut rx) = mpsc::channel(subscriptions.len().max(1));
        let mut workers = JoinSet::new();
        let resource_type = format!("{AKS_PROVIDER}/{AKS_TYPE}");
        for sub in subscriptions {
            let tx = tx.clone();
            let inventory = self.inventory.clone();
            let filter = filter.clone();
            let resource_type = resource_type.clone();
            let timeout = self.subscription_timeout;
            let span = info_span!("subscription", id = %sub.id);
            workers.spawn(
                async move {
                    let listed =
                        time::timeout(timeout, inventory.list_resources(&sub.id, &resource_type))
                            .await;
                    let clusters = match listed {
                        Ok(Ok(records)) => records
                            .into_iter()
                            .filter(|r| filter.matches(r))
                            .map(|r| AksClusterInfo {
                                name: r.name,
                                resource_group: r.resource_group,
                                subscription_id: sub.id.clone(),
                                subscription_name: sub.display_name.clone(),
                                location: r.location,
                                state: r.provisioning_state,
                                tags: r.tags,
                            })
                            .collect(),
                        Ok(Err(error)) => {
                            tracing::warn!(%error, "Failed to list clusters");
                            Vec::new()
                        }
                        Err(_) => {
                            tracing::warn!(?timeout, "Timed out listing clusters");
                            Vec::new()
                        }
                    };
                    // The receiver is gone only if discovery was abandoned.
                    let _ = tx.send(clusters).await;
                }
                .instrument(span),
            );
        }
        drop(tx);

        let mut clusters = Vec::new();
        while let Some(batch) = rx.recv().await {
            clusters.extend(batch);
        }
        drop(workers);

        clusters.sort_by(|a, b| {
            (&a.subscription_name, &a.resource_group, &a.name)
                .cmp(&(&b.subscription_name, &b.resource_group, &b.name))
        });
        Ok(clusters)
    }
}
