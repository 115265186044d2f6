use crate::{
    breakglass::{SessionArgs, SessionOptions},
    output,
};
use anyhow::{Context, Result};
use sessiongate_azure::{ArmClient, AzureCliCredential, TokenSource, DEFAULT_MANAGEMENT_ENDPOINT};
use sessiongate_core::{DiscoverFleet, FleetFilter, ManagementCluster};
use sessiongate_k8s_credentials::ManagementCredentials;
use sessiongate_k8s_discovery::FleetDiscovery;
use std::sync::Arc;

#[derive(Debug, clap::Subcommand)]
pub enum Command {
    /// Opens a session on an AKS management cluster.
    #[clap(visible_alias = "br")]
    Breakglass(BreakglassArgs),

    /// Lists management clusters across all subscriptions.
    #[clap(visible_alias = "ls")]
    List(ListArgs),
}

#[derive(Clone, Debug, clap::Args)]
pub struct AzureArgs {
    #[clap(long, default_value = DEFAULT_MANAGEMENT_ENDPOINT, env = "AZURE_MANAGEMENT_ENDPOINT")]
    azure_management_endpoint: String,
}

#[derive(Debug, clap::Args)]
pub struct BreakglassArgs {
    /// The AKS cluster name or resource id.
    #[clap(value_name = "AKS_NAME")]
    cluster: String,

    /// Only consider clusters in this region.
    #[clap(long)]
    region: Option<String>,

    #[clap(flatten)]
    session: SessionArgs,

    #[clap(flatten)]
    azure: AzureArgs,
}

#[derive(Debug, clap::Args)]
pub struct ListArgs {
    #[clap(long)]
    region: Option<String>,

    #[clap(long, short = 'o', value_enum, default_value = "table")]
    output: output::Format,

    #[clap(flatten)]
    azure: AzureArgs,
}

#[derive(Debug)]
struct ValidatedBreakglass {
    cluster: ManagementCluster,
    region: Option<String>,
    session: SessionOptions,
    azure_management_endpoint: String,
}

// === impl Command ===

impl Command {
    pub async fn run(self) -> Result<()> {
        match self {
            Self::Breakglass(args) => args.validate()?.run().await,
            Self::List(args) => args.run().await,
        }
    }
}

// === impl AzureArgs ===

impl AzureArgs {
    fn credentials(&self) -> Result<(ArmClient, Arc<dyn TokenSource>)> {
        let tokens: Arc<dyn TokenSource> = Arc::new(AzureCliCredential::default());
        let arm = ArmClient::new(self.azure_management_endpoint.clone(), tokens.clone())
            .context("creating Azure Resource Manager client")?;
        Ok((arm, tokens))
    }
}

// === impl BreakglassArgs ===

impl BreakglassArgs {
    fn validate(self) -> Result<ValidatedBreakglass> {
        let cluster = self
            .cluster
            .parse::<ManagementCluster>()
            .with_context(|| format!("invalid management cluster {:?}", self.cluster))?;
        Ok(ValidatedBreakglass {
            cluster,
            region: self.region.filter(|r| !r.is_empty()),
            session: self.session.validate()?,
            azure_management_endpoint: self.azure.azure_management_endpoint,
        })
    }
}

impl ValidatedBreakglass {
    async fn run(self) -> Result<()> {
        let azure = AzureArgs {
            azure_management_endpoint: self.azure_management_endpoint,
        };
        let (arm, tokens) = azure.credentials()?;
        let fleet = Arc::new(FleetDiscovery::new(Arc::new(arm.clone())));
        let management = ManagementCredentials::new(arm, tokens, fleet);

        let resource = management
            .resolve(&self.cluster, self.region)
            .await
            .with_context(|| format!("finding management cluster {}", self.cluster))?;
        tracing::info!(cluster = %resource, "Resolved management cluster");
        let credential = management
            .credential(&resource)
            .await
            .with_context(|| format!("obtaining credentials for {}", resource.name()))?;

        let name = resource.name().to_string();
        self.session
            .start(&credential, &name, &format!("{name}-breakglass"))
            .await
    }
}

// === impl ListArgs ===

impl ListArgs {
    async fn run(self) -> Result<()> {
        let (arm, _) = self.azure.credentials()?;
        let fleet = FleetDiscovery::new(Arc::new(arm));
        let filter = FleetFilter::management_clusters().with_region(self.region.filter(|r| !r.is_empty()));
        let mut clusters = fleet
            .discover_fleet(&filter)
            .await
            .context("listing management clusters")?;
        clusters.sort_by(|a, b| (&a.location, &a.name).cmp(&(&b.location, &b.name)));
        output::write(&mut std::io::stdout().lock(), self.output, &clusters)
    }
}
