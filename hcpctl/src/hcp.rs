use crate::{
    breakglass::{sanitize_username, SessionArgs, SessionOptions, Then},
    crdump, output,
    portforward::{self, PortForward},
};
use anyhow::{bail, Context, Result};
use k8s_openapi::api::authentication::v1::SelfSubjectReview;
use kube::api::{Api, PostParams};
use sessiongate_core::{
    poll_until_ready, AccessRequest, ClusterIdentifier, ClusterInfo, Credential, DiscoverClusters,
    PollConfig, Privilege,
};
use sessiongate_k8s_api::GoDuration;
use sessiongate_k8s_credentials::CsrMinter;
use sessiongate_k8s_discovery::HostedClusterDiscovery;
use std::{path::PathBuf, time::Duration};

const CSR_POLL_INTERVAL: Duration = Duration::from_secs(1);
const CSR_TIMEOUT: Duration = Duration::from_secs(15);

/// Hosted control plane commands run against the management cluster of the
/// current kubeconfig context.
#[derive(Debug, clap::Subcommand)]
pub enum Command {
    /// Obtains a breakglass certificate for a hosted control plane.
    #[clap(visible_alias = "br")]
    Breakglass(BreakglassArgs),

    /// Lists the hosted clusters on the management cluster.
    #[clap(visible_alias = "ls")]
    List(ListArgs),

    /// Writes the custom resources of a hosted cluster to disk.
    DumpCrs(DumpCrsArgs),
}

#[derive(Debug, clap::Args)]
pub struct BreakglassArgs {
    /// The cluster id or the hosted cluster's resource id.
    #[clap(value_name = "CLUSTER")]
    cluster: String,

    /// How long the issued certificate is valid.
    #[clap(long, default_value = "24h")]
    session_timeout: GoDuration,

    /// Request cluster-admin rather than read-mostly access.
    #[clap(long)]
    privileged: bool,

    /// Write a kubeconfig for the API server's in-cluster port and exit
    /// instead of forwarding a local port to it.
    #[clap(long)]
    no_port_forward: bool,

    #[clap(flatten)]
    session: SessionArgs,
}

#[derive(Debug, clap::Args)]
pub struct ListArgs {
    #[clap(long, short = 'o', value_enum, default_value = "table")]
    output: output::Format,
}

#[derive(Debug, clap::Args)]
pub struct DumpCrsArgs {
    #[clap(value_name = "CLUSTER")]
    cluster: String,

    /// Directory the resources are written under.
    #[clap(long, short = 'o')]
    output: PathBuf,
}

#[derive(Debug)]
struct ValidatedBreakglass {
    cluster: ClusterIdentifier,
    ttl: Duration,
    privilege: Privilege,
    port_forward: bool,
    session: SessionOptions,
}

/// A breakglass request bound to a caller and a discovered cluster.
struct CompletedBreakglass {
    client: kube::Client,
    cluster: ClusterInfo,
    request: AccessRequest,
    port_forward: bool,
    session: SessionOptions,
}

// === impl Command ===

impl Command {
    pub async fn run(self) -> Result<()> {
        match self {
            Self::Breakglass(args) => {
                let validated = args.validate()?;
                let client = management_client().await?;
                validated.complete(client).await?.run().await
            }
            Self::List(args) => args.run(management_client().await?).await,
            Self::DumpCrs(args) => args.run(management_client().await?).await,
        }
    }
}

async fn management_client() -> Result<kube::Client> {
    kube::Client::try_default()
        .await
        .context("connecting to the management cluster from the current kubeconfig context")
}

async fn discover(client: &kube::Client, cluster: &ClusterIdentifier) -> Result<ClusterInfo> {
    let info = HostedClusterDiscovery::new(client.clone())
        .discover(cluster)
        .await
        .with_context(|| format!("finding hosted cluster {cluster}"))?;
    tracing::info!(cluster = %info.id, namespace = %info.namespace(), "Found hosted cluster");
    Ok(info)
}

fn parse_cluster(cluster: &str) -> Result<ClusterIdentifier> {
    cluster
        .parse()
        .with_context(|| format!("invalid cluster {cluster:?}"))
}

/// The caller's user name as the management cluster authenticates it.
async fn principal(client: &kube::Client) -> Result<String> {
    let review = Api::<SelfSubjectReview>::all(client.clone())
        .create(&PostParams::default(), &SelfSubjectReview::default())
        .await
        .context("reviewing the current user")?;
    let username = review
        .status
        .and_then(|s| s.user_info)
        .and_then(|u| u.username)
        .unwrap_or_default();
    tracing::debug!(%username, "Authenticated");
    sanitize_username(&username)
}

/// Points `credential` at the API server as reached from this machine.
fn through_local_port(mut credential: Credential, port: u16) -> Credential {
    credential.endpoint = portforward::local_endpoint(port);
    credential
}

fn csr_name(cluster_id: &str, principal: &str, timestamp: i64) -> String {
    format!("sre-breakglass-{cluster_id}-{principal}-{timestamp}")
}

// === impl BreakglassArgs ===

impl BreakglassArgs {
    fn validate(self) -> Result<ValidatedBreakglass> {
        let ttl = self.session_timeout.as_duration();
        AccessRequest::validate_ttl(ttl).context("invalid --session-timeout")?;
        let mut session = self.session.validate()?;
        let port_forward = !self.no_port_forward;
        if !port_forward {
            // Without a forwarded port nothing local can reach the server.
            match session.then {
                Then::Exec(_) => bail!("--exec requires port forwarding"),
                Then::Shell | Then::Exit => session.then = Then::Exit,
            }
        }
        Ok(ValidatedBreakglass {
            cluster: parse_cluster(&self.cluster)?,
            ttl,
            privilege: self.privileged.into(),
            port_forward,
            session,
        })
    }
}

impl ValidatedBreakglass {
    async fn complete(self, client: kube::Client) -> Result<CompletedBreakglass> {
        let principal = principal(&client).await?;
        let cluster = discover(&client, &self.cluster).await?;
        let name = csr_name(&cluster.id, &principal, chrono::Utc::now().timestamp());
        let request =
            AccessRequest::new(principal, "", self.privilege, self.ttl)?.with_name(name);
        Ok(CompletedBreakglass {
            client,
            cluster,
            request,
            port_forward: self.port_forward,
            session: self.session,
        })
    }
}

impl CompletedBreakglass {
    async fn run(self) -> Result<()> {
        let Self {
            client,
            cluster,
            request,
            port_forward,
            session,
        } = self;
        let minter = CsrMinter::default();
        let poll = PollConfig::new(CSR_POLL_INTERVAL, CSR_TIMEOUT);
        tracing::info!(
            cluster = %cluster.id,
            principal = %request.principal(),
            group = %request.organization(),
            ttl = ?request.ttl(),
            "Requesting breakglass certificate"
        );
        let minted = tokio::select! {
            res = poll_until_ready("breakglass certificate", &poll, || {
                minter.mint(&client, &cluster, &request)
            }) => res.context("obtaining breakglass certificate"),
            res = tokio::signal::ctrl_c() => match res {
                Ok(()) => Err(anyhow::anyhow!("Interrupted")),
                Err(error) => Err(error).context("listening for Ctrl-C"),
            },
        };

        // The certificate stays valid after its request is gone.
        let name = request.name().unwrap_or_default();
        if let Err(error) = minter.revoke(&client, &cluster, name).await {
            tracing::warn!(csr = %name, %error, "Failed to clean up signing request");
        }

        let minted = minted?;
        // Held until the session ends.
        let forward = if port_forward {
            Some(PortForward::start(client.clone(), &cluster.namespace()).await?)
        } else {
            None
        };
        let port = forward
            .as_ref()
            .map_or(portforward::KAS_PORT, PortForward::port);
        let credential = through_local_port(minted, port);
        session
            .start(
                &credential,
                &cluster.name,
                &format!("hcp-breakglass-{}", cluster.id),
            )
            .await
    }
}

// === impl ListArgs ===

impl ListArgs {
    async fn run(self, client: kube::Client) -> Result<()> {
        let mut clusters = HostedClusterDiscovery::new(client)
            .list_all()
            .await
            .context("listing hosted clusters")?;
        clusters.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        let rows = clusters
            .into_iter()
            .map(output::HostedClusterRow::from)
            .collect::<Vec<_>>();
        output::write(&mut std::io::stdout().lock(), self.output, &rows)
    }
}

// === impl DumpCrsArgs ===

impl DumpCrsArgs {
    async fn run(self, client: kube::Client) -> Result<()> {
        let cluster = discover(&client, &parse_cluster(&self.cluster)?).await?;
        let dir = crdump::dump(&client, &cluster, &self.output).await?;
        println!("{}", dir.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    const CLUSTER_ID: &str = "2jesjug41iavg27inj078ssjidn20clk";

    #[derive(Debug, Parser)]
    struct Cmd {
        #[clap(subcommand)]
        command: Command,
    }

    fn breakglass(args: &[&str]) -> Result<ValidatedBreakglass> {
        let argv = ["hcpctl", "breakglass"].into_iter().chain(args.iter().copied());
        match Cmd::try_parse_from(argv)?.command {
            Command::Breakglass(args) => args.validate(),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn breakglass_defaults() {
        let validated = breakglass(&[CLUSTER_ID]).unwrap();
        assert_eq!(
            validated.cluster,
            ClusterIdentifier::Id(CLUSTER_ID.parse().unwrap())
        );
        assert_eq!(validated.ttl, Duration::from_secs(24 * 60 * 60));
        assert_eq!(validated.privilege, Privilege::Unprivileged);
        assert!(validated.port_forward);
        assert_eq!(validated.session.then, Then::Shell);
    }

    #[rstest]
    #[case::shell(&[], Then::Exit)]
    #[case::no_shell(&["--no-shell"], Then::Exit)]
    fn breakglass_without_port_forward_writes_and_exits(
        #[case] extra: &[&str],
        #[case] expected: Then,
    ) {
        let args = [CLUSTER_ID, "--no-port-forward"]
            .into_iter()
            .chain(extra.iter().copied())
            .collect::<Vec<_>>();
        let validated = breakglass(&args).unwrap();
        assert!(!validated.port_forward);
        assert_eq!(validated.session.then, expected);
    }

    #[test]
    fn kubeconfig_targets_the_local_port() {
        use chrono::{TimeZone, Utc};
        use sessiongate_core::AuthMaterial;
        use sessiongate_k8s_credentials::kubeconfig;

        let minted = Credential {
            endpoint: "https://api.prod.example.com:443".to_string(),
            ca_data: None,
            auth: AuthMaterial::Bearer("token".to_string()),
            not_before: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
            not_after: Utc.with_ymd_and_hms(2025, 1, 2, 0, 0, 0).unwrap(),
        };
        for (port, server) in [
            (41234, "https://127.0.0.1:41234"),
            (portforward::KAS_PORT, "https://127.0.0.1:6443"),
        ] {
            let credential = through_local_port(minted.clone(), port);
            assert_eq!(credential.endpoint, server);
            let yaml = kubeconfig::to_yaml(&credential, "prod").unwrap();
            assert!(yaml.contains(&format!("server: {server}")), "{yaml}");
        }
    }

    #[test]
    fn breakglass_by_resource_id() {
        let validated = breakglass(&[
            "/subscriptions/sub-1/resourceGroups/rg/providers/Microsoft.RedHatOpenShift/hcpOpenShiftClusters/demo",
            "--privileged",
            "--session-timeout=90m",
            "--exec=kubectl get nodes",
        ])
        .unwrap();
        assert!(matches!(validated.cluster, ClusterIdentifier::Resource(_)));
        assert_eq!(validated.ttl, Duration::from_secs(90 * 60));
        assert_eq!(validated.privilege, Privilege::Privileged);
        assert_eq!(
            validated.session.then,
            Then::Exec("kubectl get nodes".to_string())
        );
    }

    #[rstest]
    #[case::short_timeout(&[CLUSTER_ID, "--session-timeout=30s"])]
    #[case::long_timeout(&[CLUSTER_ID, "--session-timeout=721h"])]
    #[case::bad_timeout(&[CLUSTER_ID, "--session-timeout=tomorrow"])]
    #[case::bad_cluster(&["demo"])]
    #[case::exclusive(&[CLUSTER_ID, "--exec=ls", "--no-shell"])]
    #[case::exec_needs_forwarding(&[CLUSTER_ID, "--exec=ls", "--no-port-forward"])]
    fn breakglass_rejects(#[case] args: &[&str]) {
        assert!(breakglass(args).is_err(), "{args:?}");
    }

    #[test]
    fn csr_names_are_unique_per_caller_and_time() {
        assert_eq!(
            csr_name(CLUSTER_ID, "alice", 1_700_000_000),
            format!("sre-breakglass-{CLUSTER_ID}-alice-1700000000")
        );
        assert_ne!(
            csr_name(CLUSTER_ID, "alice", 1),
            csr_name(CLUSTER_ID, "bob", 1)
        );
    }

    #[test]
    fn dump_crs_requires_output() {
        assert!(Cmd::try_parse_from(["hcpctl", "dump-crs", CLUSTER_ID]).is_err());
        let cmd = Cmd::try_parse_from(["hcpctl", "dump-crs", CLUSTER_ID, "-o", "/tmp/dump"]).unwrap();
        let Command::DumpCrs(args) = cmd.command else {
            panic!("expected dump-crs");
        };
        assert_eq!(args.output, PathBuf::from("/tmp/dump"));
    }
}
