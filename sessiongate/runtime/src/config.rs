use anyhow::{bail, ensure, Result};
use sessiongate_azure::DEFAULT_MANAGEMENT_ENDPOINT;
use sessiongate_core::PollConfig;
use sessiongate_k8s_api::GoDuration;
use std::{net::SocketAddr, time::Duration};

/// Session controller flags.
#[derive(Clone, Debug, clap::Args)]
pub struct ControllerArgs {
    /// The namespace the controller runs in and watches for sessions.
    #[clap(long, env = "POD_NAMESPACE")]
    namespace: String,

    /// Base URL under which session endpoints are published.
    #[clap(long)]
    ingress_base_url: String,

    /// The number of sessions reconciled concurrently.
    #[clap(long, default_value = "5")]
    workers: u16,

    /// How often a pending credential is checked.
    #[clap(long, default_value = "2s")]
    credential_check_interval: GoDuration,

    /// How long a single reconcile waits for a credential.
    #[clap(long, default_value = "15s")]
    credential_timeout: GoDuration,

    #[clap(long)]
    leader_election: bool,

    #[clap(long, default_value = "sessiongate-controller")]
    lease_name: String,

    #[clap(long, default_value = "15s")]
    lease_duration: GoDuration,

    #[clap(long, default_value = "2s")]
    lease_renew_grace_period: GoDuration,

    #[clap(long, default_value = DEFAULT_MANAGEMENT_ENDPOINT)]
    azure_management_endpoint: String,

    /// Address on which session endpoints are served.
    #[clap(long, default_value = "0.0.0.0:8080")]
    bind_address: SocketAddr,
}

/// Validated controller configuration, built once at startup.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControllerConfig {
    pub namespace: String,
    pub ingress_base_url: String,
    pub workers: u16,
    pub poll: PollConfig,
    pub leader: Option<LeaderConfig>,
    pub azure_management_endpoint: String,
    pub bind_address: SocketAddr,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LeaderConfig {
    pub lease_name: String,
    pub lease_duration: Duration,
    pub renew_grace_period: Duration,
}

fn require_http_url(flag: &str, url: &str) -> Result<()> {
    let Some((scheme, rest)) = url.split_once("://") else {
        bail!("--{flag} must be an absolute URL, got {url:?}");
    };
    ensure!(
        matches!(scheme, "http" | "https") && !rest.is_empty(),
        "--{flag} must be an http or https URL, got {url:?}"
    );
    Ok(())
}

// === impl ControllerArgs ===

impl ControllerArgs {
    pub fn validate(self) -> Result<ControllerConfig> {
        let Self {
            namespace,
            ingress_base_url,
            workers,
            credential_check_interval,
            credential_timeout,
            leader_election,
            lease_name,
            lease_duration,
            lease_renew_grace_period,
            azure_management_endpoint,
            bind_address,
        } = self;

        ensure!(!namespace.is_empty(), "--namespace must be set");
        ensure!(workers > 0, "--workers must be at least 1");
        require_http_url("ingress-base-url", &ingress_base_url)?;
        require_http_url("azure-management-endpoint", &azure_management_endpoint)?;

        let credential_timeout = credential_timeout.as_duration();
        ensure!(
            !credential_timeout.is_zero(),
            "--credential-timeout must be positive"
        );
        let poll = PollConfig::new(credential_check_interval.as_duration(), credential_timeout);

        let leader = if leader_election {
            let lease_duration = lease_duration.as_duration();
            let renew_grace_period = lease_renew_grace_period.as_duration();
            ensure!(!lease_name.is_empty(), "--lease-name must be set");
            ensure!(
                renew_grace_period < lease_duration,
                "--lease-renew-grace-period must be shorter than --lease-duration"
            );
            Some(LeaderConfig {
                lease_name,
                lease_duration,
                renew_grace_period,
            })
        } else {
            None
        };

        Ok(ControllerConfig {
            namespace,
            ingress_base_url,
            workers,
            poll,
            leader,
            azure_management_endpoint,
            bind_address,
        })
    }
}
