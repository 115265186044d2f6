use crate::{
    controller::{self, KubeSessionStore, ReconcileMetrics, Reconciler},
    core::SystemClock,
    k8s::{Api, Session},
    lease,
    registry::{Registry as SessionTable, RegistryMetrics},
    ControllerArgs,
};
use anyhow::{bail, Context, Result};
use clap::Parser;
use futures::future;
use prometheus_client::registry::Registry;
use sessiongate_azure::ArmClient;
use sessiongate_k8s_credentials::{ClusterCredentials, ManagementCredentials};
use sessiongate_k8s_discovery::FleetDiscovery;
use sessiongate_server::{Proxy, ProxyMetrics};
use std::sync::Arc;
use tracing::{info_span, Instrument};

#[derive(Debug, Parser)]
#[clap(name = "sessiongate", about = "Gates time-limited breakglass sessions")]
pub struct Args {
    #[clap(long, default_value = "sessiongate=info,warn", env = "SESSIONGATE_LOG")]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    #[clap(flatten)]
    controller: ControllerArgs,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            log_level,
            log_format,
            client,
            admin,
            controller,
        } = self;
        let config = controller.validate()?;

        let mut prom = <Registry>::default();
        let registry_metrics =
            RegistryMetrics::register(prom.sub_registry_with_prefix("sessiongate_registry"));
        let reconcile_metrics =
            ReconcileMetrics::register(prom.sub_registry_with_prefix("sessiongate_controller"));
        let proxy_metrics =
            ProxyMetrics::register(prom.sub_registry_with_prefix("sessiongate_kas_proxy"));
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .build()
            .await?;

        // Only the lease holder reconciles; losing the lease ends the process
        // so that a restart contends for it again.
        let lease_lost = match &config.leader {
            Some(leader) => {
                let hostname = std::env::var("HOSTNAME")
                    .context("HOSTNAME must be set when leader election is enabled")?;
                let mut claims =
                    lease::init(runtime.client(), &config.namespace, leader, &hostname).await?;
                tracing::info!(lease = %leader.lease_name, "Waiting for leadership");
                lease::acquired(&mut claims, &hostname).await?;
                tracing::info!(lease = %leader.lease_name, "Acquired leadership");
                future::Either::Left(lease::lost(claims, hostname))
            }
            None => future::Either::Right(future::pending()),
        };

        let tokens = sessiongate_azure::default_credential()?;
        let arm = ArmClient::new(config.azure_management_endpoint.clone(), tokens.clone())?;
        let fleet = Arc::new(FleetDiscovery::new(Arc::new(arm.clone())));
        let credentials = ClusterCredentials::new(ManagementCredentials::new(arm, tokens, fleet));

        let sessions = SessionTable::shared(config.ingress_base_url.clone(), registry_metrics);
        let reconciler = Reconciler::new(
            KubeSessionStore::new(runtime.client()),
            sessions.clone(),
            Arc::new(credentials),
            Arc::new(SystemClock),
            config.poll,
            reconcile_metrics,
        );
        tokio::spawn(
            controller::run(
                Api::<Session>::namespaced(runtime.client(), &config.namespace),
                Arc::new(reconciler),
                config.workers,
                runtime.shutdown_handle(),
            )
            .instrument(info_span!("sessions", ns = %config.namespace)),
        );

        let listener = tokio::net::TcpListener::bind(config.bind_address)
            .await
            .with_context(|| format!("failed to bind {}", config.bind_address))?;
        tokio::spawn(
            sessiongate_server::serve(
                listener,
                Proxy::new(sessions, Arc::new(SystemClock), proxy_metrics),
                runtime.shutdown_handle(),
            )
            .instrument(info_span!("server", addr = %config.bind_address)),
        );

        // Block the main thread on the shutdown signal. Once it fires, wait for the background tasks to
        // complete before exiting.
        tokio::select! {
            res = runtime.run() => {
                if res.is_err() {
                    bail!("Aborted");
                }
            }
            () = lease_lost => bail!("Lost leadership"),
        }

        Ok(())
    }
}
