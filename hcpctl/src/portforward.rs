//! Reaches a hosted control plane's API server through the management
//! cluster by forwarding a local port to one of its pods.

use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::{Pod, Service};
use kube::{
    api::{Api, ListParams},
    ResourceExt,
};
use std::net::Ipv4Addr;
use tokio::{
    net::{TcpListener, TcpStream},
    task::JoinHandle,
};
use tracing::Instrument;

pub const KAS_SERVICE: &str = "kube-apiserver";
pub const KAS_PORT: u16 = 6443;

/// A local listener whose connections are tunneled to the API server. The
/// tunnel closes when this is dropped.
#[derive(Debug)]
pub struct PortForward {
    port: u16,
    task: JoinHandle<()>,
}

/// The kubeconfig server for an API server reached through a local port.
pub fn local_endpoint(port: u16) -> String {
    format!("https://{}:{port}", Ipv4Addr::LOCALHOST)
}

// === impl PortForward ===

impl PortForward {
    /// Binds a free local port and forwards each connection to a ready pod
    /// backing the control plane's API server service.
    pub async fn start(client: kube::Client, namespace: &str) -> Result<Self> {
        let pod = ready_backend(&client, namespace, KAS_SERVICE).await?;
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .await
            .context("binding a local port")?;
        let port = listener.local_addr()?.port();
        tracing::info!(%namespace, %pod, port, "Forwarding to the API server");

        let pods = Api::<Pod>::namespaced(client, namespace);
        let task = tokio::spawn(
            accept(listener, pods, pod.clone())
                .instrument(tracing::debug_span!("portforward", %pod)),
        );
        Ok(Self { port, task })
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for PortForward {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn accept(listener: TcpListener, pods: Api<Pod>, pod: String) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(error) => {
                tracing::warn!(%error, "Failed to accept connection");
                continue;
            }
        };
        let pods = pods.clone();
        let pod = pod.clone();
        tokio::spawn(async move {
            if let Err(error) = forward(stream, &pods, &pod).await {
                tracing::debug!(%peer, error = %format!("{error:#}"), "Forwarded connection failed");
            }
        });
    }
}

async fn forward(mut stream: TcpStream, pods: &Api<Pod>, pod: &str) -> Result<()> {
    let mut forwarder = pods
        .portforward(pod, &[KAS_PORT])
        .await
        .with_context(|| format!("forwarding to {pod}:{KAS_PORT}"))?;
    let mut upstream = forwarder
        .take_stream(KAS_PORT)
        .with_context(|| format!("no stream for port {KAS_PORT}"))?;
    let (sent, received) = tokio::io::copy_bidirectional(&mut stream, &mut upstream).await?;
    tracing::trace!(sent, received, "Connection closed");
    drop(upstream);
    forwarder.join().await?;
    Ok(())
}

/// Picks the first running, ready pod selected by `service`, as `kubectl
/// port-forward service/...` does.
async fn ready_backend(client: &kube::Client, namespace: &str, service: &str) -> Result<String> {
    let svc = Api::<Service>::namespaced(client.clone(), namespace)
        .get(service)
        .await
        .with_context(|| format!("getting service {namespace}/{service}"))?;
    let selector = svc
        .spec
        .and_then(|spec| spec.selector)
        .filter(|selector| !selector.is_empty())
        .with_context(|| format!("service {namespace}/{service} has no selector"))?;
    let labels = selector
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",");

    let pods = Api::<Pod>::namespaced(client.clone(), namespace)
        .list(&ListParams::default().labels(&labels))
        .await
        .with_context(|| format!("listing pods for service {namespace}/{service}"))?;
    pods.items
        .iter()
        .find(|pod| is_ready(pod))
        .map(|pod| pod.name_any())
        .with_context(|| format!("no running and ready pods back {namespace}/{service}"))
}

fn is_ready(pod: &Pod) -> bool {
    let Some(status) = &pod.status else {
        return false;
    };
    status.phase.as_deref() == Some("Running")
        && status
            .conditions
            .iter()
            .flatten()
            .filter(|c| c.type_ == "Ready")
            .all(|c| c.status == "True")
}
