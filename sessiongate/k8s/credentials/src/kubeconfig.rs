//! Conversions between credentials and kubeconfig documents.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use kube::config::{KubeConfigOptions, Kubeconfig};
use serde_json::json;
use sessiongate_core::{AuthMaterial, Credential, Error, Result};

/// The server and trust anchor of a cluster entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterEndpoint {
    pub server: String,
    /// PEM-encoded CA bundle.
    pub ca_pem: Option<String>,
}

/// Renders a credential as a kubeconfig with a single cluster, user and
/// context, all called `name`.
pub fn document(credential: &Credential, name: &str) -> serde_json::Value {
    let mut cluster = json!({ "server": credential.endpoint });
    if let Some(ca) = &credential.ca_data {
        cluster["certificate-authority-data"] = json!(BASE64.encode(ca));
    }
    let user = match &credential.auth {
        AuthMaterial::Bearer(token) => json!({ "token": token }),
        AuthMaterial::ClientCertificate { certificate, key } => json!({
            "client-certificate-data": BASE64.encode(certificate),
            "client-key-data": BASE64.encode(key),
        }),
    };
    json!({
        "apiVersion": "v1",
        "kind": "Config",
        "clusters": [{ "name": name, "cluster": cluster }],
        "users": [{ "name": name, "user": user }],
        "contexts": [{ "name": name, "context": { "cluster": name, "user": name } }],
        "current-context": name,
    })
}

pub fn to_yaml(credential: &Credential, name: &str) -> Result<String> {
    serde_yaml::to_string(&document(credential, name))
        .map_err(|error| Error::fatal("rendering kubeconfig", error))
}

/// Builds a Kubernetes client that authenticates with `credential`.
pub async fn client(credential: &Credential) -> Result<kube::Client> {
    let kubeconfig: Kubeconfig = serde_json::from_value(document(credential, "session"))
        .map_err(|error| Error::fatal("building kubeconfig", error))?;
    let config = kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|error| Error::fatal("loading kubeconfig", error))?;
    kube::Client::try_from(config)
        .map_err(|error| Error::fatal(format!("creating client for {}", credential.endpoint), error))
}

/// Extracts the first cluster entry of a kubeconfig document.
pub fn cluster_endpoint(yaml: &[u8]) -> Result<ClusterEndpoint> {
    let text = std::str::from_utf8(yaml).map_err(|error| Error::fatal("reading kubeconfig", error))?;
    let kubeconfig =
        Kubeconfig::from_yaml(text).map_err(|error| Error::fatal("parsing kubeconfig", error))?;
    let cluster = kubeconfig
        .clusters
        .into_iter()
        .find_map(|c| c.cluster)
        .ok_or_else(|| Error::invalid("kubeconfig", "no cluster entry"))?;
    let server = cluster
        .server
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::invalid("kubeconfig", "cluster has no server"))?;
    let ca_pem = cluster
        .certificate_authority_data
        .map(|data| {
            let pem = BASE64
                .decode(data.trim())
                .map_err(|error| Error::fatal("decoding certificate authority", error))?;
            String::from_utf8(pem).map_err(|error| Error::fatal("decoding certificate authority", error))
        })
        .transpose()?;
    Ok(ClusterEndpoint { server, ca_pem })
}
