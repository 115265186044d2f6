use crate::{token::cache::TokenCache, AccessToken, AzureCliCredential, TokenSource};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Deserialize;
use sessiongate_core::{Error, Result};
use std::{path::PathBuf, sync::Arc, time::Duration};

const DEFAULT_AUTHORITY_HOST: &str = "https://login.microsoftonline.com";
const IMDS_ENDPOINT: &str = "http://169.254.169.254/metadata/identity/oauth2/token";
const IMDS_API_VERSION: &str = "2018-02-01";
const CLIENT_ASSERTION_TYPE: &str = "urn:ietf:params:oauth:client-assertion-type:jwt-bearer";

const REFRESH_MARGIN: Duration = Duration::from_secs(5 * 60);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const IMDS_TIMEOUT: Duration = Duration::from_secs(5);

/// Exchanges a projected Kubernetes service account token for an Entra ID
/// token (AKS workload identity).
#[derive(Debug)]
pub struct WorkloadIdentityCredential {
    http: reqwest::Client,
    authority_host: String,
    tenant_id: String,
    client_id: String,
    token_file: PathBuf,
    cache: TokenCache,
}

/// Obtains tokens from the instance metadata service of the node.
#[derive(Debug)]
pub struct ManagedIdentityCredential {
    http: reqwest::Client,
    endpoint: String,
    client_id: Option<String>,
    cache: TokenCache,
}

/// Tries each source in order. The first source to produce a token is used
/// for every later request.
pub struct ChainedCredential {
    sources: Vec<(&'static str, Arc<dyn TokenSource>)>,
    selected: Mutex<Option<usize>>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    /// Entra returns a number, IMDS a string.
    #[serde(default)]
    expires_in: Option<serde_json::Value>,
    #[serde(default)]
    expires_on: Option<serde_json::Value>,
}

/// The credential chain a controller running in a pod uses: workload
/// identity when its environment is projected, then managed identity, then
/// the Azure CLI.
pub fn default_credential() -> Result<Arc<dyn TokenSource>> {
    let lookup = |name: &str| std::env::var(name).ok();
    let mut sources: Vec<(&'static str, Arc<dyn TokenSource>)> = Vec::new();
    if let Some(workload) = WorkloadIdentityCredential::from_vars(lookup)? {
        sources.push(("workload identity", Arc::new(workload)));
    }
    sources.push((
        "managed identity",
        Arc::new(ManagedIdentityCredential::new(IMDS_ENDPOINT, lookup("AZURE_CLIENT_ID"))?),
    ));
    sources.push(("Azure CLI", Arc::new(AzureCliCredential::default())));
    Ok(Arc::new(ChainedCredential::new(sources)))
}

fn http_client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(concat!("sessiongate/", env!("CARGO_PKG_VERSION")))
        .timeout(timeout)
        .build()
        .map_err(|error| Error::fatal("building HTTP client", error))
}

/// Sends a token request and decodes the response.
async fn request_token(req: reqwest::RequestBuilder, what: &str) -> Result<AccessToken> {
    let rsp = req
        .send()
        .await
        .map_err(|error| Error::transient(format!("requesting {what} token"), error))?;
    let status = rsp.status();
    if !status.is_success() {
        let body = rsp.text().await.unwrap_or_default();
        return Err(Error::from_status(
            status.as_u16(),
            format!("{what} token request returned {status}"),
            body,
        ));
    }
    let token: TokenResponse = rsp
        .json()
        .await
        .map_err(|error| Error::fatal(format!("decoding {what} token"), error))?;
    token.into_access_token(Utc::now())
}

// === impl TokenResponse ===

impl TokenResponse {
    fn into_access_token(self, now: DateTime<Utc>) -> Result<AccessToken> {
        fn seconds(value: &serde_json::Value) -> Option<i64> {
            match value {
                serde_json::Value::Number(n) => n.as_i64(),
                serde_json::Value::String(s) => s.parse().ok(),
                _ => None,
            }
        }

        let expires_on = match (
            self.expires_on.as_ref().and_then(seconds),
            self.expires_in.as_ref().and_then(seconds),
        ) {
            (Some(epoch), _) => DateTime::from_timestamp(epoch, 0),
            (None, Some(secs)) => Some(now + chrono::Duration::seconds(secs)),
            (None, None) => None,
        }
        .ok_or_else(|| Error::invalid("token expiry", "token response carries no expiry"))?;
        Ok(AccessToken {
            token: self.access_token,
            expires_on,
        })
    }
}

// === impl WorkloadIdentityCredential ===

impl WorkloadIdentityCredential {
    /// Reads the variables the workload identity webhook projects into the
    /// pod. Returns `None` unless the tenant, client and token file are all
    /// set.
    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Result<Option<Self>> {
        let var = |name: &str| lookup(name).filter(|v| !v.is_empty());
        let (Some(tenant_id), Some(client_id), Some(token_file)) = (
            var("AZURE_TENANT_ID"),
            var("AZURE_CLIENT_ID"),
            var("AZURE_FEDERATED_TOKEN_FILE"),
        ) else {
            return Ok(None);
        };
        let authority_host =
            var("AZURE_AUTHORITY_HOST").unwrap_or_else(|| DEFAULT_AUTHORITY_HOST.to_string());
        Self::new(authority_host, tenant_id, client_id, token_file).map(Some)
    }

    pub fn new(
        authority_host: impl Into<String>,
        tenant_id: impl Into<String>,
        client_id: impl Into<String>,
        token_file: impl Into<PathBuf>,
    ) -> Result<Self> {
        Ok(Self {
            http: http_client(REQUEST_TIMEOUT)?,
            authority_host: authority_host.into().trim_end_matches('/').to_string(),
            tenant_id: tenant_id.into(),
            client_id: client_id.into(),
            token_file: token_file.into(),
            cache: TokenCache::default(),
        })
    }

    async fn fetch(&self, scope: &str) -> Result<AccessToken> {
        // The projected token is rotated by the kubelet, so it is reread on
        // every exchange.
        let assertion = tokio::fs::read_to_string(&self.token_file)
            .await
            .map_err(|error| {
                Error::fatal(
                    format!("reading federated token {}", self.token_file.display()),
                    error,
                )
            })?;
        let url = format!(
            "{}/{}/oauth2/v2.0/token",
            self.authority_host, self.tenant_id
        );
        let req = self.http.post(&url).form(&[
            ("client_assertion", assertion.trim()),
            ("client_assertion_type", CLIENT_ASSERTION_TYPE),
            ("client_id", self.client_id.as_str()),
            ("grant_type", "client_credentials"),
            ("scope", scope),
        ]);
        request_token(req, "workload identity").await
    }
}

#[async_trait::async_trait]
impl TokenSource for WorkloadIdentityCredential {
    async fn token(&self, scope: &str) -> Result<AccessToken> {
        if let Some(token) = self.cache.get(scope, Utc::now(), REFRESH_MARGIN) {
            return Ok(token);
        }
        let token = self.fetch(scope).await?;
        tracing::debug!(scope, expires_on = %token.expires_on, "Exchanged federated token");
        self.cache.put(scope, token.clone());
        Ok(token)
    }
}

// === impl ManagedIdentityCredential ===

impl ManagedIdentityCredential {
    pub fn new(endpoint: impl Into<String>, client_id: Option<String>) -> Result<Self> {
        Ok(Self {
            http: http_client(IMDS_TIMEOUT)?,
            endpoint: endpoint.into(),
            client_id: client_id.filter(|c| !c.is_empty()),
            cache: TokenCache::default(),
        })
    }

    async fn fetch(&self, scope: &str) -> Result<AccessToken> {
        // IMDS takes a resource rather than a v2 scope.
        let resource = scope.trim_end_matches("/.default");
        let mut query = vec![("api-version", IMDS_API_VERSION), ("resource", resource)];
        if let Some(client_id) = self.client_id.as_deref() {
            query.push(("client_id", client_id));
        }
        let req = self
            .http
            .get(&self.endpoint)
            .header("Metadata", "true")
            .query(&query);
        request_token(req, "managed identity").await
    }
}

#[async_trait::async_trait]
impl TokenSource for ManagedIdentityCredential {
    async fn token(&self, scope: &str) -> Result<AccessToken> {
        if let Some(token) = self.cache.get(scope, Utc::now(), REFRESH_MARGIN) {
            return Ok(token);
        }
        let token = self.fetch(scope).await?;
        tracing::debug!(scope, expires_on = %token.expires_on, "Obtained managed identity token");
        self.cache.put(scope, token.clone());
        Ok(token)
    }
}

// === impl ChainedCredential ===

impl ChainedCredential {
    pub fn new(sources: Vec<(&'static str, Arc<dyn TokenSource>)>) -> Self {
        Self {
            sources,
            selected: Mutex::new(None),
        }
    }
}

#[async_trait::async_trait]
impl TokenSource for ChainedCredential {
    async fn token(&self, scope: &str) -> Result<AccessToken> {
        let selected = *self.selected.lock();
        if let Some((_, source)) = selected.and_then(|i| self.sources.get(i)) {
            return source.token(scope).await;
        }

        let mut failures = Vec::with_capacity(self.sources.len());
        for (i, (name, source)) in self.sources.iter().enumerate() {
            match source.token(scope).await {
                Ok(token) => {
                    tracing::info!(credential = %name, "Selected Azure credential");
                    *self.selected.lock() = Some(i);
                    return Ok(token);
                }
                Err(error) => {
                    tracing::debug!(credential = %name, %error, "Azure credential unavailable");
                    failures.push(format!("{name}: {error}"));
                }
            }
        }
        Err(Error::fatal(
            "no Azure credential available",
            failures.join("; "),
        ))
    }
}
