use crate::TokenSource;
use base64::Engine;
use serde::{de::DeserializeOwned, Deserialize};
use sessiongate_core::{
    identifier::{AKS_PROVIDER, AKS_TYPE},
    CloudInventory, Error, InventoryRecord, ResourceRef, Result, Subscription,
};
use std::{collections::BTreeMap, sync::Arc, time::Duration};

const ARM_SCOPE: &str = "https://management.azure.com/.default";
const SUBSCRIPTIONS_API_VERSION: &str = "2022-12-01";
const RESOURCES_API_VERSION: &str = "2021-04-01";
const AKS_API_VERSION: &str = "2024-09-01";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// A minimal Azure Resource Manager REST client.
#[derive(Clone)]
pub struct ArmClient {
    http: reqwest::Client,
    endpoint: String,
    tokens: Arc<dyn TokenSource>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Page<T> {
    #[serde(default = "Vec::new")]
    value: Vec<T>,
    #[serde(default)]
    next_link: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubscriptionJson {
    subscription_id: String,
    #[serde(default)]
    display_name: String,
    #[serde(default)]
    state: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResourceJson {
    id: String,
    name: String,
    #[serde(default)]
    location: String,
    #[serde(default)]
    provisioning_state: Option<String>,
    #[serde(default)]
    tags: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Deserialize)]
struct CredentialResults {
    #[serde(default)]
    kubeconfigs: Vec<CredentialResult>,
}

#[derive(Debug, Deserialize)]
struct CredentialResult {
    name: String,
    value: String,
}

// === impl ArmClient ===

impl ArmClient {
    pub fn new(endpoint: impl Into<String>, tokens: Arc<dyn TokenSource>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("sessiongate/", env!("CARGO_PKG_VERSION")))
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|error| Error::fatal("building HTTP client", error))?;
        Ok(Self {
            http,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            tokens,
        })
    }

    /// Fetches the AKS user kubeconfig for a managed cluster.
    pub async fn cluster_user_kubeconfig(&self, cluster: &ResourceRef) -> Result<Vec<u8>> {
        if !cluster.is_type(AKS_PROVIDER, AKS_TYPE) {
            return Err(Error::invalid(
                "management cluster",
                format!("{cluster} is not an AKS managed cluster"),
            ));
        }
        let url = format!("{}{cluster}/listClusterUserCredential", self.endpoint);
        let req = self
            .http
            .post(&url)
            .query(&[("api-version", AKS_API_VERSION)])
            .header(reqwest::header::CONTENT_LENGTH, 0);
        let results: CredentialResults = self.send(req, &url).await?;

        let kubeconfig = results
            .kubeconfigs
            .into_iter()
            .next()
            .ok_or_else(|| Error::not_found(format!("user kubeconfig for {}", cluster.name())))?;
        tracing::debug!(cluster = %cluster.name(), name = %kubeconfig.name, "Fetched user kubeconfig");
        base64::engine::general_purpose::STANDARD
            .decode(kubeconfig.value)
            .map_err(|error| Error::fatal("decoding user kubeconfig", error))
    }

    async fn send<T: DeserializeOwned>(&self, req: reqwest::RequestBuilder, what: &str) -> Result<T> {
        let token = self.tokens.token(ARM_SCOPE).await?;
        let rsp = req
            .bearer_auth(&token.token)
            .send()
            .await
            .map_err(|error| Error::transient(format!("requesting {what}"), error))?;

        let status = rsp.status();
        if !status.is_success() {
            let body = rsp.text().await.unwrap_or_default();
            return Err(Error::from_status(
                status.as_u16(),
                format!("{what} returned {status}"),
                body,
            ));
        }
        rsp.json()
            .await
            .map_err(|error| Error::transient(format!("decoding {what}"), error))
    }

    /// Follows `nextLink` until every page has been read.
    async fn get_all<T: DeserializeOwned>(&self, path: &str, query: &[(&str, &str)]) -> Result<Vec<T>> {
        let url = format!("{}{path}", self.endpoint);
        let mut page: Page<T> = self.send(self.http.get(&url).query(query), &url).await?;
        let mut items = std::mem::take(&mut page.value);
        while let Some(next) = page.next_link.take() {
            page = self.send(self.http.get(&next), &url).await?;
            items.append(&mut page.value);
        }
        Ok(items)
    }
}

#[async_trait::async_trait]
impl CloudInventory for ArmClient {
    async fn list_subscriptions(&self) -> Result<Vec<Subscription>> {
        let subs: Vec<SubscriptionJson> = self
            .get_all("/subscriptions", &[("api-version", SUBSCRIPTIONS_API_VERSION)])
            .await?;
        Ok(subs
            .into_iter()
            .filter(|s| s.state.as_deref().map_or(true, |s| s.eq_ignore_ascii_case("Enabled")))
            .map(|s| Subscription {
                id: s.subscription_id,
                display_name: s.display_name,
            })
            .collect())
    }

    async fn list_resources(
        &self,
        subscription_id: &str,
        resource_type: &str,
    ) -> Result<Vec<InventoryRecord>> {
        let filter = format!("resourceType eq '{resource_type}'");
        let resources: Vec<ResourceJson> = self
            .get_all(
                &format!("/subscriptions/{subscription_id}/resources"),
                &[
                    ("api-version", RESOURCES_API_VERSION),
                    ("$filter", &filter),
                    ("$expand", "provisioningState"),
                ],
            )
            .await?;
        Ok(resources.into_iter().filter_map(into_record).collect())
    }
}

fn into_record(r: ResourceJson) -> Option<InventoryRecord> {
    let resource_group = match r.id.parse::<ResourceRef>() {
        Ok(id) => id.resource_group().to_string(),
        Err(error) => {
            tracing::debug!(id = %r.id, %error, "Skipping resource with malformed id");
            return None;
        }
    };
    Some(InventoryRecord {
        name: r.name,
        resource_group,
        location: r.location,
        provisioning_state: r.provisioning_state,
        tags: r.tags.unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AccessToken;
    use chrono::Utc;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use sessiongate_core::ErrorKind;
    use wiremock::{
        matchers::{header, method, path, query_param},
        Mock, MockServer, ResponseTemplate,
    };

    struct StaticToken;

    #[async_trait::async_trait]
    impl TokenSource for StaticToken {
        async fn token(&self, _scope: &str) -> Result<AccessToken> {
            Ok(AccessToken {
                token: "arm-token".to_string(),
                expires_on: Utc::now() + chrono::Duration::hours(1),
            })
        }
    }

    fn client(server: &MockServer) -> ArmClient {
        ArmClient::new(server.uri(), Arc::new(StaticToken)).unwrap()
    }

    #[tokio::test]
    async fn lists_enabled_subscriptions_across_pages() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/subscriptions"))
            .and(query_param("api-version", SUBSCRIPTIONS_API_VERSION))
            .and(header("authorization", "Bearer arm-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": [
                    {"subscriptionId": "sub-1", "displayName": "One", "state": "Enabled"},
                    {"subscriptionId": "sub-x", "displayName": "Gone", "state": "Disabled"},
                ],
                "nextLink": format!("{}/next-page", server.uri()),
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/next-page"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": [{"subscriptionId": "sub-2", "displayName": "Two", "state": "Enabled"}],
            })))
            .mount(&server)
            .await;

        let subs = client(&server).list_subscriptions().await.unwrap();
        assert_eq!(
            subs,
            vec![
                Subscription {
                    id: "sub-1".to_string(),
                    display_name: "One".to_string()
                },
                Subscription {
                    id: "sub-2".to_string(),
                    display_name: "Two".to_string()
                },
            ]
        );
    }

    #[tokio::test]
    async fn lists_resources_of_a_type() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/subscriptions/sub-1/resources"))
            .and(query_param(
                "$filter",
                "resourceType eq 'Microsoft.ContainerService/managedClusters'",
            ))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": [{
                    "id": "/subscriptions/sub-1/resourceGroups/hcp-underlay-eastus/providers/Microsoft.ContainerService/managedClusters/mc-1",
                    "name": "mc-1",
                    "location": "eastus",
                    "provisioningState": "Succeeded",
                    "tags": {"clusterType": "mgmt-cluster"},
                }, {
                    "id": "garbage",
                    "name": "broken",
                }],
            })))
            .mount(&server)
            .await;

        let records = client(&server)
            .list_resources("sub-1", "Microsoft.ContainerService/managedClusters")
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].name, "mc-1");
        assert_eq!(records[0].resource_group, "hcp-underlay-eastus");
        assert_eq!(records[0].provisioning_state.as_deref(), Some("Succeeded"));
        assert_eq!(records[0].tags["clusterType"], "mgmt-cluster");
    }

    #[tokio::test]
    async fn classifies_upstream_failures() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/subscriptions/denied/resources"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/subscriptions/flaky/resources"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let arm = client(&server);
        let denied = arm.list_resources("denied", "t").await.unwrap_err();
        assert_eq!(denied.kind(), ErrorKind::Fatal);
        let flaky = arm.list_resources("flaky", "t").await.unwrap_err();
        assert_eq!(flaky.kind(), ErrorKind::Transient);
    }

    #[tokio::test]
    async fn decodes_user_kubeconfig() {
        let server = MockServer::start().await;
        let encoded = base64::engine::general_purpose::STANDARD.encode("apiVersion: v1\n");
        Mock::given(method("POST"))
            .and(path(
                "/subscriptions/s/resourceGroups/rg/providers/Microsoft.ContainerService/managedClusters/mc-1/listClusterUserCredential",
            ))
            .and(query_param("api-version", AKS_API_VERSION))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "kubeconfigs": [{"name": "clusterUser", "value": encoded}],
            })))
            .mount(&server)
            .await;

        let kubeconfig = client(&server)
            .cluster_user_kubeconfig(&ResourceRef::managed_cluster("s", "rg", "mc-1"))
            .await
            .unwrap();
        assert_eq!(kubeconfig, b"apiVersion: v1\n");
    }

    #[tokio::test]
    async fn refuses_non_aks_resources() {
        let server = MockServer::start().await;
        let hcp = ResourceRef::new("s", "rg", "Microsoft.RedHatOpenShift", "hcpOpenShiftClusters", "c");
        let error = client(&server).cluster_user_kubeconfig(&hcp).await.unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Validation);
    }
}
