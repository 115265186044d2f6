//! Dumps the custom resources belonging to a hosted cluster.

use anyhow::{Context, Result};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::{
    api::{Api, ListParams},
    core::{ApiResource, DynamicObject, GroupVersionKind, TypeMeta},
    Client,
};
use sessiongate_core::{ClusterInfo, CLUSTER_ID_LABEL};
use std::path::{Path, PathBuf};

const MANIFEST_WORK_CRD: &str = "manifestworks.work.open-cluster-management.io";
const MANAGED_CLUSTER_CRD: &str = "managedclusters.cluster.open-cluster-management.io";
const MANAGED_CLUSTER_INFO_CRD: &str = "managedclusterinfos.internal.open-cluster-management.io";

/// ManifestWorks for every hosted cluster live in this namespace.
const LOCAL_CLUSTER_NAMESPACE: &str = "local-cluster";

/// Where and how the resources of one definition are listed.
#[derive(Clone, Debug, PartialEq)]
pub struct Listing {
    pub resource: ApiResource,
    pub namespace: Option<String>,
    pub label_selector: Option<String>,
    pub field_selector: Option<String>,
}

/// Plans a listing for a definition's storage version, or `None` when its
/// resources cannot belong to the hosted cluster.
pub fn listing(crd: &CustomResourceDefinition, hcp_namespace: &str, cluster_id: &str) -> Option<Listing> {
    let spec = &crd.spec;
    let version = spec.versions.iter().find(|v| v.storage)?;
    let gvk = GroupVersionKind::gvk(&spec.group, &version.name, &spec.names.kind);
    let resource = ApiResource::from_gvk_with_plural(&gvk, &spec.names.plural);
    let listing = |namespace: Option<&str>, labels: Option<String>, fields: Option<String>| Listing {
        resource: resource.clone(),
        namespace: namespace.map(str::to_string),
        label_selector: labels,
        field_selector: fields,
    };

    let name = crd.metadata.name.as_deref().unwrap_or_default();
    match name {
        MANIFEST_WORK_CRD => Some(listing(
            Some(LOCAL_CLUSTER_NAMESPACE),
            Some(format!("{CLUSTER_ID_LABEL}={cluster_id}")),
            None,
        )),
        MANAGED_CLUSTER_CRD => Some(listing(None, None, Some(format!("metadata.name={cluster_id}")))),
        MANAGED_CLUSTER_INFO_CRD => Some(listing(Some(cluster_id), None, None)),
        _ if spec.scope == "Namespaced" => Some(listing(Some(hcp_namespace), None, None)),
        _ => None,
    }
}

/// Writes each kind's resources to `{output}/crs/{namespace}/{kind}_list.yaml`
/// and returns the directory written to.
pub async fn dump(client: &Client, cluster: &ClusterInfo, output: &Path) -> Result<PathBuf> {
    let hcp_namespace = cluster.namespace();
    let dir = output.join("crs").join(&hcp_namespace);
    tokio::fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;

    let crds = Api::<CustomResourceDefinition>::all(client.clone())
        .list(&ListParams::default())
        .await
        .context("listing custom resource definitions")?;

    let mut written = 0usize;
    for crd in &crds.items {
        let Some(listing) = listing(crd, &hcp_namespace, &cluster.id) else {
            continue;
        };
        let items = list(client, &listing)
            .await
            .with_context(|| format!("listing {}", crd.metadata.name.as_deref().unwrap_or_default()))?;
        if items.is_empty() {
            continue;
        }
        let path = dir.join(file_name(&listing.resource.kind));
        tokio::fs::write(&path, render(&items)?)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        tracing::debug!(path = %path.display(), count = items.len(), "Wrote resources");
        written += 1;
    }
    tracing::info!(dir = %dir.display(), kinds = written, "Dumped custom resources");
    Ok(dir)
}

async fn list(client: &Client, listing: &Listing) -> Result<Vec<DynamicObject>> {
    let api = match listing.namespace.as_deref() {
        Some(ns) => Api::<DynamicObject>::namespaced_with(client.clone(), ns, &listing.resource),
        None => Api::<DynamicObject>::all_with(client.clone(), &listing.resource),
    };
    let mut params = ListParams::default();
    if let Some(labels) = listing.label_selector.as_deref() {
        params = params.labels(labels);
    }
    if let Some(fields) = listing.field_selector.as_deref() {
        params = params.fields(fields);
    }
    let list = api.list(&params).await?;
    // List items carry no type information of their own.
    Ok(list
        .items
        .into_iter()
        .map(|mut obj| {
            if obj.types.is_none() {
                obj.types = Some(TypeMeta {
                    api_version: listing.resource.api_version.clone(),
                    kind: listing.resource.kind.clone(),
                });
            }
            obj
        })
        .collect())
}

fn file_name(kind: &str) -> String {
    format!("{}_list.yaml", kind.to_lowercase())
}

/// Renders resources as a multi-document YAML stream.
fn render(items: &[DynamicObject]) -> Result<String> {
    let docs = items
        .iter()
        .map(|item| serde_yaml::to_string(item).context("rendering resource"))
        .collect::<Result<Vec<_>>>()?;
    Ok(docs.join("---\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use serde_json::json;

    const CLUSTER_ID: &str = "2jesjug41iavg27inj078ssjidn20clk";
    const HCP_NAMESPACE: &str = "ocm-int-2jesjug41iavg27inj078ssjidn20clk-demo";

    fn crd(group: &str, plural: &str, kind: &str, scope: &str) -> CustomResourceDefinition {
        serde_json::from_value(json!({
            "apiVersion": "apiextensions.k8s.io/v1",
            "kind": "CustomResourceDefinition",
            "metadata": { "name": format!("{plural}.{group}") },
            "spec": {
                "group": group,
                "names": { "kind": kind, "plural": plural },
                "scope": scope,
                "versions": [
                    { "name": "v1alpha1", "served": true, "storage": false },
                    { "name": "v1", "served": true, "storage": true },
                ],
            },
        }))
        .unwrap()
    }

    #[test]
    fn namespaced_resources_come_from_the_hcp_namespace() {
        let crd = crd("hypershift.openshift.io", "hostedcontrolplanes", "HostedControlPlane", "Namespaced");
        let listing = listing(&crd, HCP_NAMESPACE, CLUSTER_ID).unwrap();
        assert_eq!(listing.resource.api_version, "hypershift.openshift.io/v1");
        assert_eq!(listing.resource.plural, "hostedcontrolplanes");
        assert_eq!(listing.namespace.as_deref(), Some(HCP_NAMESPACE));
        assert_eq!(listing.label_selector, None);
        assert_eq!(listing.field_selector, None);
    }

    #[test]
    fn cluster_scoped_resources_are_skipped() {
        let crd = crd("config.openshift.io", "clusterversions", "ClusterVersion", "Cluster");
        assert_eq!(listing(&crd, HCP_NAMESPACE, CLUSTER_ID), None);
    }

    #[rstest]
    #[case::manifest_works(
        "work.open-cluster-management.io", "manifestworks", "ManifestWork", "Namespaced",
        Some(LOCAL_CLUSTER_NAMESPACE), Some("api.openshift.com/id=2jesjug41iavg27inj078ssjidn20clk"), None
    )]
    #[case::managed_clusters(
        "cluster.open-cluster-management.io", "managedclusters", "ManagedCluster", "Cluster",
        None, None, Some("metadata.name=2jesjug41iavg27inj078ssjidn20clk")
    )]
    #[case::managed_cluster_infos(
        "internal.open-cluster-management.io", "managedclusterinfos", "ManagedClusterInfo", "Namespaced",
        Some(CLUSTER_ID), None, None
    )]
    fn open_cluster_management_resources(
        #[case] group: &str,
        #[case] plural: &str,
        #[case] kind: &str,
        #[case] scope: &str,
        #[case] namespace: Option<&str>,
        #[case] labels: Option<&str>,
        #[case] fields: Option<&str>,
    ) {
        let listing = listing(&crd(group, plural, kind, scope), HCP_NAMESPACE, CLUSTER_ID).unwrap();
        assert_eq!(listing.namespace.as_deref(), namespace);
        assert_eq!(listing.label_selector.as_deref(), labels);
        assert_eq!(listing.field_selector.as_deref(), fields);
    }

    #[test]
    fn renders_one_document_per_item() {
        let items = ["a", "b"]
            .into_iter()
            .map(|name| {
                serde_json::from_value::<DynamicObject>(json!({
                    "apiVersion": "hypershift.openshift.io/v1",
                    "kind": "NodePool",
                    "metadata": { "name": name, "namespace": HCP_NAMESPACE },
                    "spec": { "replicas": 2 },
                }))
                .unwrap()
            })
            .collect::<Vec<_>>();
        let yaml = render(&items).unwrap();
        assert_eq!(yaml.matches("---\n").count(), 1, "{yaml}");
        assert_eq!(yaml.matches("kind: NodePool").count(), 2, "{yaml}");
        assert_eq!(file_name("NodePool"), "nodepool_list.yaml");
    }
}
