//! The subset of HyperShift resources read and written by sessiongate.
//!
//! Unknown fields are ignored so these bindings tolerate newer HyperShift
//! releases.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, PartialEq, Eq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "hypershift.openshift.io",
    version = "v1beta1",
    kind = "HostedCluster",
    namespaced,
    status = "HostedClusterStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct HostedClusterSpec {
    #[serde(default)]
    pub platform: PlatformSpec,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PlatformSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub azure: Option<AzurePlatformSpec>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct AzurePlatformSpec {
    #[serde(rename = "subscriptionID", default)]
    pub subscription_id: String,

    #[serde(rename = "resourceGroup", default)]
    pub resource_group: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HostedClusterStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_plane_endpoint: Option<ApiEndpoint>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct ApiEndpoint {
    pub host: String,
    pub port: i32,
}

/// Approves a CertificateSigningRequest of the same name for the break-glass
/// signer of the control plane namespace it is created in.
#[derive(Clone, Debug, Default, PartialEq, Eq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "certificates.hypershift.openshift.io",
    version = "v1alpha1",
    kind = "CertificateSigningRequestApproval",
    namespaced
)]
pub struct CertificateSigningRequestApprovalSpec {}

// === impl ApiEndpoint ===

impl ApiEndpoint {
    pub fn url(&self) -> String {
        format!("https://{}:{}", self.host, self.port)
    }
}
