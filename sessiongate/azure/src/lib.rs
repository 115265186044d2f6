#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Azure Resource Manager access for cluster inventory and AKS credentials.

mod arm;
mod identity;
mod token;

pub use self::{
    arm::ArmClient,
    identity::{
        default_credential, ChainedCredential, ManagedIdentityCredential,
        WorkloadIdentityCredential,
    },
    token::{AccessToken, AzureCliCredential, TokenSource},
};

/// The Entra application that fronts every AKS API server.
pub const AKS_SERVER_APP_ID: &str = "6dae42f8-4368-4678-94ff-3960e28e3630";

pub const DEFAULT_MANAGEMENT_ENDPOINT: &str = "https://management.azure.com";

/// The token scope for the AKS API server application.
pub fn aks_scope() -> String {
    format!("{AKS_SERVER_APP_ID}/.default")
}
