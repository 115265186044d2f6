#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Mints time-bounded credentials for management clusters and hosted
//! control planes.
//!
//! Management cluster access uses an Entra bearer token against the AKS API
//! server. Hosted control plane access is reached through the management
//! cluster: the hosted cluster is discovered there and a break-glass client
//! certificate is requested from its control plane signer.

mod csr;
pub mod kubeconfig;
mod management;
mod provider;

pub use self::{
    csr::{CsrMinter, SigningRequest},
    management::ManagementCredentials,
    provider::ClusterCredentials,
};
