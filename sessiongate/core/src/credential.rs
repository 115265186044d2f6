use crate::{
    identifier::{ClusterIdentifier, ManagementCluster},
    poll::Progress,
    AccessRequest, Result,
};
use chrono::{DateTime, Utc};
use std::fmt;

/// A time-bounded credential for one cluster's API server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Credential {
    pub endpoint: String,

    /// PEM-encoded certificate authority bundle. `None` means the system
    /// trust roots apply.
    pub ca_data: Option<String>,

    pub auth: AuthMaterial,
    pub not_before: DateTime<Utc>,

    /// Authoritative: the credential must not be used at or after this
    /// instant.
    pub not_after: DateTime<Utc>,
}

#[derive(Clone, PartialEq, Eq)]
pub enum AuthMaterial {
    Bearer(String),
    ClientCertificate {
        /// PEM-encoded certificate chain.
        certificate: String,
        /// PEM-encoded private key.
        key: String,
    },
}

/// The cluster a session grants access to.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Target {
    ManagementCluster(ManagementCluster),

    /// A hosted control plane, reached through the management cluster that
    /// runs it.
    HostedControlPlane {
        management: ManagementCluster,
        cluster: ClusterIdentifier,
    },
}

/// Mints credentials.
///
/// Each call returns promptly with a ready credential, a pending marker, or
/// an error; callers own the polling cadence and timeout.
#[async_trait::async_trait]
pub trait ProvideCredentials: Send + Sync {
    async fn get_credential(
        &self,
        target: &Target,
        request: &AccessRequest,
    ) -> Result<Progress<Credential>>;

    /// Drops any state held for the request named `name`, such as a private
    /// key awaiting its signed certificate.
    fn release(&self, _name: &str) {}
}

// === impl Credential ===

impl Credential {
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.not_before <= now && now < self.not_after
    }
}

impl fmt::Debug for AuthMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bearer(_) => f.write_str("Bearer(<redacted>)"),
            Self::ClientCertificate { .. } => f
                .debug_struct("ClientCertificate")
                .finish_non_exhaustive(),
        }
    }
}

// === impl Target ===

impl Target {
    pub fn management(&self) -> &ManagementCluster {
        match self {
            Self::ManagementCluster(mc) => mc,
            Self::HostedControlPlane { management, .. } => management,
        }
    }

    pub fn hosted_cluster(&self) -> Option<&ClusterIdentifier> {
        match self {
            Self::ManagementCluster(_) => None,
            Self::HostedControlPlane { cluster, .. } => Some(cluster),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ManagementCluster(mc) => write!(f, "management cluster {mc}"),
            Self::HostedControlPlane {
                management,
                cluster,
            } => write!(f, "hosted control plane {cluster} on {management}"),
        }
    }
}
