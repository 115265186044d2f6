//! Parsing of user-supplied cluster identifiers.
//!
//! An identifier is either an opaque 32-character cluster id or an Azure
//! resource id. Classification is decided by the resource id prefix alone,
//! so every input lands in exactly one variant or is rejected.

use crate::{Error, Result};
use std::{fmt, str::FromStr};

const RESOURCE_PREFIX: &str = "/subscriptions/";

pub const HCP_PROVIDER: &str = "Microsoft.RedHatOpenShift";
pub const HCP_TYPE: &str = "hcpOpenShiftClusters";
pub const AKS_PROVIDER: &str = "Microsoft.ContainerService";
pub const AKS_TYPE: &str = "managedClusters";

/// An opaque cluster id: exactly 32 lowercase ASCII letters or digits.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClusterId(String);

/// A structured Azure resource id.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ResourceRef {
    subscription_id: String,
    resource_group: String,
    provider: String,
    resource_type: String,
    name: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ClusterIdentifier {
    Id(ClusterId),
    Resource(ResourceRef),
}

/// Names the management cluster that hosts a session's target, either by
/// AKS resource id or by bare AKS cluster name.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ManagementCluster {
    Resource(ResourceRef),
    Name(String),
}

fn has_resource_prefix(s: &str) -> bool {
    s.len() >= RESOURCE_PREFIX.len()
        && s.as_bytes()[..RESOURCE_PREFIX.len()].eq_ignore_ascii_case(RESOURCE_PREFIX.as_bytes())
}

// === impl ClusterId ===

impl ClusterId {
    pub const LEN: usize = 32;

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for ClusterId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.len() != Self::LEN {
            return Err(Error::invalid(
                "cluster id",
                format!("expected {} characters, got {}", Self::LEN, s.len()),
            ));
        }
        if !s
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
        {
            return Err(Error::invalid(
                "cluster id",
                "only lowercase letters and digits are allowed",
            ));
        }
        Ok(Self(s.to_string()))
    }
}

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// === impl ResourceRef ===

impl ResourceRef {
    pub fn new(
        subscription_id: impl Into<String>,
        resource_group: impl Into<String>,
        provider: impl Into<String>,
        resource_type: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            subscription_id: subscription_id.into(),
            resource_group: resource_group.into(),
            provider: provider.into(),
            resource_type: resource_type.into(),
            name: name.into(),
        }
    }

    /// Builds the resource id of an AKS managed cluster.
    pub fn managed_cluster(
        subscription_id: impl Into<String>,
        resource_group: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self::new(subscription_id, resource_group, AKS_PROVIDER, AKS_TYPE, name)
    }

    /// Parses a resource id that must name a hosted control plane cluster.
    pub fn parse_hosted_control_plane(s: &str) -> Result<Self> {
        let r = s.parse::<Self>()?;
        r.expect_type(HCP_PROVIDER, HCP_TYPE)?;
        Ok(r)
    }

    /// Parses a resource id that must name an AKS managed cluster.
    pub fn parse_managed_cluster(s: &str) -> Result<Self> {
        let r = s.parse::<Self>()?;
        r.expect_type(AKS_PROVIDER, AKS_TYPE)?;
        Ok(r)
    }

    pub fn subscription_id(&self) -> &str {
        &self.subscription_id
    }

    pub fn resource_group(&self) -> &str {
        &self.resource_group
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn resource_type(&self) -> &str {
        &self.resource_type
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Provider namespaces and types are case-insensitive in Azure.
    pub fn is_type(&self, provider: &str, resource_type: &str) -> bool {
        self.provider.eq_ignore_ascii_case(provider)
            && self.resource_type.eq_ignore_ascii_case(resource_type)
    }

    /// Returns true if the resource lives in the given subscription and
    /// resource group. Azure treats both case-insensitively.
    pub fn is_owned_by(&self, subscription_id: &str, resource_group: &str) -> bool {
        self.subscription_id.eq_ignore_ascii_case(subscription_id)
            && self.resource_group.eq_ignore_ascii_case(resource_group)
    }

    fn expect_type(&self, provider: &str, resource_type: &str) -> Result<()> {
        if self.is_type(provider, resource_type) {
            return Ok(());
        }
        Err(Error::invalid(
            "resource id",
            format!(
                "expected a {provider}/{resource_type} resource, got {}/{}",
                self.provider, self.resource_type
            ),
        ))
    }
}

impl FromStr for ResourceRef {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if !has_resource_prefix(s) {
            return Err(Error::invalid(
                "resource id",
                format!("must start with {RESOURCE_PREFIX}"),
            ));
        }

        let segments = s[1..].split('/').collect::<Vec<_>>();
        let [subs, subscription_id, groups, resource_group, providers, provider, resource_type, name] =
            segments[..]
        else {
            return Err(Error::invalid(
                "resource id",
                "expected /subscriptions/{sub}/resourceGroups/{rg}/providers/{namespace}/{type}/{name}",
            ));
        };

        for (got, want) in [
            (subs, "subscriptions"),
            (groups, "resourceGroups"),
            (providers, "providers"),
        ] {
            if !got.eq_ignore_ascii_case(want) {
                return Err(Error::invalid(
                    "resource id",
                    format!("expected segment {want:?}, got {got:?}"),
                ));
            }
        }

        for (value, what) in [
            (subscription_id, "subscription"),
            (resource_group, "resource group"),
            (provider, "provider"),
            (resource_type, "resource type"),
            (name, "name"),
        ] {
            if value.is_empty() {
                return Err(Error::invalid("resource id", format!("empty {what}")));
            }
        }

        Ok(Self::new(
            subscription_id,
            resource_group,
            provider,
            resource_type,
            name,
        ))
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "/subscriptions/{}/resourceGroups/{}/providers/{}/{}/{}",
            self.subscription_id, self.resource_group, self.provider, self.resource_type, self.name
        )
    }
}

// === impl ClusterIdentifier ===

impl FromStr for ClusterIdentifier {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if has_resource_prefix(s) {
            return ResourceRef::parse_hosted_control_plane(s).map(Self::Resource);
        }
        s.parse::<ClusterId>().map(Self::Id).map_err(|_| {
            Error::invalid(
                "cluster identifier",
                format!("{s:?} is neither a {}-character cluster id nor a resource id", ClusterId::LEN),
            )
        })
    }
}

impl fmt::Display for ClusterIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id(id) => id.fmt(f),
            Self::Resource(r) => r.fmt(f),
        }
    }
}

// === impl ManagementCluster ===

impl ManagementCluster {
    const MAX_NAME_LEN: usize = 63;
}

impl FromStr for ManagementCluster {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if has_resource_prefix(s) {
            return ResourceRef::parse_managed_cluster(s).map(Self::Resource);
        }
        if s.is_empty() || s.len() > Self::MAX_NAME_LEN {
            return Err(Error::invalid(
                "management cluster",
                format!("name must be 1-{} characters", Self::MAX_NAME_LEN),
            ));
        }
        if !s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(Error::invalid(
                "management cluster",
                format!("{s:?} contains characters not allowed in an AKS cluster name"),
            ));
        }
        Ok(Self::Name(s.to_string()))
    }
}

impl fmt::Display for ManagementCluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Resource(r) => r.fmt(f),
            Self::Name(n) => n.fmt(f),
        }
    }
}
