use crate::{Error, Result};
use std::time::Duration;

/// Validated parameters of a request for cluster access.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AccessRequest {
    principal: String,
    group: String,
    privilege: Privilege,
    ttl: Duration,
    name: Option<String>,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum Privilege {
    #[default]
    Unprivileged,
    Privileged,
}

// === impl AccessRequest ===

impl AccessRequest {
    pub const MIN_TTL: Duration = Duration::from_secs(60);
    pub const MAX_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);

    pub fn new(
        principal: impl Into<String>,
        group: impl Into<String>,
        privilege: Privilege,
        ttl: Duration,
    ) -> Result<Self> {
        let principal = principal.into();
        if principal.is_empty() {
            return Err(Error::invalid("principal", "must not be empty"));
        }
        if ttl.is_zero() || ttl > Self::MAX_TTL {
            return Err(Error::invalid(
                "ttl",
                format!("{ttl:?} must be positive and at most {:?}", Self::MAX_TTL),
            ));
        }
        Ok(Self {
            principal,
            group: group.into(),
            privilege,
            ttl,
            name: None,
        })
    }

    /// Checks the bounds on an interactively requested session timeout,
    /// which are tighter than those of a request.
    pub fn validate_ttl(ttl: Duration) -> Result<()> {
        if ttl < Self::MIN_TTL || ttl > Self::MAX_TTL {
            return Err(Error::invalid(
                "ttl",
                format!(
                    "{ttl:?} is outside the allowed range [{:?}, {:?}]",
                    Self::MIN_TTL,
                    Self::MAX_TTL
                ),
            ));
        }
        Ok(())
    }

    /// Names the artifacts minted for this request, such as a signing
    /// request, so repeated calls for the same request converge.
    pub fn with_name(self, name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..self
        }
    }

    pub fn principal(&self) -> &str {
        &self.principal
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn privilege(&self) -> Privilege {
        self.privilege
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// The group a certificate subject is issued for: the access group when
    /// one was requested, otherwise the privilege's role group.
    pub fn organization(&self) -> &str {
        if self.group.is_empty() {
            self.privilege.role_group()
        } else {
            &self.group
        }
    }
}

// === impl Privilege ===

impl Privilege {
    /// The RBAC group a breakglass certificate is bound to.
    pub fn role_group(&self) -> &'static str {
        match self {
            Self::Privileged => "aro-sre-cluster-admin",
            Self::Unprivileged => "aro-sre",
        }
    }
}

impl From<bool> for Privilege {
    fn from(privileged: bool) -> Self {
        if privileged {
            Self::Privileged
        } else {
            Self::Unprivileged
        }
    }
}
