use crate::{Credential, Error, Result, Target};
use chrono::{DateTime, Utc};
use std::{fmt, str::FromStr};

/// Identifies a session by the namespace and name of its Session resource.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId {
    namespace: String,
    name: String,
}

/// Everything the registry needs to serve a session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionOptions {
    pub expires_at: DateTime<Utc>,
    pub target: Target,
    pub access_group: String,
    pub credential: Credential,
}

/// The writer side of the session registry.
pub trait SessionRegistry: Send + Sync {
    /// Inserts or replaces the session, returning its externally reachable
    /// endpoint.
    fn register_session(&self, id: &SessionId, options: SessionOptions) -> Result<String>;

    /// Removes the session. Removing an unknown session does nothing.
    fn unregister_session(&self, id: &SessionId);
}

// === impl SessionId ===

impl SessionId {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Result<Self> {
        let namespace = namespace.into();
        let name = name.into();
        for (value, field) in [(&namespace, "session namespace"), (&name, "session name")] {
            if value.is_empty() {
                return Err(Error::invalid(field, "must not be empty"));
            }
            if value.contains('/') {
                return Err(Error::invalid(field, "must not contain '/'"));
            }
        }
        Ok(Self { namespace, name })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl FromStr for SessionId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once('/') {
            Some((ns, name)) => Self::new(ns, name),
            None => Err(Error::invalid("session id", "expected namespace/name")),
        }
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_namespace_and_name() {
        let id = "ns/foo".parse::<SessionId>().unwrap();
        assert_eq!(id.namespace(), "ns");
        assert_eq!(id.name(), "foo");
        assert_eq!(id.to_string(), "ns/foo");
    }

    #[test]
    fn rejects_malformed_ids() {
        for input in ["", "ns", "/foo", "ns/", "ns/foo/bar"] {
            assert!(input.parse::<SessionId>().is_err(), "{input:?}");
        }
    }
}
