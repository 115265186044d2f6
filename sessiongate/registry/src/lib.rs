#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! An in-memory table of live sessions.
//!
//! The registry holds no timers. Sessions leave the table only when the
//! reconciler unregisters them, so the Session resource's `expiresAt` is the
//! single clock that decides when access ends.

mod metrics;

pub use self::metrics::RegistryMetrics;

use ahash::AHashMap as HashMap;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use sessiongate_core::{
    Credential, Error, Result, SessionId, SessionOptions, SessionRegistry, Target,
};
use std::sync::Arc;

/// Path prefix under which session endpoints are served.
pub const PATH_PREFIX: &str = "/sessiongate";

const KAS_SEGMENT: &str = "kas";

pub type SharedRegistry = Arc<Registry>;

#[derive(Debug)]
pub struct Registry {
    ingress_base_url: String,
    sessions: RwLock<HashMap<SessionId, Arc<SessionRecord>>>,
    metrics: RegistryMetrics,
}

#[derive(Debug, PartialEq, Eq)]
pub struct SessionRecord {
    pub id: SessionId,
    pub endpoint: String,
    pub expires_at: DateTime<Utc>,
    pub target: Target,
    pub access_group: String,
    pub credential: Credential,
}

/// The session an inbound request addresses and the path to forward it to.
#[derive(Debug, PartialEq, Eq)]
pub struct Route {
    pub session: Arc<SessionRecord>,
    pub upstream_path: String,
}

// === impl Registry ===

impl Registry {
    pub fn new(ingress_base_url: impl Into<String>, metrics: RegistryMetrics) -> Self {
        let mut ingress_base_url = ingress_base_url.into();
        while ingress_base_url.ends_with('/') {
            ingress_base_url.pop();
        }
        Self {
            ingress_base_url,
            sessions: RwLock::new(HashMap::default()),
            metrics,
        }
    }

    pub fn shared(ingress_base_url: impl Into<String>, metrics: RegistryMetrics) -> SharedRegistry {
        Arc::new(Self::new(ingress_base_url, metrics))
    }

    /// The externally reachable endpoint for a session.
    pub fn endpoint_for(&self, id: &SessionId) -> String {
        format!(
            "{}{PATH_PREFIX}/{}/{}/{KAS_SEGMENT}",
            self.ingress_base_url,
            id.namespace(),
            id.name()
        )
    }

    pub fn lookup(&self, id: &SessionId) -> Option<Arc<SessionRecord>> {
        self.sessions.read().get(id).cloned()
    }

    /// Maps a request path of the form
    /// `/sessiongate/{namespace}/{name}/kas[/...]` to a live session.
    pub fn route(&self, path: &str) -> Option<Route> {
        let rest = path.strip_prefix(PATH_PREFIX)?.strip_prefix('/')?;
        let mut parts = rest.splitn(4, '/');
        let namespace = parts.next()?;
        let name = parts.next()?;
        if parts.next()? != KAS_SEGMENT {
            return None;
        }
        let upstream_path = format!("/{}", parts.next().unwrap_or_default());

        let id = SessionId::new(namespace, name).ok()?;
        let session = self.lookup(&id)?;
        Some(Route {
            session,
            upstream_path,
        })
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SessionRegistry for Registry {
    fn register_session(&self, id: &SessionId, options: SessionOptions) -> Result<String> {
        let SessionOptions {
            expires_at,
            target,
            access_group,
            credential,
        } = options;
        if credential.endpoint.is_empty() {
            return Err(Error::invalid("credential endpoint", "must not be empty"));
        }

        let endpoint = self.endpoint_for(id);
        let record = Arc::new(SessionRecord {
            id: id.clone(),
            endpoint: endpoint.clone(),
            expires_at,
            target,
            access_group,
            credential,
        });

        {
            // The gauge is updated under the lock so it never lags the map.
            let mut sessions = self.sessions.write();
            sessions.insert(id.clone(), record);
            self.metrics.registered(sessions.len());
        }
        tracing::debug!(session = %id, %endpoint, %expires_at, "Registered session");
        Ok(endpoint)
    }

    fn unregister_session(&self, id: &SessionId) {
        let removed = {
            let mut sessions = self.sessions.write();
            let removed = sessions.remove(id).is_some();
            if removed {
                self.metrics.unregistered(sessions.len());
            }
            removed
        };
        if removed {
            tracing::debug!(session = %id, "Unregistered session");
        }
    }
}
