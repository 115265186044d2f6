use crate::{ReconcileMetrics, SessionStore};
use chrono::{DateTime, Utc};
use sessiongate_core::{
    poll_until_ready, AccessRequest, Clock, ClusterIdentifier, Error, ManagementCluster,
    PollConfig, Privilege, ProvideCredentials, Result, SessionId, SessionOptions,
    SessionRegistry, Target,
};
use sessiongate_k8s_api::{Session, SessionCondition, SessionStatus};
use sha2::{Digest, Sha256};
use std::{sync::Arc, time::Duration};
use tokio::time::Instant;

/// Reasons recorded on the Ready condition.
pub mod reasons {
    pub const SESSION_ACTIVE: &str = "SessionActive";
    pub const TARGET_INVALID: &str = "TargetInvalid";
    pub const CREDENTIAL_FAILED: &str = "CredentialFailed";
    pub const REGISTRATION_FAILED: &str = "RegistrationFailed";
}

/// Credentials are refreshed this long before they lapse.
const REFRESH_MARGIN: Duration = Duration::from_secs(5 * 60);

/// Lower bound on how soon a credential refresh is rescheduled.
const MIN_REFRESH_DELAY: Duration = Duration::from_secs(30);

pub struct Reconciler<S> {
    store: S,
    registry: Arc<dyn SessionRegistry>,
    credentials: Arc<dyn ProvideCredentials>,
    clock: Arc<dyn Clock>,
    poll: PollConfig,
    metrics: ReconcileMetrics,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// The session is live and must be reconciled again after
    /// `requeue_after`.
    Registered {
        endpoint: String,
        requeue_after: Duration,
    },

    /// The session outlived its expiry and its resource was deleted.
    Expired,

    /// The session was being deleted and has been torn down.
    Deleted,

    /// The resource no longer exists.
    NotFound,
}

/// Names the artifacts minted on behalf of a session.
///
/// The name is stable across reconciles so that an in-flight signing
/// request is picked up again rather than duplicated.
pub fn request_name(id: &SessionId) -> String {
    let digest = Sha256::digest(format!("{}-{}", id.namespace(), id.name()));
    let suffix = digest[..4]
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<String>();
    format!("sessiongate-{suffix}")
}

fn access_for(id: &SessionId, session: &Session) -> Result<(Target, AccessRequest)> {
    let spec = &session.spec;
    let management = spec.management_cluster.parse::<ManagementCluster>()?;
    let target = match spec.hosted_control_plane.as_deref() {
        None | Some("") => Target::ManagementCluster(management),
        Some(hcp) => Target::HostedControlPlane {
            management,
            cluster: hcp.parse::<ClusterIdentifier>()?,
        },
    };

    let group = &spec.access_level.group;
    let principal = spec
        .owner
        .clone()
        .filter(|o| !o.is_empty())
        .unwrap_or_else(|| group.clone());
    let request = AccessRequest::new(
        principal,
        group.clone(),
        Privilege::from(spec.access_level.privileged),
        spec.ttl.as_duration(),
    )?
    .with_name(request_name(id));
    Ok((target, request))
}

/// Sessions last their TTL from the moment the resource was created, not
/// from when it was first reconciled. A TTL that no request could carry is
/// capped at the longest one allowed.
fn initial_expiry(session: &Session, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let ttl = session.spec.ttl.as_duration();
    let ttl = if ttl.is_zero() || ttl > AccessRequest::MAX_TTL {
        AccessRequest::MAX_TTL
    } else {
        ttl
    };
    let ttl = chrono::Duration::from_std(ttl).map_err(|error| Error::invalid("ttl", error))?;
    Ok(session.created_at().unwrap_or(now) + ttl)
}

/// The earlier of the session's expiry and the point at which its
/// credential should be refreshed.
fn requeue_after(
    now: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    credential_not_after: DateTime<Utc>,
) -> Duration {
    let until_expiry = (expires_at - now).to_std().unwrap_or_default();
    let until_refresh = (credential_not_after - now)
        .to_std()
        .unwrap_or_default()
        .saturating_sub(REFRESH_MARGIN)
        .max(MIN_REFRESH_DELAY);
    until_expiry.min(until_refresh)
}

// === impl Outcome ===

impl Outcome {
    pub fn requeue_after(&self) -> Option<Duration> {
        match self {
            Self::Registered { requeue_after, .. } => Some(*requeue_after),
            _ => None,
        }
    }

    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            Self::Registered { .. } => "registered",
            Self::Expired => "expired",
            Self::Deleted => "deleted",
            Self::NotFound => "not_found",
        }
    }
}

// === impl Reconciler ===

impl<S: SessionStore> Reconciler<S> {
    pub fn new(
        store: S,
        registry: Arc<dyn SessionRegistry>,
        credentials: Arc<dyn ProvideCredentials>,
        clock: Arc<dyn Clock>,
        poll: PollConfig,
        metrics: ReconcileMetrics,
    ) -> Self {
        Self {
            store,
            registry,
            credentials,
            clock,
            poll,
            metrics,
        }
    }

    /// Brings the registry in line with the Session resource named `id`.
    ///
    /// Expired and deleted sessions are handled before any discovery or
    /// credential work is attempted.
    pub async fn reconcile(&self, id: &SessionId) -> Result<Outcome> {
        let started = Instant::now();
        let result = self.reconcile_session(id).await;
        self.metrics.observe(started, &result);
        result
    }

    async fn reconcile_session(&self, id: &SessionId) -> Result<Outcome> {
        let Some(mut session) = self.store.get(id).await? else {
            self.tear_down(id);
            tracing::debug!("Session not found");
            return Ok(Outcome::NotFound);
        };

        if session.is_deleting() {
            self.tear_down(id);
            if session.has_finalizer() {
                self.store.remove_finalizer(&session).await?;
            }
            tracing::info!("Session deleted");
            return Ok(Outcome::Deleted);
        }

        let now = self.clock.now();
        if let Some(expires_at) = session.expires_at() {
            if now >= expires_at {
                // Deletion triggers the teardown on the next pass.
                tracing::info!(%expires_at, "Session expired");
                self.store.delete(&session).await?;
                return Ok(Outcome::Expired);
            }
        }

        if !session.has_finalizer() {
            session = self.store.add_finalizer(&session).await?;
            tracing::debug!("Added finalizer");
        }

        let generation = session.metadata.generation;
        let mut status = session.status.clone().unwrap_or_default();

        // The expiry is fixed before anything else can fail so that even a
        // session that never becomes usable is eventually deleted.
        let expires_at = match status.expires_at {
            Some(expires_at) => expires_at,
            None => {
                let expires_at = initial_expiry(&session, now)?;
                status.expires_at = Some(expires_at);
                self.store.update_status(&session, &status).await?;
                tracing::info!(%expires_at, "Recorded session expiry");
                expires_at
            }
        };
        if now >= expires_at {
            tracing::info!(%expires_at, "Session expired");
            self.store.delete(&session).await?;
            return Ok(Outcome::Expired);
        }

        let (target, request) = match access_for(id, &session) {
            Ok(access) => access,
            Err(error) => {
                self.not_ready(&session, &mut status, reasons::TARGET_INVALID, &error)
                    .await;
                return Err(error);
            }
        };

        let what = format!("credential for {target}");
        let credential = poll_until_ready(&what, &self.poll, || {
            self.credentials.get_credential(&target, &request)
        })
        .await;
        let credential = match credential {
            Ok(credential) => credential,
            Err(error) => {
                self.not_ready(&session, &mut status, reasons::CREDENTIAL_FAILED, &error)
                    .await;
                return Err(error);
            }
        };
        let not_after = credential.not_after;

        let options = SessionOptions {
            expires_at,
            target,
            access_group: request.group().to_string(),
            credential,
        };
        let endpoint = match self.registry.register_session(id, options) {
            Ok(endpoint) => endpoint,
            Err(error) => {
                self.not_ready(&session, &mut status, reasons::REGISTRATION_FAILED, &error)
                    .await;
                return Err(error);
            }
        };

        status.endpoint = Some(endpoint.clone());
        status.set_condition(SessionCondition::ready(
            true,
            reasons::SESSION_ACTIVE,
            "",
            generation,
            now,
        ));
        if session.status.as_ref() != Some(&status) {
            self.store.update_status(&session, &status).await?;
        }

        let requeue_after = requeue_after(self.clock.now(), expires_at, not_after);
        tracing::info!(%endpoint, %expires_at, ?requeue_after, "Session registered");
        Ok(Outcome::Registered {
            endpoint,
            requeue_after,
        })
    }

    fn tear_down(&self, id: &SessionId) {
        self.registry.unregister_session(id);
        self.credentials.release(&request_name(id));
    }

    /// Records a failure on the Ready condition. Failing to record it does
    /// not mask the error being reported.
    async fn not_ready(
        &self,
        session: &Session,
        status: &mut SessionStatus,
        reason: &str,
        error: &Error,
    ) {
        let condition = SessionCondition::ready(
            false,
            reason,
            error.to_string(),
            session.metadata.generation,
            self.clock.now(),
        );
        if !status.set_condition(condition) {
            return;
        }
        if let Err(status_error) = self.store.update_status(session, status).await {
            tracing::warn!(error = %status_error, "Failed to record session condition");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use sessiongate_core::ErrorKind;
    use sessiongate_k8s_api::{session::AccessLevel, GoDuration, SessionSpec};

    fn session(spec: SessionSpec) -> Session {
        let mut session = Session::new("foo", spec);
        session.metadata.namespace = Some("ns".to_string());
        session
    }

    fn spec(hcp: Option<&str>, owner: Option<&str>) -> SessionSpec {
        SessionSpec {
            management_cluster: "mc-1".to_string(),
            hosted_control_plane: hcp.map(str::to_string),
            access_level: AccessLevel {
                group: "sre-group".to_string(),
                privileged: true,
            },
            ttl: "1h".parse::<GoDuration>().unwrap(),
            owner: owner.map(str::to_string),
        }
    }

    #[test]
    fn request_names_are_stable_and_distinct() {
        let foo = SessionId::new("ns", "foo").unwrap();
        let bar = SessionId::new("ns", "bar").unwrap();
        assert_eq!(request_name(&foo), request_name(&foo));
        assert_ne!(request_name(&foo), request_name(&bar));

        let name = request_name(&foo);
        assert_eq!(name.len(), "sessiongate-".len() + 8);
        assert!(name["sessiongate-".len()..]
            .chars()
            .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn targets_management_cluster_without_hcp() {
        let id = SessionId::new("ns", "foo").unwrap();
        for hcp in [None, Some("")] {
            let (target, request) = access_for(&id, &session(spec(hcp, None))).unwrap();
            assert_eq!(
                target,
                Target::ManagementCluster(ManagementCluster::Name("mc-1".to_string()))
            );
            assert_eq!(request.principal(), "sre-group");
            assert_eq!(request.privilege(), Privilege::Privileged);
            assert_eq!(request.ttl(), Duration::from_secs(3600));
            assert_eq!(request.name(), Some(request_name(&id).as_str()));
        }
    }

    #[test]
    fn targets_hosted_control_plane() {
        let id = SessionId::new("ns", "foo").unwrap();
        let cluster_id = "0123456789abcdefghijklmnopqrstuv";
        let (target, request) =
            access_for(&id, &session(spec(Some(cluster_id), Some("alice")))).unwrap();
        assert_eq!(
            target.hosted_cluster(),
            Some(&cluster_id.parse::<ClusterIdentifier>().unwrap())
        );
        assert_eq!(request.principal(), "alice");
        assert_eq!(request.group(), "sre-group");
    }

    #[rstest]
    #[case::bad_management_cluster("/subscriptions/x", None, "1h")]
    #[case::bad_hcp("mc-1", Some("not-a-cluster"), "1h")]
    #[case::zero_ttl("mc-1", None, "0s")]
    #[case::ttl_too_long("mc-1", None, "721h")]
    fn rejects_invalid_sessions(
        #[case] management_cluster: &str,
        #[case] hcp: Option<&str>,
        #[case] ttl: &str,
    ) {
        let mut spec = spec(hcp, None);
        spec.management_cluster = management_cluster.to_string();
        spec.ttl = ttl.parse().unwrap();
        let id = SessionId::new("ns", "foo").unwrap();
        let error = access_for(&id, &session(spec)).unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Validation);
    }

    #[rstest]
    #[case::from_creation("1h", Some("2025-01-01T00:00:00Z"), 3_600)]
    #[case::not_yet_created("1h", None, 7_200)]
    #[case::zero_ttl("0s", Some("2025-01-01T00:00:00Z"), 30 * 24 * 3_600)]
    #[case::ttl_too_long("721h", Some("2025-01-01T00:00:00Z"), 30 * 24 * 3_600)]
    fn expiry_counts_from_creation(
        #[case] ttl: &str,
        #[case] created: Option<&str>,
        #[case] expected: i64,
    ) {
        let t0 = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let mut spec = spec(None, None);
        spec.ttl = ttl.parse().unwrap();
        let mut session = session(spec);
        session.metadata.creation_timestamp =
            created.map(|ts| serde_json::from_value(serde_json::json!(ts)).unwrap());
        // Reconciled for the first time an hour after creation.
        let now = t0 + chrono::Duration::hours(1);
        assert_eq!(
            initial_expiry(&session, now).unwrap(),
            t0 + chrono::Duration::seconds(expected)
        );
    }

    #[rstest]
    // A long-lived credential defers entirely to the expiry.
    #[case(3_600, 86_400, 3_600)]
    // A bearer token is refreshed five minutes before it lapses.
    #[case(3_600, 1_800, 1_500)]
    // A credential about to lapse is retried after a short delay.
    #[case(3_600, 60, 30)]
    // Expiry still wins when it comes first.
    #[case(10, 60, 10)]
    fn requeues_at_expiry_or_refresh(
        #[case] expires_in: i64,
        #[case] credential_lasts: i64,
        #[case] expected: u64,
    ) {
        let now = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let got = requeue_after(
            now,
            now + chrono::Duration::seconds(expires_in),
            now + chrono::Duration::seconds(credential_lasts),
        );
        assert_eq!(got, Duration::from_secs(expected));
    }
}
