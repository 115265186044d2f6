use crate::GoDuration;
use chrono::{DateTime, Utc};
use kube::{CustomResource, KubeSchema, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub const FINALIZER: &str = "sessiongate.aro-hcp.azure.com/finalizer";

pub const READY_CONDITION: &str = "Ready";

/// Requests time-limited access to a management cluster or to a hosted
/// control plane running on one.
///
/// The spec cannot change once created; a different target or lifetime
/// needs a new session.
#[derive(Clone, Debug, PartialEq, CustomResource, Deserialize, Serialize, KubeSchema)]
#[kube(
    group = "sessiongate.aro-hcp.azure.com",
    version = "v1alpha1",
    kind = "Session",
    namespaced,
    status = "SessionStatus",
    printcolumn = r#"{"name":"Endpoint","type":"string","jsonPath":".status.endpoint"}"#,
    printcolumn = r#"{"name":"Expires","type":"date","jsonPath":".status.expiresAt"}"#
)]
#[x_kube(validation = Rule::new("self == oldSelf").message("spec is immutable"))]
#[serde(rename_all = "camelCase")]
pub struct SessionSpec {
    /// AKS resource id or cluster name of the management cluster.
    pub management_cluster: String,

    /// Resource id or cluster id of a hosted control plane. When unset the
    /// session targets the management cluster itself.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hosted_control_plane: Option<String>,

    pub access_level: AccessLevel,

    #[schemars(with = "String")]
    pub ttl: GoDuration,

    /// The principal the credential is issued to. Defaults to the access
    /// group.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AccessLevel {
    pub group: String,

    #[serde(default)]
    pub privileged: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    /// Once set, this is never recomputed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<String>")]
    pub expires_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<SessionCondition>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SessionCondition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: String,
    pub reason: String,
    #[serde(default)]
    pub message: String,
    #[schemars(with = "String")]
    pub last_transition_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

// === impl Session ===

impl Session {
    pub fn has_finalizer(&self) -> bool {
        self.finalizers().iter().any(|f| f == FINALIZER)
    }

    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// When the API server created the resource.
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        // Read through the wire form, which is RFC 3339 regardless of the
        // time type backing `Time`.
        let created = self.metadata.creation_timestamp.as_ref()?;
        serde_json::to_value(created)
            .and_then(serde_json::from_value)
            .ok()
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.status.as_ref().and_then(|s| s.expires_at)
    }

    pub fn endpoint(&self) -> Option<&str> {
        self.status.as_ref().and_then(|s| s.endpoint.as_deref())
    }

    pub fn ready_condition(&self) -> Option<&SessionCondition> {
        self.status
            .as_ref()?
            .conditions
            .iter()
            .find(|c| c.type_ == READY_CONDITION)
    }
}

// === impl SessionStatus ===

impl SessionStatus {
    /// Sets a condition, keeping the previous transition time when the
    /// condition's status has not changed. Returns true if anything changed.
    pub fn set_condition(&mut self, mut condition: SessionCondition) -> bool {
        match self
            .conditions
            .iter_mut()
            .find(|c| c.type_ == condition.type_)
        {
            Some(existing) => {
                if existing.status == condition.status {
                    condition.last_transition_time = existing.last_transition_time;
                }
                if *existing == condition {
                    return false;
                }
                *existing = condition;
                true
            }
            None => {
                self.conditions.push(condition);
                true
            }
        }
    }
}

// === impl SessionCondition ===

impl SessionCondition {
    pub fn ready(
        ready: bool,
        reason: impl Into<String>,
        message: impl Into<String>,
        observed_generation: Option<i64>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            type_: READY_CONDITION.to_string(),
            status: if ready { "True" } else { "False" }.to_string(),
            reason: reason.into(),
            message: message.into(),
            last_transition_time: now,
            observed_generation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use kube::CustomResourceExt;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    #[test]
    fn deserializes_manifest() {
        let session: Session = serde_yaml::from_str(
            r#"
apiVersion: sessiongate.aro-hcp.azure.com/v1alpha1
kind: Session
metadata:
  name: foo
  namespace: ns
  creationTimestamp: "2025-01-01T00:00:00Z"
  finalizers: ["sessiongate.aro-hcp.azure.com/finalizer"]
spec:
  managementCluster: mc-1
  hostedControlPlane: /subscriptions/s/resourceGroups/rg/providers/Microsoft.RedHatOpenShift/hcpOpenShiftClusters/c
  accessLevel:
    group: sre
  ttl: 2h30m
status:
  endpoint: https://gate.example.com/sessiongate/ns/foo/kas
  expiresAt: "2025-01-01T02:30:00Z"
"#,
        )
        .unwrap();

        assert!(session.has_finalizer());
        assert!(!session.is_deleting());
        assert_eq!(
            session.created_at(),
            Some(Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap())
        );
        assert!(!session.spec.access_level.privileged);
        assert_eq!(
            session.spec.ttl.as_duration(),
            Duration::from_secs(2 * 3600 + 30 * 60)
        );
        assert_eq!(
            session.expires_at(),
            Some(Utc.with_ymd_and_hms(2025, 1, 1, 2, 30, 0).unwrap())
        );
        assert_eq!(
            session.endpoint(),
            Some("https://gate.example.com/sessiongate/ns/foo/kas")
        );
    }

    #[test]
    fn conditions_keep_transition_time_while_status_is_unchanged() {
        let t0 = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let t1 = Utc.with_ymd_and_hms(2025, 1, 1, 0, 5, 0).unwrap();
        let mut status = SessionStatus::default();

        assert!(status.set_condition(SessionCondition::ready(true, "SessionActive", "", None, t0)));
        assert!(!status.set_condition(SessionCondition::ready(true, "SessionActive", "", None, t1)));
        assert_eq!(status.conditions[0].last_transition_time, t0);

        assert!(status.set_condition(SessionCondition::ready(
            false,
            "CredentialFailed",
            "csr denied",
            None,
            t1
        )));
        assert_eq!(status.conditions.len(), 1);
        assert_eq!(status.conditions[0].last_transition_time, t1);
        assert_eq!(status.conditions[0].status, "False");
    }

    #[test]
    fn created_at_is_absent_before_creation() {
        let session = Session::new(
            "foo",
            serde_json::from_value(serde_json::json!({
                "managementCluster": "mc-1",
                "accessLevel": {"group": "sre"},
                "ttl": "1h",
            }))
            .unwrap(),
        );
        assert_eq!(session.created_at(), None);
    }

    #[test]
    fn crd_rejects_spec_changes() {
        let crd = serde_json::to_value(Session::crd()).unwrap();
        let spec = crd
            .pointer("/spec/versions/0/schema/openAPIV3Schema/properties/spec")
            .unwrap();
        let rule = &spec["x-kubernetes-validations"][0];
        assert_eq!(rule["rule"], "self == oldSelf");
        assert_eq!(rule["message"], "spec is immutable");
    }
}
