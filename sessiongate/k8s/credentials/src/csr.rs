use chrono::{DateTime, Utc};
use k8s_openapi::ByteString;
use kube::api::{DeleteParams, Patch, PatchParams, PostParams};
use parking_lot::Mutex;
use rcgen::{CertificateParams, DistinguishedName, DnType, DnValue, KeyPair};
use sessiongate_core::{
    AccessRequest, AuthMaterial, ClusterInfo, Credential, Error, Progress, Result,
    CLUSTER_ID_LABEL,
};
use sessiongate_k8s_api::{
    classify, is_not_found, Api, CertificateSigningRequest, CertificateSigningRequestApproval,
    CertificateSigningRequestSpec, Client, ObjectMeta, ResourceExt, Secret,
};
use std::{collections::HashMap, fmt, time::Duration};
#[cfg(test)]
use x509_parser::prelude::*;

const COMMON_NAME_PREFIX: &str = "system:sre-break-glass:";
const CREDENTIAL_TYPE_LABEL: &str = "api.openshift.com/type";
const CREDENTIAL_TYPE: &str = "break-glass-credential";
/// The API server's serving certificate, whose chain clients must trust.
const CA_SECRET: &str = "kas-server-crt";
const CA_KEY: &str = "tls.crt";
const FIELD_MANAGER: &str = "sessiongate";

/// The API server rejects shorter certificate lifetimes. Access is bounded by
/// the session rather than the certificate, so rounding up is safe.
const MIN_EXPIRATION_SECONDS: i32 = 600;

/// Requests break-glass client certificates from a hosted control plane's
/// signer.
///
/// Each call to [`CsrMinter::mint`] advances the request by at most one step
/// and reports whether the certificate has been issued. Private keys never
/// leave the process; they are held per request name until released.
#[derive(Debug, Default)]
pub struct CsrMinter {
    keys: Mutex<HashMap<String, SigningRequest>>,
}

/// A private key and the PKCS#10 request signed with it.
#[derive(Clone, PartialEq, Eq)]
pub struct SigningRequest {
    common_name: String,
    organization: String,
    key_pem: String,
    request_pem: String,
}

#[derive(Debug, PartialEq, Eq)]
enum CsrState {
    Issued(String),
    Rejected(String),
    /// The request was not created from the key we hold.
    Mismatched,
    Waiting,
}

// === impl CsrMinter ===

impl CsrMinter {
    pub async fn mint(
        &self,
        client: &Client,
        cluster: &ClusterInfo,
        request: &AccessRequest,
    ) -> Result<Progress<Credential>> {
        let Some(endpoint) = cluster.api_endpoint.clone() else {
            tracing::debug!(cluster = %cluster.id, "Control plane endpoint not yet published");
            return Ok(Progress::Pending);
        };

        let name = csr_name(cluster, request);
        let key = self.key_for(&name, request)?;
        let csrs = Api::<CertificateSigningRequest>::all(client.clone());
        let existing = csrs
            .get_opt(&name)
            .await
            .map_err(|error| classify(format!("getting CSR {name}"), error))?;
        let Some(csr) = existing else {
            return self.submit(client, &name, cluster, request, &key).await;
        };

        match csr_state(&csr, &key) {
            CsrState::Issued(certificate) => {
                let (not_before, not_after) = validity(&certificate)?;
                let ca_data = serving_ca(client, &cluster.namespace()).await?;
                tracing::info!(csr = %name, %not_after, "Certificate issued");
                Ok(Progress::Ready(Credential {
                    endpoint,
                    ca_data,
                    auth: AuthMaterial::ClientCertificate {
                        certificate,
                        key: key.key_pem,
                    },
                    not_before,
                    not_after,
                }))
            }
            CsrState::Rejected(reason) => {
                self.forget(&name);
                Err(Error::fatal(format!("CSR {name} was not issued"), reason))
            }
            CsrState::Mismatched => {
                tracing::info!(csr = %name, "Replacing CSR that does not match the held key");
                match csrs.delete(&name, &DeleteParams::default()).await {
                    Ok(_) => {}
                    Err(error) if is_not_found(&error) => {}
                    Err(error) => return Err(classify(format!("deleting CSR {name}"), error)),
                }
                self.submit(client, &name, cluster, request, &key).await
            }
            CsrState::Waiting => {
                // Reapplied in case a previous attempt failed after creating
                // the request.
                approve(client, &name, cluster).await?;
                Ok(Progress::Pending)
            }
        }
    }

    /// Drops the key held for a request name.
    pub fn forget(&self, name: &str) {
        if self.keys.lock().remove(name).is_some() {
            tracing::debug!(csr = %name, "Released signing key");
        }
    }

    /// Deletes the signing request and its approval, then drops the held key.
    /// Objects that are already gone are ignored.
    pub async fn revoke(&self, client: &Client, cluster: &ClusterInfo, name: &str) -> Result<()> {
        self.forget(name);
        let params = DeleteParams::default();
        match Api::<CertificateSigningRequest>::all(client.clone())
            .delete(name, &params)
            .await
        {
            Ok(_) => tracing::debug!(csr = %name, "Deleted CSR"),
            Err(error) if is_not_found(&error) => {}
            Err(error) => return Err(classify(format!("deleting CSR {name}"), error)),
        }
        let namespace = cluster.namespace();
        match Api::<CertificateSigningRequestApproval>::namespaced(client.clone(), &namespace)
            .delete(name, &params)
            .await
        {
            Ok(_) => tracing::debug!(csr = %name, %namespace, "Deleted CSR approval"),
            Err(error) if is_not_found(&error) => {}
            Err(error) => return Err(classify(format!("deleting CSR approval {name}"), error)),
        }
        Ok(())
    }

    async fn submit(
        &self,
        client: &Client,
        name: &str,
        cluster: &ClusterInfo,
        request: &AccessRequest,
        key: &SigningRequest,
    ) -> Result<Progress<Credential>> {
        let csr = signing_request_object(name, cluster, request, key);
        Api::<CertificateSigningRequest>::all(client.clone())
            .create(&PostParams::default(), &csr)
            .await
            .map_err(|error| classify(format!("creating CSR {name}"), error))?;
        tracing::info!(csr = %name, signer = %csr.spec.signer_name, "Submitted CSR");
        approve(client, name, cluster).await?;
        Ok(Progress::Pending)
    }

    fn key_for(&self, name: &str, request: &AccessRequest) -> Result<SigningRequest> {
        let common_name = common_name(request.principal());
        if let Some(key) = self.keys.lock().get(name) {
            if key.common_name == common_name && key.organization == request.organization() {
                return Ok(key.clone());
            }
        }

        // Generated without the lock held; a concurrent caller for the same
        // name simply replaces this key and its request.
        let key = SigningRequest::generate(request.principal(), request.organization())?;
        self.keys.lock().insert(name.to_string(), key.clone());
        Ok(key)
    }

    #[cfg(test)]
    fn held(&self) -> usize {
        self.keys.lock().len()
    }
}

// === impl SigningRequest ===

impl SigningRequest {
    pub fn generate(principal: &str, organization: &str) -> Result<Self> {
        let key_pair =
            KeyPair::generate().map_err(|error| Error::fatal("generating private key", error))?;

        let common_name = common_name(principal);
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, DnValue::Utf8String(common_name.clone()));
        dn.push(
            DnType::OrganizationName,
            DnValue::Utf8String(organization.to_string()),
        );
        let mut params = CertificateParams::default();
        params.distinguished_name = dn;

        let request_pem = params
            .serialize_request(&key_pair)
            .and_then(|csr| csr.pem())
            .map_err(|error| Error::fatal("creating certificate request", error))?;
        Ok(Self {
            common_name,
            organization: organization.to_string(),
            key_pem: key_pair.serialize_pem(),
            request_pem,
        })
    }

    pub fn request_pem(&self) -> &str {
        &self.request_pem
    }
}

impl fmt::Debug for SigningRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningRequest")
            .field("common_name", &self.common_name)
            .field("organization", &self.organization)
            .finish_non_exhaustive()
    }
}

pub fn common_name(principal: &str) -> String {
    format!("{COMMON_NAME_PREFIX}{principal}")
}

/// The break-glass signer of a hosted control plane namespace.
pub fn signer_name(hcp_namespace: &str) -> String {
    format!("hypershift.openshift.io/{hcp_namespace}.sre-break-glass")
}

fn csr_name(cluster: &ClusterInfo, request: &AccessRequest) -> String {
    match request.name() {
        Some(name) => name.to_string(),
        None => format!("sre-breakglass-{}", cluster.id),
    }
}

fn expiration_seconds(ttl: Duration) -> i32 {
    i32::try_from(ttl.as_secs())
        .unwrap_or(i32::MAX)
        .max(MIN_EXPIRATION_SECONDS)
}

fn signing_request_object(
    name: &str,
    cluster: &ClusterInfo,
    request: &AccessRequest,
    key: &SigningRequest,
) -> CertificateSigningRequest {
    CertificateSigningRequest {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(
                [
                    (CLUSTER_ID_LABEL.to_string(), cluster.id.clone()),
                    (CREDENTIAL_TYPE_LABEL.to_string(), CREDENTIAL_TYPE.to_string()),
                ]
                .into_iter()
                .collect(),
            ),
            ..Default::default()
        },
        spec: CertificateSigningRequestSpec {
            request: ByteString(key.request_pem.clone().into_bytes()),
            signer_name: signer_name(&cluster.namespace()),
            expiration_seconds: Some(expiration_seconds(request.ttl())),
            usages: Some(vec![
                "client auth".to_string(),
                "digital signature".to_string(),
            ]),
            ..Default::default()
        },
        status: None,
    }
}

fn csr_state(csr: &CertificateSigningRequest, key: &SigningRequest) -> CsrState {
    if csr.spec.request.0 != key.request_pem.as_bytes() {
        return CsrState::Mismatched;
    }
    let Some(status) = csr.status.as_ref() else {
        return CsrState::Waiting;
    };
    for c in status.conditions.iter().flatten() {
        if (c.type_ == "Denied" || c.type_ == "Failed") && c.status == "True" {
            let reason = c.reason.clone().unwrap_or_default();
            let message = c.message.clone().unwrap_or_default();
            return CsrState::Rejected(format!("{} {reason}: {message}", c.type_));
        }
    }
    match status.certificate.as_ref() {
        Some(cert) if !cert.0.is_empty() => {
            CsrState::Issued(String::from_utf8_lossy(&cert.0).into_owned())
        }
        _ => CsrState::Waiting,
    }
}

async fn approve(client: &Client, name: &str, cluster: &ClusterInfo) -> Result<()> {
    let namespace = cluster.namespace();
    let mut approval = CertificateSigningRequestApproval::new(name, Default::default());
    approval.metadata.namespace = Some(namespace.clone());
    approval
        .labels_mut()
        .insert(CLUSTER_ID_LABEL.to_string(), cluster.id.clone());
    Api::<CertificateSigningRequestApproval>::namespaced(client.clone(), &namespace)
        .patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Apply(&approval))
        .await
        .map_err(|error| classify(format!("approving CSR {name}"), error))?;
    Ok(())
}

async fn serving_ca(client: &Client, namespace: &str) -> Result<Option<String>> {
    let secret = Api::<Secret>::namespaced(client.clone(), namespace)
        .get_opt(CA_SECRET)
        .await
        .map_err(|error| classify(format!("reading {namespace}/{CA_SECRET}"), error))?;
    Ok(secret
        .and_then(|s| s.data)
        .and_then(|mut data| data.remove(CA_KEY))
        .map(|ca| String::from_utf8_lossy(&ca.0).into_owned()))
}

/// Reads the validity window of a PEM-encoded certificate.
fn validity(certificate: &str) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
    let (_, pem) = x509_parser::pem::parse_x509_pem(certificate.as_bytes())
        .map_err(|error| Error::fatal("decoding issued certificate", error.to_string()))?;
    let cert = pem
        .parse_x509()
        .map_err(|error| Error::fatal("parsing issued certificate", error.to_string()))?;
    let at = |t: x509_parser::time::ASN1Time| {
        DateTime::from_timestamp(t.timestamp(), 0)
            .ok_or_else(|| Error::invalid("certificate", "validity is out of range"))
    };
    Ok((at(cert.validity().not_before)?, at(cert.validity().not_after)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use k8s_openapi::api::certificates::v1::{
        CertificateSigningRequestCondition, CertificateSigningRequestStatus,
    };
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use sessiongate_core::Privilege;

    fn cluster() -> ClusterInfo {
        ClusterInfo {
            id: "2abcdefghijklmnopqrstuvwxyz01234".to_string(),
            name: "prod".to_string(),
            base_namespace: "ocm-prod-2abc".to_string(),
            subscription_id: "sub".to_string(),
            resource_group: "rg".to_string(),
            resource_ref: None,
            api_endpoint: Some("https://api.prod.example.com:443".to_string()),
        }
    }

    fn request(ttl: Duration) -> AccessRequest {
        AccessRequest::new("jdoe", "", Privilege::Privileged, ttl)
            .unwrap()
            .with_name("sessiongate-1a2b3c4d")
    }

    fn subject(request_pem: &str) -> (String, Vec<String>) {
        let (_, pem) = x509_parser::pem::parse_x509_pem(request_pem.as_bytes()).unwrap();
        let (_, csr) = X509CertificationRequest::from_der(&pem.contents).unwrap();
        let name = &csr.certification_request_info.subject;
        let cn = name
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .unwrap()
            .to_string();
        let orgs = name
            .iter_organization()
            .filter_map(|o| o.as_str().ok())
            .map(str::to_string)
            .collect();
        (cn, orgs)
    }

    fn with_status(
        csr: &mut CertificateSigningRequest,
        condition: Option<(&str, &str)>,
        certificate: Option<&str>,
    ) {
        csr.status = Some(CertificateSigningRequestStatus {
            certificate: certificate.map(|c| ByteString(c.as_bytes().to_vec())),
            conditions: condition.map(|(type_, status)| {
                vec![CertificateSigningRequestCondition {
                    type_: type_.to_string(),
                    status: status.to_string(),
                    reason: Some("Policy".to_string()),
                    message: Some("nope".to_string()),
                    ..Default::default()
                }]
            }),
        });
    }

    #[test]
    fn request_subject_names_principal_and_group() {
        let key = SigningRequest::generate("jdoe", "aro-sre-cluster-admin").unwrap();
        assert!(key.key_pem.contains("PRIVATE KEY"));
        let (cn, orgs) = subject(key.request_pem());
        assert_eq!(cn, "system:sre-break-glass:jdoe");
        assert_eq!(orgs, vec!["aro-sre-cluster-admin".to_string()]);
        assert!(!format!("{key:?}").contains("PRIVATE KEY"));
    }

    #[test]
    fn builds_signing_request() {
        let cluster = cluster();
        let req = request(Duration::from_secs(3600));
        let key = SigningRequest::generate(req.principal(), req.organization()).unwrap();
        let csr = signing_request_object("sessiongate-1a2b3c4d", &cluster, &req, &key);

        assert_eq!(csr.name_any(), "sessiongate-1a2b3c4d");
        assert_eq!(
            csr.spec.signer_name,
            "hypershift.openshift.io/ocm-prod-2abc-prod.sre-break-glass"
        );
        assert_eq!(csr.spec.expiration_seconds, Some(3600));
        assert_eq!(
            csr.spec.usages,
            Some(vec!["client auth".to_string(), "digital signature".to_string()])
        );
        assert_eq!(csr.labels()[CREDENTIAL_TYPE_LABEL], CREDENTIAL_TYPE);
        assert_eq!(csr.labels()[CLUSTER_ID_LABEL], cluster.id);
    }

    #[rstest]
    #[case(Duration::from_secs(60), 600)]
    #[case(Duration::from_secs(601), 601)]
    #[case(Duration::from_secs(u64::MAX), i32::MAX)]
    fn expiration_has_a_floor(#[case] ttl: Duration, #[case] expected: i32) {
        assert_eq!(expiration_seconds(ttl), expected);
    }

    #[test]
    fn classifies_request_state() {
        let cluster = cluster();
        let req = request(Duration::from_secs(3600));
        let key = SigningRequest::generate(req.principal(), req.organization()).unwrap();
        let mut csr = signing_request_object("csr", &cluster, &req, &key);
        assert_eq!(csr_state(&csr, &key), CsrState::Waiting);

        with_status(&mut csr, Some(("Approved", "True")), None);
        assert_eq!(csr_state(&csr, &key), CsrState::Waiting);

        with_status(&mut csr, Some(("Approved", "True")), Some("CERT"));
        assert_eq!(csr_state(&csr, &key), CsrState::Issued("CERT".to_string()));

        with_status(&mut csr, Some(("Denied", "True")), None);
        assert_eq!(
            csr_state(&csr, &key),
            CsrState::Rejected("Denied Policy: nope".to_string())
        );
        with_status(&mut csr, Some(("Failed", "True")), None);
        assert!(matches!(csr_state(&csr, &key), CsrState::Rejected(_)));

        let other = SigningRequest::generate(req.principal(), req.organization()).unwrap();
        assert_eq!(csr_state(&csr, &other), CsrState::Mismatched);
    }

    #[test]
    fn keys_are_reused_per_name_and_subject() {
        let minter = CsrMinter::default();
        let req = request(Duration::from_secs(3600));
        let first = minter.key_for("csr", &req).unwrap();
        assert_eq!(minter.key_for("csr", &req).unwrap(), first);

        let other_group = AccessRequest::new("jdoe", "admins", Privilege::Privileged, req.ttl())
            .unwrap();
        let replaced = minter.key_for("csr", &other_group).unwrap();
        assert_ne!(replaced, first);
        assert_eq!(minter.held(), 1);

        minter.forget("csr");
        assert_eq!(minter.held(), 0);
    }

    #[test]
    fn reads_certificate_validity() {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.not_before = rcgen::date_time_ymd(2025, 1, 1);
        params.not_after = rcgen::date_time_ymd(2025, 1, 2);
        let cert = params.self_signed(&key).unwrap().pem();

        let (not_before, not_after) = validity(&cert).unwrap();
        assert_eq!(not_before, Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap());
        assert_eq!(not_after, Utc.with_ymd_and_hms(2025, 1, 2, 0, 0, 0).unwrap());
        assert!(validity("not a certificate").is_err());
    }

    #[test]
    fn default_name_uses_the_cluster_id() {
        let req = AccessRequest::new("jdoe", "", Privilege::Unprivileged, Duration::from_secs(600))
            .unwrap();
        assert_eq!(
            csr_name(&cluster(), &req),
            "sre-breakglass-2abcdefghijklmnopqrstuvwxyz01234"
        );
    }

    #[tokio::test]
    async fn trusts_the_api_server_serving_chain() {
        use base64::Engine;
        use wiremock::{
            matchers::{method, path},
            Mock, MockServer, ResponseTemplate,
        };

        let chain = "-----BEGIN CERTIFICATE-----\nc2VydmluZw==\n-----END CERTIFICATE-----\n";
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/namespaces/ocm-prod-2abc-prod/secrets/kas-server-crt"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "apiVersion": "v1",
                "kind": "Secret",
                "metadata": {"name": "kas-server-crt", "namespace": "ocm-prod-2abc-prod"},
                "data": {
                    "tls.crt": base64::engine::general_purpose::STANDARD.encode(chain),
                    "tls.key": base64::engine::general_purpose::STANDARD.encode("key"),
                },
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v1/namespaces/elsewhere/secrets/kas-server-crt"))
            .respond_with(ResponseTemplate::new(404).set_body_json(serde_json::json!({
                "apiVersion": "v1",
                "kind": "Status",
                "status": "Failure",
                "message": "secrets \"kas-server-crt\" not found",
                "reason": "NotFound",
                "code": 404,
            })))
            .mount(&server)
            .await;

        let config = kube::Config::new(server.uri().parse().unwrap());
        let client = Client::try_from(config).unwrap();
        assert_eq!(
            serving_ca(&client, &cluster().namespace()).await.unwrap().as_deref(),
            Some(chain)
        );
        assert_eq!(serving_ca(&client, "elsewhere").await.unwrap(), None);
    }
}
