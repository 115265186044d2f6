use crate::LeaderConfig;
use anyhow::Result;
use k8s_openapi::api::coordination::v1 as coordv1;
use kube::api::{Api, ObjectMeta, Patch, PatchParams};
use std::sync::Arc;
use tokio::sync::watch;

const FIELD_MANAGER: &str = "sessiongate";

pub type Claims = watch::Receiver<Arc<kubert::lease::Claim>>;

/// Ensures the lease exists and starts contending for it as `hostname`.
pub async fn init(
    client: kube::Client,
    ns: &str,
    config: &LeaderConfig,
    hostname: &str,
) -> Result<Claims> {
    let lease = coordv1::Lease {
        metadata: ObjectMeta {
            name: Some(config.lease_name.clone()),
            namespace: Some(ns.to_string()),
            // Specifying a resource version of "0" means that we will
            // only create the Lease if it does not already exist.
            resource_version: Some("0".to_string()),
            labels: Some(
                [(
                    "app.kubernetes.io/name".to_string(),
                    "sessiongate".to_string(),
                )]
                .into_iter()
                .collect(),
            ),
            ..Default::default()
        },
        spec: None,
    };
    let api = Api::<coordv1::Lease>::namespaced(client, ns);
    match api
        .patch(
            &config.lease_name,
            &PatchParams {
                field_manager: Some(FIELD_MANAGER.to_string()),
                ..Default::default()
            },
            &Patch::Apply(lease),
        )
        .await
    {
        Ok(lease) => tracing::info!(?lease, "Created Lease resource"),
        Err(kube::Error::Api(_)) => tracing::debug!("Lease already exists, no need to create it"),
        Err(error) => return Err(error.into()),
    };

    let params = kubert::lease::ClaimParams {
        lease_duration: config.lease_duration,
        renew_grace_period: config.renew_grace_period,
    };
    let (claims, _task) = kubert::lease::LeaseManager::init(api, &config.lease_name)
        .await?
        .spawn(hostname, params)
        .await?;
    Ok(claims)
}

/// Waits until `hostname` holds the lease.
pub async fn acquired(claims: &mut Claims, hostname: &str) -> Result<()> {
    claims
        .wait_for(|claim| claim.is_current_for(hostname))
        .await?;
    Ok(())
}

/// Completes once `hostname` no longer holds the lease, either because
/// another replica took it or because it lapsed without renewal.
pub async fn lost(mut claims: Claims, hostname: String) {
    loop {
        let claim = claims.borrow_and_update().clone();
        if !claim.is_current_for(&hostname) {
            return;
        }
        tokio::select! {
            res = claims.changed() => {
                if res.is_err() {
                    return;
                }
            }
            () = claim.expire() => {}
        }
    }
}
