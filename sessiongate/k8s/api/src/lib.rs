#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod duration;
mod error;
pub mod hypershift;
pub mod session;

pub use self::{
    duration::GoDuration,
    error::{classify, is_conflict, is_not_found},
    hypershift::{CertificateSigningRequestApproval, HostedCluster},
    session::{Session, SessionCondition, SessionSpec, SessionStatus},
};
pub use k8s_openapi::api::{
    self,
    certificates::v1::{
        CertificateSigningRequest, CertificateSigningRequestSpec, CertificateSigningRequestStatus,
    },
    core::v1::Secret,
};
pub use kube::{
    api::{Api, ObjectMeta, ResourceExt},
    Client, Error, Resource,
};
