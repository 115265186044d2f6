use std::fmt;

/// Maps a Kubernetes client error onto the session error taxonomy.
pub fn classify(context: impl fmt::Display, error: kube::Error) -> sessiongate_core::Error {
    match &error {
        kube::Error::Api(rsp) => sessiongate_core::Error::from_status(rsp.code, context, error),
        _ => sessiongate_core::Error::transient(context, error),
    }
}

pub fn is_not_found(error: &kube::Error) -> bool {
    matches!(error, kube::Error::Api(rsp) if rsp.code == 404)
}

pub fn is_conflict(error: &kube::Error) -> bool {
    matches!(error, kube::Error::Api(rsp) if rsp.code == 409)
}
