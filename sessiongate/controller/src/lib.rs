#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Drives Session resources through their lifecycle.
//!
//! A session is registered while it is live and torn down at its recorded
//! expiry. Expiry is enforced by requeueing each session to run again
//! exactly when it ends; nothing else sweeps the registry.

mod controller;
mod metrics;
mod reconcile;
mod store;

pub use self::{
    controller::run,
    metrics::ReconcileMetrics,
    reconcile::{request_name, Outcome, Reconciler},
    store::{session_id, KubeSessionStore, SessionStore},
};
