use crate::{session_id, Reconciler, SessionStore};
use futures::prelude::*;
use kube::{
    runtime::{
        controller::{self, Action, Controller},
        watcher,
    },
    Api,
};
use sessiongate_core::{Error, Result};
use sessiongate_k8s_api::Session;
use std::{sync::Arc, time::Duration};
use tracing::{info_span, Instrument};

/// Retryable failures are retried promptly; anything else waits for the
/// resource to change or for this much time to pass.
const RETRY_DELAY: Duration = Duration::from_secs(5);
const FAILURE_DELAY: Duration = Duration::from_secs(60);

/// Watches Session resources and reconciles them with up to `workers` run
/// concurrently, until `shutdown` is signaled.
pub async fn run<S: SessionStore>(
    sessions: Api<Session>,
    reconciler: Arc<Reconciler<S>>,
    workers: u16,
    shutdown: drain::Watch,
) {
    let config = controller::Config::default().concurrency(workers);
    let (close_tx, close_rx) = tokio::sync::oneshot::channel::<()>();
    let results = Controller::new(sessions, watcher::Config::default())
        .with_config(config)
        .graceful_shutdown_on(close_rx.map(|_| {}))
        .run(reconcile, error_policy, reconciler)
        .for_each(|res| async move {
            match res {
                Ok((obj, _)) => tracing::trace!(session = %obj, "Reconciled"),
                Err(controller::Error::ReconcilerFailed(error, obj)) => {
                    tracing::debug!(session = %obj, %error, "Reconcile failed")
                }
                Err(error) => tracing::warn!(%error, "Controller error"),
            }
        });
    tokio::pin!(results);

    tokio::select! {
        _ = (&mut results) => tracing::info!("Session watch ended"),
        handle = shutdown.signaled() => {
            tracing::debug!("Draining session reconciles");
            let _ = close_tx.send(());
            handle.release_after(results).await;
        }
    }
}

async fn reconcile<S: SessionStore>(
    session: Arc<Session>,
    reconciler: Arc<Reconciler<S>>,
) -> Result<Action> {
    let id = session_id(&session)?;
    let span = info_span!("session", %id);
    let outcome = reconciler.reconcile(&id).instrument(span).await?;
    Ok(match outcome.requeue_after() {
        Some(after) => Action::requeue(after),
        None => Action::await_change(),
    })
}

fn error_policy<S: SessionStore>(
    session: Arc<Session>,
    error: &Error,
    _: Arc<Reconciler<S>>,
) -> Action {
    let delay = if error.is_retryable() {
        RETRY_DELAY
    } else {
        FAILURE_DELAY
    };
    tracing::warn!(
        session = ?session_id(&session).ok(),
        %error,
        kind = %error.kind(),
        ?delay,
        "Failed to reconcile session",
    );
    Action::requeue(delay)
}
