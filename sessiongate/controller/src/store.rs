use kube::{
    api::{Api, DeleteParams, Patch, PatchParams},
    Client, ResourceExt,
};
use serde_json::json;
use sessiongate_core::{Error, Result, SessionId};
use sessiongate_k8s_api::{classify, is_not_found, session::FINALIZER, Session, SessionStatus};

/// Reads and writes Session resources.
///
/// Writes against a resource that no longer exists succeed, since the
/// reconciler treats a vanished session as already torn down.
#[async_trait::async_trait]
pub trait SessionStore: Send + Sync + 'static {
    async fn get(&self, id: &SessionId) -> Result<Option<Session>>;

    /// Adds the finalizer, returning the updated resource.
    async fn add_finalizer(&self, session: &Session) -> Result<Session>;

    async fn remove_finalizer(&self, session: &Session) -> Result<()>;

    async fn update_status(&self, session: &Session, status: &SessionStatus) -> Result<()>;

    async fn delete(&self, session: &Session) -> Result<()>;
}

#[derive(Clone)]
pub struct KubeSessionStore {
    client: Client,
}

pub fn session_id(session: &Session) -> Result<SessionId> {
    let namespace = session
        .namespace()
        .ok_or_else(|| Error::invalid("session namespace", "must not be empty"))?;
    SessionId::new(namespace, session.name_any())
}

fn tolerate_not_found<T: Default>(
    context: impl std::fmt::Display,
    result: kube::Result<T>,
) -> Result<T> {
    match result {
        Ok(value) => Ok(value),
        Err(error) if is_not_found(&error) => Ok(T::default()),
        Err(error) => Err(classify(context, error)),
    }
}

// === impl KubeSessionStore ===

impl KubeSessionStore {
    const FIELD_MANAGER: &'static str = "sessiongate";

    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, session: &Session) -> Result<(Api<Session>, SessionId)> {
        let id = session_id(session)?;
        Ok((Api::namespaced(self.client.clone(), id.namespace()), id))
    }

    /// Replaces the finalizer list, guarded by the resource version so a
    /// concurrent writer's finalizers are not clobbered.
    async fn patch_finalizers(
        &self,
        session: &Session,
        finalizers: Vec<String>,
    ) -> Result<Option<Session>> {
        let (api, id) = self.api(session)?;
        let patch = json!({
            "metadata": {
                "finalizers": finalizers,
                "resourceVersion": session.resource_version(),
            }
        });
        let res = api
            .patch(
                id.name(),
                &PatchParams::apply(Self::FIELD_MANAGER),
                &Patch::Merge(patch),
            )
            .await
            .map(Some);
        tolerate_not_found(format_args!("patching finalizers of {id}"), res)
    }
}

#[async_trait::async_trait]
impl SessionStore for KubeSessionStore {
    async fn get(&self, id: &SessionId) -> Result<Option<Session>> {
        let api = Api::<Session>::namespaced(self.client.clone(), id.namespace());
        api.get_opt(id.name())
            .await
            .map_err(|error| classify(format_args!("getting session {id}"), error))
    }

    async fn add_finalizer(&self, session: &Session) -> Result<Session> {
        let mut finalizers = session.finalizers().to_vec();
        finalizers.push(FINALIZER.to_string());
        self.patch_finalizers(session, finalizers)
            .await?
            .ok_or_else(|| Error::not_found(format_args!("session {}", session.name_any())))
    }

    async fn remove_finalizer(&self, session: &Session) -> Result<()> {
        let finalizers = session
            .finalizers()
            .iter()
            .filter(|f| *f != FINALIZER)
            .cloned()
            .collect();
        self.patch_finalizers(session, finalizers).await?;
        Ok(())
    }

    async fn update_status(&self, session: &Session, status: &SessionStatus) -> Result<()> {
        let (api, id) = self.api(session)?;
        let res = api
            .patch_status(
                id.name(),
                &PatchParams::apply(Self::FIELD_MANAGER),
                &Patch::Merge(json!({ "status": status })),
            )
            .await
            .map(drop);
        tolerate_not_found(format_args!("updating status of {id}"), res)
    }

    async fn delete(&self, session: &Session) -> Result<()> {
        let (api, id) = self.api(session)?;
        let res = api
            .delete(id.name(), &DeleteParams::default())
            .await
            .map(drop);
        tolerate_not_found(format_args!("deleting {id}"), res)
    }
}
