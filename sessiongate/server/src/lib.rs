#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Serves session endpoints.
//!
//! Requests under `/sessiongate/{namespace}/{name}/kas` are forwarded to the
//! API server of the session's cluster with the session's credential. Only
//! sessions present in the registry and not yet past their expiry are
//! served.

mod metrics;
#[cfg(test)]
mod tests;

pub use self::metrics::ProxyMetrics;

use ahash::AHashMap as HashMap;
use bytes::Bytes;
use futures::{future, TryStreamExt};
use http::{header, HeaderMap, HeaderName, Request, Response, StatusCode};
use http_body_util::{combinators::UnsyncBoxBody, BodyExt, Full, StreamBody};
use hyper::body::Frame;
use hyper_util::{rt::TokioIo, service::TowerToHyperService};
use parking_lot::Mutex;
use sessiongate_core::{AuthMaterial, BoxError, Clock, Credential, SessionId};
use sessiongate_registry::{Route, SessionRecord, SharedRegistry};
use std::{convert::Infallible, net::SocketAddr, sync::Arc, task::Poll};
use tokio::{net::TcpListener, time::Instant};
use tracing::{debug, info, trace, warn};

pub type Body = UnsyncBoxBody<Bytes, BoxError>;

/// Forwards session requests. Cheap to clone.
#[derive(Clone)]
pub struct Proxy {
    inner: Arc<Inner>,
}

struct Inner {
    registry: SharedRegistry,
    clock: Arc<dyn Clock>,
    metrics: ProxyMetrics,
    /// Upstream clients, rebuilt whenever a session's record is replaced.
    clients: Mutex<HashMap<SessionId, (Arc<SessionRecord>, reqwest::Client)>>,
}

/// Headers that describe a single connection and must not be forwarded.
const HOP_BY_HOP: [HeaderName; 7] = [
    header::CONNECTION,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// Accepts connections on `listener` until `shutdown` is signaled. Open
/// connections are then closed gracefully.
pub async fn serve(listener: TcpListener, proxy: Proxy, shutdown: drain::Watch) {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "Session server listening");
    }
    let signaled = shutdown.clone().signaled();
    tokio::pin!(signaled);
    loop {
        let (stream, client) = tokio::select! {
            res = listener.accept() => match res {
                Ok(conn) => conn,
                Err(error) => {
                    warn!(%error, "Failed to accept connection");
                    continue;
                }
            },
            _handle = &mut signaled => {
                debug!("Stopped accepting connections");
                return;
            }
        };
        tokio::spawn(serve_connection(
            stream,
            client,
            proxy.clone(),
            shutdown.clone(),
        ));
    }
}

async fn serve_connection(
    stream: tokio::net::TcpStream,
    client: SocketAddr,
    proxy: Proxy,
    shutdown: drain::Watch,
) {
    let conn = hyper::server::conn::http1::Builder::new()
        .serve_connection(TokioIo::new(stream), TowerToHyperService::new(proxy));
    tokio::pin!(conn);
    let res = tokio::select! {
        res = &mut conn => res,
        handle = shutdown.signaled() => {
            conn.as_mut().graceful_shutdown();
            handle.release_after(conn).await
        }
    };
    if let Err(error) = res {
        debug!(%client, %error, "Connection closed with error");
    }
}

fn text(status: StatusCode, body: &'static str) -> Response<Body> {
    let mut rsp = Response::new(
        Full::new(Bytes::from_static(body.as_bytes()))
            .map_err(|never| match never {})
            .boxed_unsync(),
    );
    *rsp.status_mut() = status;
    rsp.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    rsp
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in &HOP_BY_HOP {
        headers.remove(name);
    }
    headers.remove("keep-alive");
}

/// Builds a client that trusts the session's CA and, for certificate
/// credentials, presents the session's client certificate.
fn upstream_client(credential: &Credential) -> Result<reqwest::Client, BoxError> {
    let mut builder = reqwest::Client::builder()
        .user_agent(concat!("sessiongate/", env!("CARGO_PKG_VERSION")))
        .redirect(reqwest::redirect::Policy::none());
    if let Some(ca) = credential.ca_data.as_deref() {
        for cert in reqwest::Certificate::from_pem_bundle(ca.as_bytes())? {
            builder = builder.add_root_certificate(cert);
        }
    }
    if let AuthMaterial::ClientCertificate { certificate, key } = &credential.auth {
        let pem = format!("{}\n{}", certificate.trim_end(), key);
        builder = builder.identity(reqwest::Identity::from_pem(pem.as_bytes())?);
    }
    Ok(builder.build()?)
}

// === impl Proxy ===

impl Proxy {
    pub fn new(registry: SharedRegistry, clock: Arc<dyn Clock>, metrics: ProxyMetrics) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry,
                clock,
                metrics,
                clients: Mutex::new(HashMap::default()),
            }),
        }
    }

    async fn handle<B>(self, req: Request<B>) -> Response<Body>
    where
        B: hyper::body::Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        trace!(method = %req.method(), path = %req.uri().path(), "Request");
        if matches!(req.uri().path(), "/healthz" | "/readyz") {
            return text(StatusCode::OK, "ok\n");
        }

        let Some(route) = self.inner.registry.route(req.uri().path()) else {
            return text(StatusCode::NOT_FOUND, "session not found\n");
        };
        // The record may outlive its expiry until the resource is deleted.
        if self.inner.clock.now() >= route.session.expires_at {
            debug!(session = %route.session.id, "Refusing request to expired session");
            return text(StatusCode::NOT_FOUND, "session not found\n");
        }

        let started = Instant::now();
        let method = req.method().clone();
        let session = route.session.id.clone();
        let rsp = match self.forward(route, req).await {
            Ok(rsp) => rsp,
            Err(error) => {
                warn!(%session, %error, "Failed to forward request");
                text(StatusCode::BAD_GATEWAY, "session cluster unavailable\n")
            }
        };
        self.inner
            .metrics
            .observe(&method, rsp.status(), started.elapsed());
        rsp
    }

    async fn forward<B>(&self, route: Route, req: Request<B>) -> Result<Response<Body>, BoxError>
    where
        B: hyper::body::Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let Route {
            session,
            upstream_path,
        } = route;
        let client = self.client_for(&session)?;

        let mut url = format!(
            "{}{upstream_path}",
            session.credential.endpoint.trim_end_matches('/')
        );
        if let Some(query) = req.uri().query() {
            url.push('?');
            url.push_str(query);
        }

        let (parts, body) = req.into_parts();
        let body = body.collect().await.map_err(Into::into)?.to_bytes();
        let mut headers = parts.headers;
        strip_hop_by_hop(&mut headers);
        // Callers authenticate to the gate, not to the session cluster.
        headers.remove(header::AUTHORIZATION);
        headers.remove(header::HOST);
        headers.remove(header::CONTENT_LENGTH);

        let mut upstream = client.request(parts.method, url).headers(headers).body(body);
        if let AuthMaterial::Bearer(token) = &session.credential.auth {
            upstream = upstream.bearer_auth(token);
        }
        let upstream = upstream.send().await?;

        let mut rsp = Response::builder().status(upstream.status());
        if let Some(headers) = rsp.headers_mut() {
            for (name, value) in upstream.headers() {
                headers.append(name.clone(), value.clone());
            }
            strip_hop_by_hop(headers);
        }
        let body = StreamBody::new(
            upstream
                .bytes_stream()
                .map_ok(Frame::data)
                .map_err(BoxError::from),
        );
        Ok(rsp.body(body.boxed_unsync())?)
    }

    fn client_for(&self, session: &Arc<SessionRecord>) -> Result<reqwest::Client, BoxError> {
        let mut clients = self.inner.clients.lock();
        if let Some((record, client)) = clients.get(&session.id) {
            if Arc::ptr_eq(record, session) {
                return Ok(client.clone());
            }
        }

        let client = upstream_client(&session.credential)?;
        let registry = &self.inner.registry;
        clients.retain(|id, (record, _)| {
            registry
                .lookup(id)
                .is_some_and(|live| Arc::ptr_eq(&live, record))
        });
        clients.insert(session.id.clone(), (session.clone(), client.clone()));
        debug!(session = %session.id, "Built upstream client");
        Ok(client)
    }
}

impl<B> tower::Service<Request<B>> for Proxy
where
    B: hyper::body::Body<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError>,
{
    type Response = Response<Body>;
    type Error = Infallible;
    type Future = future::BoxFuture<'static, Result<Response<Body>, Infallible>>;

    fn poll_ready(&mut self, _cx: &mut std::task::Context<'_>) -> Poll<Result<(), Infallible>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        let proxy = self.clone();
        Box::pin(async move { Ok(proxy.handle(req).await) })
    }
}
