use super::*;
use chrono::{DateTime, TimeZone, Utc};
use pretty_assertions::assert_eq;
use sessiongate_core::{ManagementCluster, ManualClock, SessionOptions, SessionRegistry, Target};
use sessiongate_registry::{Registry, RegistryMetrics};
use wiremock::{
    matchers::{self, body_string, method, path, query_param},
    Mock, MockServer, ResponseTemplate,
};

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
}

fn id(s: &str) -> SessionId {
    s.parse().unwrap()
}

fn options(endpoint: &str) -> SessionOptions {
    let expires_at = t0() + chrono::Duration::hours(1);
    SessionOptions {
        expires_at,
        target: Target::ManagementCluster(ManagementCluster::Name("mc-1".to_string())),
        access_group: "sre".to_string(),
        credential: Credential {
            endpoint: endpoint.to_string(),
            ca_data: None,
            auth: AuthMaterial::Bearer("session-token".to_string()),
            not_before: t0(),
            not_after: expires_at,
        },
    }
}

struct Fixture {
    registry: SharedRegistry,
    clock: Arc<ManualClock>,
    metrics: ProxyMetrics,
    proxy: Proxy,
}

impl Fixture {
    fn new() -> Self {
        let registry = Registry::shared("https://gate.example.com", RegistryMetrics::default());
        let clock = Arc::new(ManualClock::new(t0()));
        let metrics = ProxyMetrics::default();
        let proxy = Proxy::new(registry.clone(), clock.clone(), metrics.clone());
        Self {
            registry,
            clock,
            metrics,
            proxy,
        }
    }

    async fn send(&self, req: Request<Full<Bytes>>) -> (StatusCode, HeaderMap, String) {
        let rsp = self.proxy.clone().handle(req).await;
        let status = rsp.status();
        let headers = rsp.headers().clone();
        let body = rsp.into_body().collect().await.unwrap().to_bytes();
        (status, headers, String::from_utf8(body.to_vec()).unwrap())
    }
}

fn get(uri: &str) -> Request<Full<Bytes>> {
    Request::get(uri).body(Full::default()).unwrap()
}

#[tokio::test]
async fn health_endpoints_answer() {
    let fx = Fixture::new();
    for uri in ["/healthz", "/readyz"] {
        let (status, _, _) = fx.send(get(uri)).await;
        assert_eq!(status, StatusCode::OK, "{uri}");
    }
}

#[tokio::test]
async fn unknown_sessions_are_not_found() {
    let fx = Fixture::new();
    for uri in [
        "/sessiongate/ns/missing/kas/api",
        "/sessiongate/ns/missing",
        "/elsewhere",
    ] {
        let (status, _, _) = fx.send(get(uri)).await;
        assert_eq!(status, StatusCode::NOT_FOUND, "{uri}");
    }
}

#[tokio::test]
async fn forwards_with_the_session_credential() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/namespaces"))
        .and(query_param("limit", "1"))
        .and(matchers::header("authorization", "Bearer session-token"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "application/json")
                .set_body_string(r#"{"kind":"NamespaceList"}"#),
        )
        .expect(1)
        .mount(&upstream)
        .await;

    let fx = Fixture::new();
    fx.registry
        .register_session(&id("ns/foo"), options(&upstream.uri()))
        .unwrap();

    let req = Request::get("/sessiongate/ns/foo/kas/api/v1/namespaces?limit=1")
        .header(header::AUTHORIZATION, "Bearer caller-token")
        .body(Full::default())
        .unwrap();
    let (status, headers, body) = fx.send(req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers[header::CONTENT_TYPE], "application/json");
    assert_eq!(body, r#"{"kind":"NamespaceList"}"#);
    assert_eq!(fx.metrics.count("GET", 200), 1);
}

#[tokio::test]
async fn forwards_request_bodies_and_statuses() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/namespaces/default/configmaps"))
        .and(body_string(r#"{"kind":"ConfigMap"}"#))
        .respond_with(ResponseTemplate::new(409).set_body_string("conflict"))
        .mount(&upstream)
        .await;

    let fx = Fixture::new();
    fx.registry
        .register_session(&id("ns/foo"), options(&format!("{}/", upstream.uri())))
        .unwrap();

    let req = Request::post("/sessiongate/ns/foo/kas/api/v1/namespaces/default/configmaps")
        .body(Full::new(Bytes::from_static(br#"{"kind":"ConfigMap"}"#)))
        .unwrap();
    let (status, _, body) = fx.send(req).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body, "conflict");
    assert_eq!(fx.metrics.count("POST", 409), 1);
}

#[tokio::test]
async fn expired_sessions_are_refused() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&upstream)
        .await;

    let fx = Fixture::new();
    fx.registry
        .register_session(&id("ns/foo"), options(&upstream.uri()))
        .unwrap();
    fx.clock.set(t0() + chrono::Duration::hours(1));

    let (status, _, _) = fx.send(get("/sessiongate/ns/foo/kas/api")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn unreachable_clusters_are_bad_gateways() {
    let fx = Fixture::new();
    // Nothing listens on the discard port.
    fx.registry
        .register_session(&id("ns/foo"), options("http://127.0.0.1:9"))
        .unwrap();

    let (status, _, _) = fx.send(get("/sessiongate/ns/foo/kas/api")).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(fx.metrics.count("GET", 502), 1);
}

#[tokio::test]
async fn clients_follow_reregistration() {
    let fx = Fixture::new();
    fx.registry
        .register_session(&id("ns/foo"), options("https://old.example.com"))
        .unwrap();
    let first = fx.registry.lookup(&id("ns/foo")).unwrap();
    fx.proxy.client_for(&first).unwrap();
    fx.proxy.client_for(&first).unwrap();
    assert_eq!(fx.proxy.inner.clients.lock().len(), 1);

    fx.registry
        .register_session(&id("ns/foo"), options("https://new.example.com"))
        .unwrap();
    let second = fx.registry.lookup(&id("ns/foo")).unwrap();
    fx.proxy.client_for(&second).unwrap();
    let clients = fx.proxy.inner.clients.lock();
    assert_eq!(clients.len(), 1);
    assert!(Arc::ptr_eq(&clients[&id("ns/foo")].0, &second));
}

#[tokio::test]
async fn serves_over_tcp_until_shutdown() {
    let fx = Fixture::new();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (signal, watch) = drain::channel();
    let server = tokio::spawn(serve(listener, fx.proxy.clone(), watch));

    let rsp = reqwest::get(format!("http://{addr}/healthz")).await.unwrap();
    assert_eq!(rsp.status(), StatusCode::OK);
    let rsp = reqwest::get(format!("http://{addr}/sessiongate/ns/foo/kas/api"))
        .await
        .unwrap();
    assert_eq!(rsp.status(), StatusCode::NOT_FOUND);

    signal.drain().await;
    server.await.unwrap();
}
