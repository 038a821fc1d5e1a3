//! A request crossing the whole gateway: server, endpoint stage, backend
//! stage and the instrumented client, against a mock backend.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Extension, Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use gateway_otel::config::{BackendConfig, EndpointConfig};
use gateway_otel::http::server::RequestTracking;
use gateway_otel::pipeline::{
    backend_round_trip_tracker, backend_stage, proxy_fn, proxy_stage, Proxy, ProxyError,
    ProxyRequest, ProxyResponse,
};
use gateway_otel::{
    ConfigData, InstrumentedClient, Registry, RequestContext, ServerTrackingLayer, Telemetry,
};
use http::Method;
use http_body_util::{BodyExt, Full};
use tokio::net::TcpListener;

mod common;
use common::{span_attr, start_mock_backend, Recording};

const TRACE_ID: &str = "4bf92f3577b34da6a3ce929d0e0e4736";

fn users_pipeline(telemetry: &Telemetry, backend_host: String) -> Proxy {
    let backend = BackendConfig {
        url_pattern: "/users/{{.Id}}".into(),
        method: "GET".into(),
        hosts: vec![backend_host.clone()],
        parent_endpoint: "/api/users/{{.Id}}".into(),
        parent_endpoint_method: "GET".into(),
        ..BackendConfig::default()
    };
    let endpoint = EndpointConfig {
        endpoint: "/api/users/{{.Id}}".into(),
        method: "GET".into(),
        backends: vec![backend.clone()],
        ..EndpointConfig::default()
    };

    let tracker = backend_round_trip_tracker(telemetry, &backend);
    let client: InstrumentedClient = InstrumentedClient::new(tracker);
    let call = proxy_fn(move |cx: RequestContext, req: ProxyRequest| {
        let client = client.clone();
        let url = format!("{backend_host}{}", req.path);
        async move {
            let outbound = http::Request::builder()
                .method(req.method)
                .uri(&url)
                .body(Full::new(req.body))
                .map_err(|e| ProxyError::backend(url.as_str(), e))?;
            let resp = client
                .request(&cx, outbound)
                .await
                .map_err(|e| ProxyError::backend(url.as_str(), e))?;
            let status = resp.status();
            let body = resp
                .into_body()
                .collect()
                .await
                .map_err(|e| ProxyError::backend(url.as_str(), e))?
                .to_bytes();
            Ok(ProxyResponse::new(status, body))
        }
    });
    proxy_stage(telemetry, &endpoint, backend_stage(telemetry, &backend, call))
}

async fn get_user(
    State(pipeline): State<Proxy>,
    Path(id): Path<String>,
    Extension(tracking): Extension<RequestTracking>,
) -> axum::response::Response {
    tracking.set_endpoint_pattern("/api/users/:id");
    let req = ProxyRequest::new(Method::GET, format!("/users/{id}"));
    match pipeline(tracking.request_context(), req).await {
        Ok(resp) => (resp.status, resp.body).into_response(),
        Err(e) => (StatusCode::BAD_GATEWAY, Bytes::from(e.to_string())).into_response(),
    }
}

async fn serve(recording: &Recording, backend: SocketAddr) -> SocketAddr {
    let telemetry = Telemetry::new(ConfigData::default(), recording.handle.clone());
    let pipeline = users_pipeline(&telemetry, format!("http://{backend}"));
    let registry = Arc::new(Registry::new(telemetry));
    let app = Router::new()
        .route("/api/users/{id}", get(get_user))
        .with_state(pipeline)
        .layer(ServerTrackingLayer::new(registry));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn call(gateway: SocketAddr) -> (u16, String) {
    let resp = reqwest::Client::new()
        .get(format!("http://{gateway}/api/users/42"))
        .header("traceparent", format!("00-{TRACE_ID}-00f067aa0ba902b7-01"))
        .send()
        .await
        .unwrap();
    let status = resp.status().as_u16();
    (status, resp.text().await.unwrap())
}

#[tokio::test]
async fn test_every_stage_reports() {
    let backend: SocketAddr = "127.0.0.1:28411".parse().unwrap();
    let seen = start_mock_backend(backend, "200 OK", "{\"id\":42}").await;
    let recording = Recording::new();
    let gateway = serve(&recording, backend).await;

    let (status, body) = call(gateway).await;
    assert_eq!(status, 200);
    assert_eq!(body, "{\"id\":42}");

    // server, proxy stage, backend stage, round trip, body read
    let spans = recording.wait_for_spans(5).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    let metrics = recording.metrics();

    assert_eq!(metrics.histogram_count("http.server.duration"), 1);
    assert_eq!(metrics.histogram_count("gateway.proxy.duration"), 1);
    assert_eq!(metrics.histogram_count("gateway.backend.duration"), 1);
    assert_eq!(metrics.histogram_count("http.client.duration"), 1);
    assert_eq!(metrics.counter("http.client.request.started.count"), 1);
    assert_eq!(metrics.histogram_values("http.client.response.size"), vec![9.0]);

    assert_eq!(
        metrics.label("gateway.proxy.duration", "http.route").as_deref(),
        Some("/api/users/:id")
    );
    assert_eq!(
        metrics.label("gateway.backend.duration", "server.address").as_deref(),
        Some(format!("http://{backend}").as_str())
    );
    assert_eq!(
        metrics.label("http.client.duration", "clientname").as_deref(),
        Some("/users/:id")
    );

    for span in &spans {
        assert_eq!(span.span_context.trace_id().to_string(), TRACE_ID, "{}", span.name);
    }
    let has_span = |stage: &str, name: &str| {
        spans
            .iter()
            .any(|s| s.name == name && span_attr(s, "gateway.stage").as_deref() == Some(stage))
    };
    assert!(has_span("global", "/api/users/42"));
    assert!(has_span("proxy", "/api/users/:id"));
    assert!(has_span("backend", "/users/:id"));
    assert!(has_span("backend-request", "/users/:id"));
    assert!(has_span("backend-request", "http.client.response.read.tracker"));

    let heads = seen.lock().unwrap();
    assert_eq!(heads.len(), 1);
    assert!(heads[0].to_ascii_lowercase().contains("traceparent: 00-4bf92f3577b34da6a3ce929d0e0e4736"));
}

#[tokio::test]
async fn test_backend_failure_status_is_reported() {
    let backend: SocketAddr = "127.0.0.1:28412".parse().unwrap();
    start_mock_backend(backend, "503 Service Unavailable", "down").await;
    let recording = Recording::new();
    let gateway = serve(&recording, backend).await;

    let (status, body) = call(gateway).await;
    assert_eq!(status, 503);
    assert_eq!(body, "down");

    recording.wait_for_spans(5).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    let metrics = recording.metrics();
    assert_eq!(
        metrics.label("http.client.duration", "http.response.status_code").as_deref(),
        Some("503")
    );
    assert_eq!(
        metrics.label("http.server.duration", "http.response.status_code").as_deref(),
        Some("503")
    );
}

#[tokio::test]
async fn test_unreachable_backend_is_a_bad_gateway() {
    let backend: SocketAddr = "127.0.0.1:28413".parse().unwrap();
    let recording = Recording::new();
    let gateway = serve(&recording, backend).await;

    let (status, _body) = call(gateway).await;
    assert_eq!(status, 502);

    recording.wait_for_spans(4).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    let metrics = recording.metrics();
    assert_eq!(metrics.counter("http.client.request.failed.count"), 1);
    assert_eq!(
        metrics.label("http.client.duration", "http.response.status_code").as_deref(),
        Some("0")
    );
    assert_eq!(
        metrics.label("http.server.duration", "http.response.status_code").as_deref(),
        Some("502")
    );
}
