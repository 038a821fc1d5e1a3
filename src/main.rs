//! Instrumented gateway demo.
//!
//! Serves a small axum gateway with every layer of the telemetry engine in
//! place:
//!
//! ```text
//!   client ──▶ ServerTrackingLayer ──▶ /api/users/:id ──▶ proxy stage
//!                                                           │
//!                                                           ▼
//!                                                     backend stage
//!                                                           │
//!                                                           ▼
//!                                          InstrumentedClient ──▶ backend
//! ```
//!
//! plus a WebSocket echo endpoint (`/ws/echo`) exercising the upgrade path.
//! Metrics are scraped from the configured Prometheus exporter, or from
//! `--prometheus-port` when no exporter is configured.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Extension, Path, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use clap::Parser;
use http_body_util::{BodyExt, Full};
use tokio::net::TcpListener;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

use gateway_otel::config::memo::{MemoizedParser, ParseResult};
use gateway_otel::config::schema::PrometheusExporterConfig;
use gateway_otel::config::watcher::ConfigWatcher;
use gateway_otel::config::{load_config, BackendConfig, ConfigData, EndpointConfig};
use gateway_otel::context::RequestContext;
use gateway_otel::http::client::InstrumentedClient;
use gateway_otel::http::server::{RequestTracking, ServerTrackingLayer};
use gateway_otel::lifecycle::{shutdown_signal, Shutdown};
use gateway_otel::observability::logging::{init_logging, LogFormat};
use gateway_otel::observability::{Registry, Telemetry};
use gateway_otel::pipeline::{
    backend_round_trip_tracker, backend_stage, proxy_fn, proxy_stage, Proxy, ProxyError,
    ProxyRequest, ProxyResponse,
};

const USERS_ENDPOINT: &str = "/api/users/{{.Id}}";
const USERS_BACKEND: &str = "/users/{{.Id}}";
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Parser)]
#[command(name = "gateway-otel", version, about = "Instrumented API gateway demo")]
struct Args {
    /// Telemetry config file (.toml or .json). Watched for changes.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address the gateway listens on.
    #[arg(short, long, default_value = "127.0.0.1:8080")]
    listen: SocketAddr,

    /// Backend serving `/users/{id}`.
    #[arg(short, long, default_value = "http://127.0.0.1:8081")]
    backend: String,

    /// Scrape port used when the config has no Prometheus exporter.
    #[arg(long, default_value_t = 9090)]
    prometheus_port: u16,

    #[arg(long, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[arg(long, default_value = "gateway_otel=info,tower_http=info")]
    log_filter: String,
}

/// Pipeline of the users endpoint, rebuilt when the telemetry generation
/// changes.
struct Gateway {
    registry: Arc<Registry>,
    backend_host: String,
    pipeline: Mutex<Option<(Arc<Telemetry>, Proxy)>>,
}

impl Gateway {
    fn new(registry: Arc<Registry>, backend_host: String) -> Self {
        Self {
            registry,
            backend_host,
            pipeline: Mutex::new(None),
        }
    }

    fn pipeline(&self) -> Proxy {
        let telemetry = self.registry.snapshot();
        let mut cached = self.pipeline.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some((generation, proxy)) = cached.as_ref() {
            if Arc::ptr_eq(generation, &telemetry) {
                return proxy.clone();
            }
        }
        let proxy = self.build(&telemetry);
        *cached = Some((telemetry, proxy.clone()));
        proxy
    }

    fn build(&self, telemetry: &Telemetry) -> Proxy {
        let backend = BackendConfig {
            url_pattern: USERS_BACKEND.to_string(),
            method: "GET".to_string(),
            hosts: vec![self.backend_host.clone()],
            parent_endpoint: USERS_ENDPOINT.to_string(),
            parent_endpoint_method: "GET".to_string(),
            ..BackendConfig::default()
        };
        let endpoint = EndpointConfig {
            endpoint: USERS_ENDPOINT.to_string(),
            method: "GET".to_string(),
            backends: vec![backend.clone()],
            ..EndpointConfig::default()
        };

        let tracker = backend_round_trip_tracker(telemetry, &backend);
        let client: InstrumentedClient = InstrumentedClient::new(tracker);
        let host = self.backend_host.clone();
        let call = proxy_fn(move |cx: RequestContext, req: ProxyRequest| {
            let client = client.clone();
            let url = format!("{host}{}", req.path);
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
                let headers = resp.headers().clone();
                let body = resp
                    .into_body()
                    .collect()
                    .await
                    .map_err(|e| ProxyError::backend(url.as_str(), e))?
                    .to_bytes();
                let mut out = ProxyResponse::new(status, body);
                out.headers = headers;
                if !status.is_success() {
                    out = out.incomplete();
                }
                Ok(out)
            }
        });

        proxy_stage(telemetry, &endpoint, backend_stage(telemetry, &backend, call))
    }
}

async fn get_user(
    State(gateway): State<Arc<Gateway>>,
    Path(id): Path<String>,
    tracking: Option<Extension<RequestTracking>>,
    headers: HeaderMap,
) -> Response {
    let cx = match &tracking {
        Some(Extension(tracking)) => {
            tracking.set_endpoint_pattern("/api/users/:id");
            tracking.request_context()
        }
        None => RequestContext::new(),
    };
    let req = ProxyRequest::new(Method::GET, format!("/users/{id}")).with_headers(headers);

    match gateway.pipeline()(cx, req).await {
        Ok(resp) => {
            let mut out = (resp.status, resp.body).into_response();
            if let Some(content_type) = resp.headers.get(http::header::CONTENT_TYPE) {
                out.headers_mut()
                    .insert(http::header::CONTENT_TYPE, content_type.clone());
            }
            out
        }
        Err(e) => {
            tracing::warn!(error = %e, "Users pipeline failed");
            (StatusCode::BAD_GATEWAY, Bytes::from(e.to_string())).into_response()
        }
    }
}

async fn ws_echo(ws: WebSocketUpgrade, tracking: Option<Extension<RequestTracking>>) -> Response {
    if let Some(Extension(tracking)) = tracking {
        tracking.set_endpoint_pattern("/ws/echo");
    }
    ws.on_failed_upgrade(|e| tracing::warn!(error = %e, "WebSocket upgrade failed"))
        .on_upgrade(echo)
}

async fn echo(mut socket: WebSocket) {
    while let Some(Ok(msg)) = socket.recv().await {
        let reply = match msg {
            Message::Text(_) | Message::Binary(_) => msg,
            Message::Close(_) => break,
            _ => continue,
        };
        if socket.send(reply).await.is_err() {
            break;
        }
    }
}

fn initial_config(
    args: &Args,
    parsed: Option<ParseResult>,
) -> Result<ConfigData, Box<dyn std::error::Error>> {
    let mut config = match (&args.config, parsed) {
        (Some(path), Some(parsed)) => match parsed {
            Ok(config) => ConfigData::clone(&config),
            Err(e) if e.is_no_config() => {
                tracing::warn!(path = ?path, "No telemetry section, using defaults");
                ConfigData::default()
            }
            Err(e) => return Err(e.into()),
        },
        _ => ConfigData::default(),
    };
    if config.exporters.prometheus.is_empty() && config.exporters.otlp.is_empty() {
        config.exporters.prometheus.push(PrometheusExporterConfig {
            name: "local".to_string(),
            host: "127.0.0.1".to_string(),
            port: args.prometheus_port,
            disable_metrics: false,
        });
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_logging(&args.log_filter, args.log_format);

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "gateway-otel starting");

    // Startup and the watcher both need the file as first read.
    let file = args
        .config
        .clone()
        .map(|path| MemoizedParser::new(move || load_config(&path)));
    let config = initial_config(&args, file.as_ref().map(MemoizedParser::get))?;
    tracing::info!(
        service = %config.service_name,
        otlp = config.exporters.otlp.len(),
        prometheus = config.exporters.prometheus.len(),
        "Telemetry configuration loaded"
    );
    let registry = Arc::new(Registry::new(Telemetry::from_config(config)?));

    let _watcher = match &args.config {
        Some(path) => {
            let (mut watcher, mut updates) = ConfigWatcher::new(path);
            if let Some(Ok(current)) = file.as_ref().map(MemoizedParser::get) {
                watcher = watcher.with_current(ConfigData::clone(&current));
            }
            let watcher = watcher.run()?;
            let registry = registry.clone();
            tokio::spawn(async move {
                while let Some(config) = updates.recv().await {
                    if let Err(e) = registry.reload(config, SHUTDOWN_DEADLINE).await {
                        tracing::error!(error = %e, "Telemetry reload failed");
                    }
                }
            });
            Some(watcher)
        }
        None => None,
    };

    let gateway = Arc::new(Gateway::new(registry.clone(), args.backend.clone()));
    let app = Router::new()
        .route("/api/users/{id}", get(get_user))
        .route("/ws/echo", get(ws_echo))
        .route("/__health", get(|| async { "ok" }))
        .with_state(gateway)
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .layer(ServerTrackingLayer::new(registry.clone()))
        .layer(TraceLayer::new_for_http());

    let listener = TcpListener::bind(args.listen).await?;
    tracing::info!(address = %listener.local_addr()?, backend = %args.backend, "Gateway listening");

    let shutdown = Shutdown::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        trigger.trigger();
    });

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.wait())
        .await?;

    if let Err(e) = registry.shutdown(SHUTDOWN_DEADLINE).await {
        tracing::warn!(error = %e, "Exporters did not shut down cleanly");
    }
    tracing::info!("Shutdown complete");
    Ok(())
}
