//! Configuration files driving exporters and hot reload.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use gateway_otel::config::load_config;
use gateway_otel::{ConfigData, Registry, ServerTrackingLayer, Telemetry};
use tokio::net::TcpListener;

mod common;
use common::Recording;

fn write_config(name: &str, content: &str) -> PathBuf {
    let path = std::env::temp_dir().join(format!("gateway-otel-{}-{name}", std::process::id()));
    std::fs::write(&path, content).unwrap();
    path
}

async fn serve(registry: Arc<Registry>) -> SocketAddr {
    let app = Router::new()
        .route("/ping", get(|| async { "pong" }))
        .layer(ServerTrackingLayer::new(registry));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

#[tokio::test]
async fn test_config_file_drives_prometheus_scrape() {
    let path = write_config(
        "scrape.toml",
        r#"
        service_name = "edge"

        [[exporters.prometheus]]
        name = "local"
        host = "127.0.0.1"
        port = 28421

        [[layers.global.metrics_static_attributes]]
        key = "env"
        value = "prod"
        "#,
    );
    let config = load_config(&path).unwrap();
    std::fs::remove_file(&path).unwrap();

    let registry = Arc::new(Registry::new(Telemetry::from_config(config).unwrap()));
    let gateway = serve(registry.clone()).await;
    let body = reqwest::get(format!("http://{gateway}/ping"))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(body, "pong");
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut scraped = String::new();
    for _ in 0..20 {
        if let Ok(resp) = reqwest::get("http://127.0.0.1:28421/metrics").await {
            scraped = resp.text().await.unwrap();
            if scraped.contains("http_server_duration") {
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(scraped.contains("http_server_duration_bucket"), "{scraped}");
    assert!(scraped.contains("env=\"prod\""), "{scraped}");

    registry.shutdown(Duration::from_secs(2)).await.unwrap();
}

#[tokio::test]
async fn test_reload_applies_to_running_server() {
    let recording = Recording::new();
    let registry = Arc::new(Registry::new(Telemetry::new(
        ConfigData::default(),
        recording.handle.clone(),
    )));
    let gateway = serve(registry.clone()).await;

    let path = write_config(
        "reload.json",
        r#"{"layers": {"global": {"disable_metrics": true, "disable_traces": true}}}"#,
    );
    let config = load_config(&path).unwrap();
    std::fs::remove_file(&path).unwrap();
    registry.reload(config, Duration::from_secs(1)).await.unwrap();
    assert!(Arc::ptr_eq(registry.snapshot().handle(), &recording.handle));

    reqwest::get(format!("http://{gateway}/ping"))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(recording.spans.get_finished_spans().unwrap().is_empty());
    assert!(!recording.metrics().has("http.server.duration"));
}

#[test]
fn test_invalid_config_is_rejected() {
    let path = write_config(
        "invalid.json",
        r#"{"exporters": {"otlp": [{"name": "a"}], "prometheus": [{"name": "a"}]}}"#,
    );
    let result = load_config(&path);
    std::fs::remove_file(&path).unwrap();
    assert!(result.is_err());
}
