//! Shared utilities for integration tests.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use gateway_otel::observability::{ExporterError, MetricExporter, MetricReader};
use gateway_otel::InstrumentationHandle;
use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use opentelemetry_sdk::trace::{InMemorySpanExporter, SdkTracerProvider, SpanData};
use opentelemetry_sdk::Resource;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Start a mock backend answering every request with `status` and `body`.
///
/// Returns the raw request heads it received.
pub async fn start_mock_backend(
    addr: SocketAddr,
    status: &'static str,
    body: &'static str,
) -> Arc<Mutex<Vec<String>>> {
    let listener = TcpListener::bind(addr).await.unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = seen.clone();

    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((mut socket, _)) => {
                    let log = log.clone();
                    tokio::spawn(async move {
                        let mut buf = vec![0u8; 4096];
                        let n = socket.read(&mut buf).await.unwrap_or(0);
                        log.lock()
                            .unwrap()
                            .push(String::from_utf8_lossy(&buf[..n]).to_string());
                        let response = format!(
                            "HTTP/1.1 {}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                            status,
                            body.len(),
                            body
                        );
                        let _ = socket.write_all(response.as_bytes()).await;
                        let _ = socket.shutdown().await;
                    });
                }
                Err(_) => break,
            }
        }
    });
    seen
}

struct DebugExporter(Mutex<Option<DebuggingRecorder>>);

impl MetricExporter for DebugExporter {
    fn metric_reader(
        &self,
        _period: Duration,
        _resource: &Resource,
    ) -> Result<MetricReader, ExporterError> {
        let recorder = self
            .0
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| ExporterError::Setup("recorder already taken".into()))?;
        Ok(MetricReader::new(Arc::new(recorder)))
    }

    fn metric_default_reporting(&self) -> bool {
        true
    }
}

/// An instrumentation handle recording into memory.
pub struct Recording {
    pub handle: Arc<InstrumentationHandle>,
    pub snapshotter: Snapshotter,
    pub spans: InMemorySpanExporter,
}

impl Recording {
    pub fn new() -> Self {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();
        let spans = InMemorySpanExporter::default();
        let provider = SdkTracerProvider::builder()
            .with_simple_exporter(spans.clone())
            .build();
        let handle = InstrumentationHandle::builder("gateway-it")
            .metric_exporter("debug", Arc::new(DebugExporter(Mutex::new(Some(recorder)))))
            .tracer_provider(provider)
            .build()
            .unwrap();
        Self {
            handle: Arc::new(handle),
            snapshotter,
            spans,
        }
    }

    /// Take the one snapshot of a test. Histograms are drained by it.
    pub fn metrics(&self) -> Metrics {
        let series = self
            .snapshotter
            .snapshot()
            .into_vec()
            .into_iter()
            .map(|(key, _unit, _desc, value)| {
                let key = key.key();
                let labels = key
                    .labels()
                    .map(|l| (l.key().to_string(), l.value().to_string()))
                    .collect();
                (key.name().to_string(), labels, value)
            })
            .collect();
        Metrics { series }
    }

    /// Wait until at least `count` spans finished.
    pub async fn wait_for_spans(&self, count: usize) -> Vec<SpanData> {
        for _ in 0..50 {
            let finished = self.spans.get_finished_spans().unwrap();
            if finished.len() >= count {
                return finished;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        self.spans.get_finished_spans().unwrap()
    }
}

pub struct Metrics {
    series: Vec<(String, Vec<(String, String)>, DebugValue)>,
}

#[allow(dead_code)]
impl Metrics {
    pub fn histogram_count(&self, name: &str) -> usize {
        self.series
            .iter()
            .filter(|(n, _, _)| n == name)
            .map(|(_, _, v)| match v {
                DebugValue::Histogram(samples) => samples.len(),
                _ => 0,
            })
            .sum()
    }

    pub fn histogram_values(&self, name: &str) -> Vec<f64> {
        self.series
            .iter()
            .filter(|(n, _, _)| n == name)
            .flat_map(|(_, _, v)| match v {
                DebugValue::Histogram(samples) => samples.iter().map(|s| s.0).collect(),
                _ => Vec::new(),
            })
            .collect()
    }

    pub fn counter(&self, name: &str) -> u64 {
        self.series
            .iter()
            .filter(|(n, _, _)| n == name)
            .map(|(_, _, v)| match v {
                DebugValue::Counter(c) => *c,
                _ => 0,
            })
            .sum()
    }

    /// Value of label `key` on the first series of `name`.
    pub fn label(&self, name: &str, key: &str) -> Option<String> {
        self.series
            .iter()
            .find(|(n, _, _)| n == name)
            .and_then(|(_, labels, _)| labels.iter().find(|(k, _)| k == key))
            .map(|(_, v)| v.clone())
    }

    pub fn has(&self, name: &str) -> bool {
        self.series.iter().any(|(n, _, _)| n == name)
    }
}

/// String value of a span attribute.
#[allow(dead_code)]
pub fn span_attr(span: &SpanData, key: &str) -> Option<String> {
    span.attributes
        .iter()
        .find(|kv| kv.key.as_str() == key)
        .map(|kv| kv.value.as_str().into_owned())
}

/// Wait for the server to reply to a TCP connect.
#[allow(dead_code)]
pub async fn wait_for_listener(addr: SocketAddr) {
    for _ in 0..50 {
        if tokio::net::TcpStream::connect(addr).await.is_ok() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
