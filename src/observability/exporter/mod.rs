//! Exporter collaborators.
//!
//! An exporter is anything that can hand out a metric recorder, a span
//! exporter, or both. The engine only talks to the two traits below, so
//! adding a backend never touches the trackers.
//!
//! # Data Flow
//! ```text
//! ConfigData.exporters
//!     → ExporterSet::from_config (one instance per named exporter)
//!     → HandleBuilder (selects the ones reporting by default)
//!     → MetricReader recorders fanned out by the Meter
//!     → span exporters attached to the tracer provider
//! ```

pub mod bridge;
pub mod otlp;
pub mod prometheus;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use opentelemetry_sdk::trace::TracerProviderBuilder;
use opentelemetry_sdk::Resource;
use thiserror::Error;

use crate::config::schema::Exporters;
use crate::observability::meter::SharedRecorder;

pub use otlp::OtlpExporter;
pub use prometheus::PrometheusExporter;

/// Errors raised while building or closing exporters.
#[derive(Debug, Error)]
pub enum ExporterError {
    #[error("{kind} exporter {name} (at idx {index}) failed: {source}")]
    Build {
        kind: &'static str,
        name: String,
        index: usize,
        #[source]
        source: Box<ExporterError>,
    },

    #[error("invalid exporter endpoint {endpoint}: {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },

    #[error("exporter setup failed: {0}")]
    Setup(String),

    #[error("exporter shutdown failed: {0}")]
    Shutdown(String),

    #[error("exporter shutdown did not finish within {0:?}")]
    ShutdownTimedOut(Duration),
}

type Closer = Box<dyn FnOnce() -> Result<(), ExporterError> + Send>;

/// A recorder plus whatever must run to flush and release it.
pub struct MetricReader {
    recorder: SharedRecorder,
    closer: Option<Closer>,
}

impl fmt::Debug for MetricReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricReader")
            .field("closer", &self.closer.is_some())
            .finish()
    }
}

impl MetricReader {
    pub fn new(recorder: SharedRecorder) -> Self {
        Self {
            recorder,
            closer: None,
        }
    }

    /// Run `closer` on shutdown.
    pub fn with_closer<F>(mut self, closer: F) -> Self
    where
        F: FnOnce() -> Result<(), ExporterError> + Send + 'static,
    {
        self.closer = Some(Box::new(closer));
        self
    }

    pub fn recorder(&self) -> SharedRecorder {
        self.recorder.clone()
    }

    /// Flush and release the reader. Consumes it, so it runs once.
    pub fn shutdown(self) -> Result<(), ExporterError> {
        match self.closer {
            Some(close) => close(),
            None => Ok(()),
        }
    }
}

/// A collaborator producing metric readers.
pub trait MetricExporter: Send + Sync {
    /// A reader pushing (or serving) at `period`.
    fn metric_reader(
        &self,
        period: Duration,
        resource: &Resource,
    ) -> Result<MetricReader, ExporterError>;

    /// Whether metrics go to this exporter unless told otherwise.
    fn metric_default_reporting(&self) -> bool;
}

/// A collaborator producing span exporters.
pub trait TraceExporter: Send + Sync {
    /// Attach this exporter's span processor to `builder`.
    fn attach_span_exporter(
        &self,
        builder: TracerProviderBuilder,
    ) -> Result<TracerProviderBuilder, ExporterError>;

    /// Whether spans go to this exporter unless told otherwise.
    fn trace_default_reporting(&self) -> bool;
}

/// Named exporter instances, in configuration order.
#[derive(Default, Clone)]
pub struct ExporterSet {
    pub(crate) metrics: Vec<(String, Arc<dyn MetricExporter>)>,
    pub(crate) traces: Vec<(String, Arc<dyn TraceExporter>)>,
}

impl fmt::Debug for ExporterSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExporterSet")
            .field("metrics", &self.metric_names())
            .field("traces", &self.trace_names())
            .finish()
    }
}

impl ExporterSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Instantiate every exporter named in `exporters`.
    ///
    /// OTLP instances serve both signals, Prometheus ones only metrics.
    /// Failures carry the exporter kind, name and position.
    pub fn from_config(exporters: &Exporters) -> Result<Self, ExporterError> {
        let mut set = Self::new();
        for (index, cfg) in exporters.otlp.iter().enumerate() {
            let exporter = OtlpExporter::new(cfg.clone()).map_err(|e| ExporterError::Build {
                kind: "OTLP",
                name: cfg.name.clone(),
                index,
                source: Box::new(e),
            })?;
            let exporter = Arc::new(exporter);
            set.metrics.push((cfg.name.clone(), exporter.clone()));
            set.traces.push((cfg.name.clone(), exporter));
        }
        for cfg in exporters.prometheus.iter() {
            let exporter = Arc::new(PrometheusExporter::new(cfg.clone()));
            set.metrics.push((cfg.name.clone(), exporter));
        }
        Ok(set)
    }

    pub fn with_metric_exporter(
        mut self,
        name: impl Into<String>,
        exporter: Arc<dyn MetricExporter>,
    ) -> Self {
        self.metrics.push((name.into(), exporter));
        self
    }

    pub fn with_trace_exporter(
        mut self,
        name: impl Into<String>,
        exporter: Arc<dyn TraceExporter>,
    ) -> Self {
        self.traces.push((name.into(), exporter));
        self
    }

    pub fn metric_names(&self) -> Vec<&str> {
        self.metrics.iter().map(|(n, _)| n.as_str()).collect()
    }

    pub fn trace_names(&self) -> Vec<&str> {
        self.traces.iter().map(|(n, _)| n.as_str()).collect()
    }

    pub fn metric_exporter(&self, name: &str) -> Option<Arc<dyn MetricExporter>> {
        self.metrics
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, e)| e.clone())
    }

    pub fn trace_exporter(&self, name: &str) -> Option<Arc<dyn TraceExporter>> {
        self.traces
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, e)| e.clone())
    }
}
