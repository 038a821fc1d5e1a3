//! Configuration schema definitions.
//!
//! This module defines the complete telemetry configuration tree. All types
//! derive Serde traits for deserialization from config files or from the
//! host's already decoded `extra_config` section.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Paths that are never instrumented when no skip list is configured.
pub const DEFAULT_SKIP_PATHS: [&str; 4] = ["/__health", "/__debug/", "/__echo/", "/__stats/"];

/// Root configuration for the telemetry engine.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ConfigData {
    /// Reported as the `service.name` resource attribute.
    pub service_name: String,

    /// Reported as the `service.version` resource attribute.
    pub service_version: String,

    /// Per-stage instrumentation detail.
    pub layers: LayersOpts,

    /// Named exporter instances.
    pub exporters: Exporters,

    /// Endpoints that bypass instrumentation entirely (exact match).
    pub skip_paths: Vec<String>,

    /// Metric push interval in seconds.
    pub metric_reporting_period: u64,

    /// Ratio of sampled traces. Values outside `(0, 1)` sample everything.
    pub trace_sample_rate: f64,
}

impl Default for ConfigData {
    fn default() -> Self {
        Self {
            service_name: "gateway".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            layers: LayersOpts::default(),
            exporters: Exporters::default(),
            skip_paths: default_skip_paths(),
            metric_reporting_period: 30,
            trace_sample_rate: 1.0,
        }
    }
}

impl ConfigData {
    /// Fill fields left empty by a partial document.
    ///
    /// An empty skip list falls back to [`DEFAULT_SKIP_PATHS`]; a list with
    /// a single empty string disables skipping.
    pub fn apply_defaults(&mut self) {
        if self.skip_paths.is_empty() {
            self.skip_paths = default_skip_paths();
        }
        if self.service_name.is_empty() {
            self.service_name = "gateway".to_string();
        }
        if self.metric_reporting_period == 0 {
            self.metric_reporting_period = 30;
        }
    }

    /// Metric push interval.
    pub fn reporting_period(&self) -> Duration {
        Duration::from_secs(self.metric_reporting_period)
    }
}

fn default_skip_paths() -> Vec<String> {
    DEFAULT_SKIP_PATHS.iter().map(|p| p.to_string()).collect()
}

/// Level of telemetry detail for each gateway stage.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct LayersOpts {
    /// Inbound HTTP handling.
    pub global: GlobalOpts,

    /// Endpoint pipeline ("proxy") stage.
    pub proxy: PipeOpts,

    /// Backend calls.
    pub backend: BackendOpts,
}

/// Options for the inbound HTTP handler stage.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct GlobalOpts {
    pub disable_metrics: bool,
    pub disable_traces: bool,
    /// Ignore trace context sent by callers.
    pub disable_propagation: bool,
    pub report_headers: bool,
    pub metrics_static_attributes: Attributes,
    pub traces_static_attributes: Attributes,
    pub semantic_convention: SemanticConvention,
}

/// Options for the pipeline stage.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct PipeOpts {
    pub disable_metrics: bool,
    pub disable_traces: bool,
    pub report_headers: bool,
    pub metrics_static_attributes: Attributes,
    pub traces_static_attributes: Attributes,
}

impl PipeOpts {
    /// Whether metrics or traces are reported for this stage.
    pub fn enabled(&self) -> bool {
        !self.disable_metrics || !self.disable_traces
    }
}

/// Options for backend requests.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct BackendOpts {
    pub metrics: BackendMetricOpts,
    pub traces: BackendTraceOpts,
}

impl BackendOpts {
    /// Whether any backend metric or trace is reported.
    pub fn enabled(&self) -> bool {
        self.metrics.enabled() || self.traces.enabled()
    }
}

/// Metric detail for the backend stage.
///
/// `disable_stage` turns off the stage duration metric; `round_trip`
/// reports the HTTP exchange itself, `read_payload` the body reading and
/// `detailed_connection` the connection setup phases.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct BackendMetricOpts {
    pub disable_stage: bool,
    pub round_trip: bool,
    pub read_payload: bool,
    pub detailed_connection: bool,
    pub static_attributes: Attributes,
}

impl Default for BackendMetricOpts {
    fn default() -> Self {
        Self {
            disable_stage: false,
            round_trip: true,
            read_payload: true,
            detailed_connection: true,
            static_attributes: Attributes::default(),
        }
    }
}

impl BackendMetricOpts {
    pub fn enabled(&self) -> bool {
        !self.disable_stage || self.round_trip || self.read_payload || self.detailed_connection
    }
}

/// Trace detail for the backend stage.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct BackendTraceOpts {
    pub disable_stage: bool,
    pub round_trip: bool,
    pub read_payload: bool,
    pub detailed_connection: bool,
    pub static_attributes: Attributes,
    pub report_headers: bool,
}

impl Default for BackendTraceOpts {
    fn default() -> Self {
        Self {
            disable_stage: false,
            round_trip: true,
            read_payload: true,
            detailed_connection: true,
            static_attributes: Attributes::default(),
            report_headers: false,
        }
    }
}

impl BackendTraceOpts {
    pub fn enabled(&self) -> bool {
        !self.disable_stage || self.round_trip || self.read_payload || self.detailed_connection
    }
}

/// A single static attribute.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct Attribute {
    pub key: String,
    pub value: String,
}

impl Attribute {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Ordered list of static attributes.
///
/// Order is preserved and duplicates are kept; validation rejects
/// duplicate keys at load time.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct Attributes(pub Vec<Attribute>);

/// Returned by [`Attributes::to_map`] when a key appears twice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateKey(pub String);

impl Attributes {
    pub fn new(attrs: Vec<Attribute>) -> Self {
        Self(attrs)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Attribute> {
        self.0.iter()
    }

    /// Entries with both a key and a value; empty ones are never reported.
    pub fn reportable(&self) -> impl Iterator<Item = &Attribute> {
        self.0
            .iter()
            .filter(|a| !a.key.is_empty() && !a.value.is_empty())
    }

    /// Concatenate two lists, `self` first.
    pub fn concat(&self, other: &Attributes) -> Attributes {
        let mut merged = Vec::with_capacity(self.len() + other.len());
        merged.extend(self.0.iter().cloned());
        merged.extend(other.0.iter().cloned());
        Attributes(merged)
    }

    /// Build a lookup map; the last value wins but a duplicate key is
    /// reported as an error.
    pub fn to_map(&self) -> Result<HashMap<String, String>, DuplicateKey> {
        let mut map = HashMap::with_capacity(self.len());
        let mut duplicate = None;
        for attr in &self.0 {
            if map.insert(attr.key.clone(), attr.value.clone()).is_some() && duplicate.is_none() {
                duplicate = Some(attr.key.clone());
            }
        }
        match duplicate {
            Some(key) => Err(DuplicateKey(key)),
            None => Ok(map),
        }
    }
}

/// Metric naming scheme.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(from = "String", into = "String")]
pub enum SemanticConvention {
    /// The gateway's own historical names.
    #[default]
    Legacy,
    /// OpenTelemetry HTTP semantic conventions v1.27.
    V1_27,
}

impl From<String> for SemanticConvention {
    fn from(value: String) -> Self {
        match value.as_str() {
            "1.27" => SemanticConvention::V1_27,
            _ => SemanticConvention::Legacy,
        }
    }
}

impl From<SemanticConvention> for String {
    fn from(value: SemanticConvention) -> Self {
        value.to_string()
    }
}

impl fmt::Display for SemanticConvention {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SemanticConvention::Legacy => Ok(()),
            SemanticConvention::V1_27 => write!(f, "1.27"),
        }
    }
}

/// Exporter instances, referenced by their unique name.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct Exporters {
    pub otlp: Vec<OtlpExporterConfig>,
    pub prometheus: Vec<PrometheusExporterConfig>,
}

/// OTLP collector exporter.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct OtlpExporterConfig {
    pub name: String,
    pub host: String,
    pub port: u16,
    /// HTTP/protobuf instead of gRPC.
    pub use_http: bool,
    pub disable_metrics: bool,
    pub disable_traces: bool,
    /// Overrides the global reporting period when at least one second.
    pub custom_reporting_period: u64,
}

impl Default for OtlpExporterConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            host: "localhost".to_string(),
            port: 4317,
            use_http: false,
            disable_metrics: false,
            disable_traces: false,
            custom_reporting_period: 0,
        }
    }
}

/// Prometheus scrape endpoint.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct PrometheusExporterConfig {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub disable_metrics: bool,
}

impl Default for PrometheusExporterConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            host: "0.0.0.0".to_string(),
            port: 9090,
            disable_metrics: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_enable_everything() {
        let cfg = ConfigData::default();
        assert!(!cfg.layers.global.disable_metrics);
        assert!(!cfg.layers.global.disable_traces);
        assert!(cfg.layers.proxy.enabled());
        assert!(cfg.layers.backend.metrics.round_trip);
        assert!(cfg.layers.backend.traces.detailed_connection);
        assert_eq!(cfg.metric_reporting_period, 30);
        assert_eq!(cfg.trace_sample_rate, 1.0);
        assert_eq!(cfg.skip_paths.len(), 4);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let cfg: ConfigData = toml::from_str(
            r#"
            service_name = "edge"

            [layers.backend.metrics]
            round_trip = false
            "#,
        )
        .unwrap();
        assert_eq!(cfg.service_name, "edge");
        assert!(!cfg.layers.backend.metrics.round_trip);
        assert!(cfg.layers.backend.metrics.read_payload);
        assert!(cfg.layers.backend.traces.round_trip);
    }

    #[test]
    fn test_empty_skip_paths_fall_back() {
        let mut cfg: ConfigData = serde_json::from_str(r#"{"skip_paths": []}"#).unwrap();
        cfg.apply_defaults();
        assert_eq!(cfg.skip_paths, default_skip_paths());

        let mut cfg: ConfigData = serde_json::from_str(r#"{"skip_paths": [""]}"#).unwrap();
        cfg.apply_defaults();
        assert_eq!(cfg.skip_paths, vec![String::new()]);
    }

    #[test]
    fn test_semantic_convention_parsing() {
        let g: GlobalOpts = serde_json::from_str(r#"{"semantic_convention": "1.27"}"#).unwrap();
        assert_eq!(g.semantic_convention, SemanticConvention::V1_27);
        let g: GlobalOpts = serde_json::from_str(r#"{"semantic_convention": "9.99"}"#).unwrap();
        assert_eq!(g.semantic_convention, SemanticConvention::Legacy);
    }

    #[test]
    fn test_attributes_to_map_reports_duplicates() {
        let attrs = Attributes::new(vec![
            Attribute::new("a", "1"),
            Attribute::new("b", "2"),
            Attribute::new("a", "3"),
        ]);
        assert_eq!(attrs.to_map(), Err(DuplicateKey("a".into())));

        let attrs = Attributes::new(vec![Attribute::new("a", "1")]);
        assert_eq!(attrs.to_map().unwrap().get("a").map(String::as_str), Some("1"));
    }

    #[test]
    fn test_reportable_skips_empty_entries() {
        let attrs = Attributes::new(vec![
            Attribute::new("", "x"),
            Attribute::new("k", ""),
            Attribute::new("k", "v"),
        ]);
        assert_eq!(attrs.reportable().count(), 1);
    }

    #[test]
    fn test_exporter_defaults() {
        let e: Exporters = serde_json::from_str(
            r#"{"otlp": [{"name": "local"}], "prometheus": [{"name": "scrape"}]}"#,
        )
        .unwrap();
        assert_eq!(e.otlp[0].port, 4317);
        assert_eq!(e.otlp[0].host, "localhost");
        assert_eq!(e.prometheus[0].port, 9090);
    }
}
