//! OTLP collector exporter (gRPC or HTTP/protobuf).

use std::sync::Arc;
use std::time::Duration;

use opentelemetry::metrics::MeterProvider as _;
use opentelemetry_otlp::{Protocol, WithExportConfig};
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use opentelemetry_sdk::trace::TracerProviderBuilder;
use opentelemetry_sdk::Resource;
use url::Url;

use super::bridge::OtelRecorder;
use super::{ExporterError, MetricExporter, MetricReader, TraceExporter};
use crate::config::schema::OtlpExporterConfig;

/// Instrumentation scope of the metrics pushed to a collector.
const METER_NAME: &str = "gateway-otel";

/// Pushes metrics and spans to an OpenTelemetry collector.
#[derive(Debug, Clone)]
pub struct OtlpExporter {
    config: OtlpExporterConfig,
    endpoint: Url,
}

impl OtlpExporter {
    /// Validate the collector address.
    ///
    /// A host without scheme is reached over plain `http`.
    pub fn new(config: OtlpExporterConfig) -> Result<Self, ExporterError> {
        let raw = if config.host.starts_with("http://") || config.host.starts_with("https://") {
            format!("{}:{}", config.host, config.port)
        } else {
            format!("http://{}:{}", config.host, config.port)
        };
        let endpoint = Url::parse(&raw).map_err(|e| ExporterError::InvalidEndpoint {
            endpoint: raw.clone(),
            reason: e.to_string(),
        })?;
        Ok(Self { config, endpoint })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// The exporter's own period when set to at least a second.
    pub fn reporting_period(&self, default: Duration) -> Duration {
        if self.config.custom_reporting_period >= 1 {
            Duration::from_secs(self.config.custom_reporting_period)
        } else {
            default
        }
    }

    fn signal_endpoint(&self, signal: &str) -> String {
        let base = self.endpoint.as_str().trim_end_matches('/');
        if self.config.use_http {
            format!("{base}/v1/{signal}")
        } else {
            base.to_string()
        }
    }
}

impl MetricExporter for OtlpExporter {
    fn metric_reader(
        &self,
        period: Duration,
        resource: &Resource,
    ) -> Result<MetricReader, ExporterError> {
        let endpoint = self.signal_endpoint("metrics");
        let exporter = if self.config.use_http {
            opentelemetry_otlp::MetricExporter::builder()
                .with_http()
                .with_protocol(Protocol::HttpBinary)
                .with_endpoint(endpoint.clone())
                .build()
        } else {
            opentelemetry_otlp::MetricExporter::builder()
                .with_tonic()
                .with_endpoint(endpoint.clone())
                .build()
        }
        .map_err(|e| ExporterError::Setup(e.to_string()))?;

        let period = self.reporting_period(period);
        let reader = PeriodicReader::builder(exporter)
            .with_interval(period)
            .build();
        let provider = SdkMeterProvider::builder()
            .with_resource(resource.clone())
            .with_reader(reader)
            .build();
        let recorder = OtelRecorder::new(provider.meter(METER_NAME));

        tracing::info!(
            exporter = %self.config.name,
            endpoint = %endpoint,
            period_secs = period.as_secs(),
            "OTLP metric reader started"
        );

        Ok(MetricReader::new(Arc::new(recorder)).with_closer(move || {
            provider
                .shutdown()
                .map_err(|e| ExporterError::Shutdown(e.to_string()))
        }))
    }

    fn metric_default_reporting(&self) -> bool {
        !self.config.disable_metrics
    }
}

impl TraceExporter for OtlpExporter {
    fn attach_span_exporter(
        &self,
        builder: TracerProviderBuilder,
    ) -> Result<TracerProviderBuilder, ExporterError> {
        let endpoint = self.signal_endpoint("traces");
        let exporter = if self.config.use_http {
            opentelemetry_otlp::SpanExporter::builder()
                .with_http()
                .with_protocol(Protocol::HttpBinary)
                .with_endpoint(endpoint.clone())
                .build()
        } else {
            opentelemetry_otlp::SpanExporter::builder()
                .with_tonic()
                .with_endpoint(endpoint.clone())
                .build()
        }
        .map_err(|e| ExporterError::Setup(e.to_string()))?;

        tracing::info!(exporter = %self.config.name, endpoint = %endpoint, "OTLP span exporter attached");
        Ok(builder.with_batch_exporter(exporter))
    }

    fn trace_default_reporting(&self) -> bool {
        !self.config.disable_traces
    }
}
