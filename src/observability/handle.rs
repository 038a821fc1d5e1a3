//! The instrumentation handle: meter, tracer and propagator of one
//! configuration generation.
//!
//! # Responsibilities
//! - Build the tracer provider and the metric fan-out from the exporters
//! - Hand out the meter, tracer and propagator to the trackers
//! - Flush and close every exporter once, within a deadline
//!
//! # Design Decisions
//! - A missing meter or tracer is the disabled path, never an error
//! - Sampling is parent based only for ratios strictly between 0 and 1

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use opentelemetry::propagation::TextMapCompositePropagator;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::KeyValue;
use opentelemetry_sdk::trace::{Sampler, SdkTracer, SdkTracerProvider};
use opentelemetry_sdk::Resource;

use crate::config::schema::ConfigData;
use crate::observability::exporter::{
    ExporterError, ExporterSet, MetricExporter, MetricReader, TraceExporter,
};
use crate::observability::meter::{Meter, SharedRecorder};
use crate::observability::propagation::default_propagator;

/// Instrumentation scope name of every span.
pub const TRACER_NAME: &str = "gateway-otel";

/// Sampler for a configured ratio.
pub fn sampler_for(rate: f64) -> Sampler {
    if rate > 0.0 && rate < 1.0 {
        Sampler::ParentBased(Box::new(Sampler::TraceIdRatioBased(rate)))
    } else {
        Sampler::AlwaysOn
    }
}

/// Meter, tracer and propagator shared by every tracker.
pub struct InstrumentationHandle {
    meter: Option<Meter>,
    tracer: Option<SdkTracer>,
    propagator: TextMapCompositePropagator,
    tracer_provider: Option<SdkTracerProvider>,
    readers: Mutex<Vec<MetricReader>>,
    shut_down: AtomicBool,
}

impl std::fmt::Debug for InstrumentationHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstrumentationHandle")
            .field("metrics", &self.meter.is_some())
            .field("traces", &self.tracer.is_some())
            .field("shut_down", &self.shut_down.load(Ordering::Relaxed))
            .finish()
    }
}

impl InstrumentationHandle {
    pub fn builder(service_name: impl Into<String>) -> HandleBuilder {
        HandleBuilder::new(service_name)
    }

    /// Build a handle from configuration and already created exporters.
    pub fn from_config(config: &ConfigData, exporters: ExporterSet) -> Result<Self, ExporterError> {
        HandleBuilder::new(config.service_name.clone())
            .service_version(config.service_version.clone())
            .reporting_period(config.reporting_period())
            .trace_sample_rate(config.trace_sample_rate)
            .exporters(exporters)
            .build()
    }

    /// A handle with nothing to report into.
    pub fn disabled() -> Self {
        Self {
            meter: None,
            tracer: None,
            propagator: default_propagator(),
            tracer_provider: None,
            readers: Mutex::new(Vec::new()),
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn meter(&self) -> Option<&Meter> {
        self.meter.as_ref()
    }

    pub fn tracer(&self) -> Option<&SdkTracer> {
        self.tracer.as_ref()
    }

    pub fn propagator(&self) -> &TextMapCompositePropagator {
        &self.propagator
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Flush and close every exporter.
    ///
    /// Only the first call does any work. Exporters still busy when
    /// `deadline` passes are abandoned; the remaining ones are closed
    /// regardless of earlier failures.
    pub async fn shutdown(&self, deadline: Duration) -> Result<(), ExporterError> {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let readers = std::mem::take(
            &mut *self.readers.lock().unwrap_or_else(PoisonError::into_inner),
        );
        let provider = self.tracer_provider.clone();

        let work = tokio::task::spawn_blocking(move || {
            let mut failures = Vec::new();
            for reader in readers {
                if let Err(e) = reader.shutdown() {
                    failures.push(e.to_string());
                }
            }
            if let Some(provider) = provider {
                if let Err(e) = provider.shutdown() {
                    failures.push(e.to_string());
                }
            }
            failures
        });

        match tokio::time::timeout(deadline, work).await {
            Ok(Ok(failures)) if failures.is_empty() => {
                tracing::info!("Instrumentation shut down");
                Ok(())
            }
            Ok(Ok(failures)) => {
                let msg = failures.join("; ");
                tracing::warn!(error = %msg, "Instrumentation shut down with errors");
                Err(ExporterError::Shutdown(msg))
            }
            Ok(Err(join)) => Err(ExporterError::Shutdown(join.to_string())),
            Err(_) => {
                tracing::warn!(deadline = ?deadline, "Instrumentation shutdown deadline exceeded");
                Err(ExporterError::ShutdownTimedOut(deadline))
            }
        }
    }
}

/// Builder of [`InstrumentationHandle`].
pub struct HandleBuilder {
    service_name: String,
    service_version: String,
    reporting_period: Duration,
    sample_rate: f64,
    exporters: ExporterSet,
    provider_override: Option<SdkTracerProvider>,
}

impl HandleBuilder {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            service_version: String::new(),
            reporting_period: Duration::from_secs(30),
            sample_rate: 1.0,
            exporters: ExporterSet::new(),
            provider_override: None,
        }
    }

    pub fn service_version(mut self, version: impl Into<String>) -> Self {
        self.service_version = version.into();
        self
    }

    pub fn reporting_period(mut self, period: Duration) -> Self {
        self.reporting_period = period;
        self
    }

    pub fn trace_sample_rate(mut self, rate: f64) -> Self {
        self.sample_rate = rate;
        self
    }

    pub fn exporters(mut self, exporters: ExporterSet) -> Self {
        self.exporters = exporters;
        self
    }

    pub fn metric_exporter(
        mut self,
        name: impl Into<String>,
        exporter: Arc<dyn MetricExporter>,
    ) -> Self {
        self.exporters = self.exporters.with_metric_exporter(name, exporter);
        self
    }

    pub fn trace_exporter(
        mut self,
        name: impl Into<String>,
        exporter: Arc<dyn TraceExporter>,
    ) -> Self {
        self.exporters = self.exporters.with_trace_exporter(name, exporter);
        self
    }

    /// Use an already built tracer provider instead of the trace exporters.
    pub fn tracer_provider(mut self, provider: SdkTracerProvider) -> Self {
        self.provider_override = Some(provider);
        self
    }

    fn resource(&self) -> Resource {
        let mut builder = Resource::builder().with_service_name(self.service_name.clone());
        if !self.service_version.is_empty() {
            builder = builder.with_attribute(KeyValue::new(
                "service.version",
                self.service_version.clone(),
            ));
        }
        builder.build()
    }

    /// Create readers and span exporters for every exporter reporting by
    /// default. Fails on the first exporter that cannot be set up.
    pub fn build(self) -> Result<InstrumentationHandle, ExporterError> {
        let resource = self.resource();

        let mut readers = Vec::new();
        for (index, (name, exporter)) in self.exporters.metrics.iter().enumerate() {
            if !exporter.metric_default_reporting() {
                tracing::debug!(exporter = %name, "Metrics disabled for exporter");
                continue;
            }
            let reader = exporter
                .metric_reader(self.reporting_period, &resource)
                .map_err(|e| ExporterError::Build {
                    kind: "metric",
                    name: name.clone(),
                    index,
                    source: Box::new(e),
                })?;
            readers.push(reader);
        }
        let recorders: Vec<SharedRecorder> = readers.iter().map(MetricReader::recorder).collect();
        let meter = Meter::new(recorders);

        let tracer_provider = match self.provider_override {
            Some(provider) => Some(provider),
            None => {
                let mut builder = SdkTracerProvider::builder()
                    .with_resource(resource)
                    .with_sampler(sampler_for(self.sample_rate));
                let mut attached = 0;
                for (index, (name, exporter)) in self.exporters.traces.iter().enumerate() {
                    if !exporter.trace_default_reporting() {
                        tracing::debug!(exporter = %name, "Traces disabled for exporter");
                        continue;
                    }
                    builder = exporter.attach_span_exporter(builder).map_err(|e| {
                        ExporterError::Build {
                            kind: "trace",
                            name: name.clone(),
                            index,
                            source: Box::new(e),
                        }
                    })?;
                    attached += 1;
                }
                (attached > 0).then(|| builder.build())
            }
        };
        let tracer = tracer_provider.as_ref().map(|p| p.tracer(TRACER_NAME));

        tracing::info!(
            service = %self.service_name,
            metric_readers = readers.len(),
            traces = tracer.is_some(),
            "Instrumentation handle built"
        );

        Ok(InstrumentationHandle {
            meter,
            tracer,
            propagator: default_propagator(),
            tracer_provider,
            readers: Mutex::new(readers),
            shut_down: AtomicBool::new(false),
        })
    }
}
