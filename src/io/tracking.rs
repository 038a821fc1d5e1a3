//! Shared accounting of a tracked byte stream.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use metrics::Label;
use opentelemetry::trace::{Span as _, SpanKind, Status, Tracer as _};
use opentelemetry::KeyValue;
use opentelemetry_sdk::trace::{SdkTracer, Span};

use crate::observability::attributes::set_label;
use crate::observability::instruments::IoInstruments;
use crate::observability::meter::Meter;

/// Prefix used when none is given.
pub const DEFAULT_PREFIX: &str = "io.";
/// Default prefix of read streams.
pub const READ_PREFIX: &str = "read.";
/// Default prefix of write streams.
pub const WRITE_PREFIX: &str = "written.";

struct TrackerInner {
    instruments: Option<IoInstruments>,
    tracer: Option<SdkTracer>,
    span_name: String,
    size_attr: String,
    time_attr: String,
    trace_attrs: Vec<KeyValue>,
    ok_labels: Vec<Label>,
    err_labels: Vec<Label>,
}

/// Factory of per-stream [`Tracking`]s sharing one set of instruments.
///
/// Instruments and label sets are built once here so that wrapping a
/// stream allocates nothing but the tracking state itself.
#[derive(Clone)]
pub struct StreamTracker {
    inner: Arc<TrackerInner>,
}

impl fmt::Debug for StreamTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamTracker")
            .field("span_name", &self.inner.span_name)
            .field("metrics", &self.inner.instruments.is_some())
            .field("traces", &self.inner.tracer.is_some())
            .finish()
    }
}

impl StreamTracker {
    /// Tracker whose instruments are all named `<prefix>...`.
    ///
    /// An empty prefix falls back to [`DEFAULT_PREFIX`].
    pub fn new(
        prefix: &str,
        meter: Option<&Meter>,
        tracer: Option<&SdkTracer>,
        metric_labels: Vec<Label>,
        trace_attrs: Vec<KeyValue>,
    ) -> Self {
        Self::with_default(prefix, DEFAULT_PREFIX, meter, tracer, metric_labels, trace_attrs)
    }

    /// Tracker for streams being read; defaults to [`READ_PREFIX`].
    pub fn reader(
        prefix: &str,
        meter: Option<&Meter>,
        tracer: Option<&SdkTracer>,
        metric_labels: Vec<Label>,
        trace_attrs: Vec<KeyValue>,
    ) -> Self {
        Self::with_default(prefix, READ_PREFIX, meter, tracer, metric_labels, trace_attrs)
    }

    /// Tracker for streams being written; defaults to [`WRITE_PREFIX`].
    pub fn writer(
        prefix: &str,
        meter: Option<&Meter>,
        tracer: Option<&SdkTracer>,
        metric_labels: Vec<Label>,
        trace_attrs: Vec<KeyValue>,
    ) -> Self {
        Self::with_default(prefix, WRITE_PREFIX, meter, tracer, metric_labels, trace_attrs)
    }

    fn with_default(
        prefix: &str,
        fallback: &str,
        meter: Option<&Meter>,
        tracer: Option<&SdkTracer>,
        metric_labels: Vec<Label>,
        trace_attrs: Vec<KeyValue>,
    ) -> Self {
        let prefix = if prefix.is_empty() { fallback } else { prefix };
        let mut err_labels = metric_labels.clone();
        set_label(&mut err_labels, Label::new("error", "true"));
        Self {
            inner: Arc::new(TrackerInner {
                instruments: meter.map(|m| IoInstruments::bind(m, prefix)),
                tracer: tracer.cloned(),
                span_name: format!("{prefix}tracker"),
                size_attr: format!("{prefix}size"),
                time_attr: format!("{prefix}time"),
                trace_attrs,
                ok_labels: metric_labels,
                err_labels,
            }),
        }
    }

    /// Name of the span opened by each tracked stream.
    pub fn span_name(&self) -> &str {
        &self.inner.span_name
    }

    /// Fresh tracking state; its span will be a child of `parent`.
    pub fn track(&self, parent: &opentelemetry::Context) -> Tracking {
        Tracking {
            tracker: self.inner.clone(),
            parent: parent.clone(),
            span: None,
            started: None,
            finished: false,
            error: None,
            size: 0,
        }
    }
}

/// Accounting of one stream. Reports once, on the first of: clean end,
/// error, explicit finish or drop.
pub struct Tracking {
    tracker: Arc<TrackerInner>,
    parent: opentelemetry::Context,
    span: Option<Span>,
    started: Option<Instant>,
    finished: bool,
    error: Option<String>,
    size: u64,
}

impl fmt::Debug for Tracking {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tracking")
            .field("size", &self.size)
            .field("started", &self.started.is_some())
            .field("finished", &self.finished)
            .finish()
    }
}

impl Tracking {
    /// Mark the first transfer. Opens the span; later calls do nothing.
    pub fn start(&mut self) {
        if self.started.is_some() || self.finished {
            return;
        }
        self.started = Some(Instant::now());
        if let Some(tracer) = &self.tracker.tracer {
            let span = tracer
                .span_builder(self.tracker.span_name.clone())
                .with_kind(SpanKind::Internal)
                .with_attributes(self.tracker.trace_attrs.clone())
                .start_with_context(tracer, &self.parent);
            self.span = Some(span);
        }
    }

    pub fn add(&mut self, bytes: u64) {
        self.size += bytes;
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Record a terminal error and finish.
    pub fn fail(&mut self, err: &dyn fmt::Display) {
        if self.finished {
            return;
        }
        self.error = Some(err.to_string());
        self.finish();
    }

    /// Report size and elapsed time. Idempotent.
    pub fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        let secs = self
            .started
            .map(|s| s.elapsed().as_secs_f64())
            .unwrap_or_default();

        let labels = if self.error.is_some() {
            &self.tracker.err_labels
        } else {
            &self.tracker.ok_labels
        };
        if let Some(instr) = &self.tracker.instruments {
            instr.size.add(self.size, labels);
            instr.size_hist.record(self.size as f64, labels);
            instr.time.add(secs, labels);
            instr.time_hist.record(secs, labels);
            if self.error.is_some() {
                instr.errors.add(1, labels);
            }
        }

        if let Some(mut span) = self.span.take() {
            match &self.error {
                Some(msg) => {
                    span.add_event(
                        "exception",
                        vec![KeyValue::new("exception.message", msg.clone())],
                    );
                    span.set_status(Status::error(msg.clone()));
                }
                None => span.set_status(Status::Ok),
            }
            span.set_attribute(KeyValue::new(
                self.tracker.size_attr.clone(),
                self.size as i64,
            ));
            span.set_attribute(KeyValue::new(self.tracker.time_attr.clone(), secs));
            span.end();
        }
    }
}

impl Drop for Tracking {
    fn drop(&mut self) {
        self.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::meter::testing::*;
    use opentelemetry_sdk::trace::{InMemorySpanExporter, SdkTracerProvider};
    use opentelemetry::trace::TracerProvider as _;

    fn tracer() -> (SdkTracer, InMemorySpanExporter) {
        let exporter = InMemorySpanExporter::default();
        let provider = SdkTracerProvider::builder()
            .with_simple_exporter(exporter.clone())
            .build();
        (provider.tracer("io-test"), exporter)
    }

    #[test]
    fn test_finish_reports_once() {
        let (meter, snap) = debugging_meter();
        let tracker = StreamTracker::reader("", Some(&meter), None, Vec::new(), Vec::new());
        let mut tracking = tracker.track(&opentelemetry::Context::new());
        tracking.start();
        tracking.add(3);
        tracking.finish();
        tracking.finish();
        drop(tracking);

        assert_eq!(counter_total(&snap, "read.size"), 3);
        assert_eq!(histogram_samples(&snap, "read.size-hist"), vec![3.0]);
        assert_eq!(histogram_samples(&snap, "read.time-hist").len(), 1);
        assert_eq!(counter_total(&snap, "read.errors"), 0);
    }

    #[test]
    fn test_error_uses_error_labels() {
        let (meter, snap) = debugging_meter();
        let tracker = StreamTracker::writer(
            "",
            Some(&meter),
            None,
            vec![Label::new("backend", "users")],
            Vec::new(),
        );
        let mut tracking = tracker.track(&opentelemetry::Context::new());
        tracking.start();
        tracking.fail(&"connection reset");

        let series = series(&snap, "written.size");
        assert_eq!(series.len(), 1);
        let (labels, value) = &series[0];
        assert!(labels.contains(&("error".to_string(), "true".to_string())));
        assert!(labels.contains(&("backend".to_string(), "users".to_string())));
        assert_eq!(*value, ProbeValue::Counter(0));
        assert_eq!(counter_total(&snap, "written.errors"), 1);
    }

    #[test]
    fn test_span_starts_lazily() {
        let (tracer, spans) = tracer();
        let tracker = StreamTracker::reader(
            "http.client.response.read.",
            None,
            Some(&tracer),
            Vec::new(),
            vec![KeyValue::new("team", "edge")],
        );
        assert_eq!(tracker.span_name(), "http.client.response.read.tracker");

        let untouched = tracker.track(&opentelemetry::Context::new());
        drop(untouched);
        assert!(spans.get_finished_spans().unwrap().is_empty());

        let mut tracking = tracker.track(&opentelemetry::Context::new());
        tracking.start();
        tracking.add(5);
        tracking.finish();

        let finished = spans.get_finished_spans().unwrap();
        assert_eq!(finished.len(), 1);
        let span = &finished[0];
        assert_eq!(span.name, "http.client.response.read.tracker");
        assert_eq!(span.status, Status::Ok);
        assert!(span
            .attributes
            .iter()
            .any(|kv| kv.key.as_str() == "http.client.response.read.size"
                && kv.value == opentelemetry::Value::I64(5)));
        assert!(span.attributes.iter().any(|kv| kv.key.as_str() == "team"));
    }

    #[test]
    fn test_disabled_tracker_is_silent() {
        let tracker = StreamTracker::new("", None, None, Vec::new(), Vec::new());
        let mut tracking = tracker.track(&opentelemetry::Context::new());
        tracking.start();
        tracking.add(10);
        tracking.finish();
        assert_eq!(tracking.size(), 10);
        assert_eq!(tracker.span_name(), "io.tracker");
    }
}
