//! Round trip tracking of outbound requests.

use std::error::Error;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use http::header::{CONTENT_LENGTH, USER_AGENT};
use http::{HeaderMap, Method, Request, Response, StatusCode, Uri};
use http_body::Body;
use metrics::Label;
use opentelemetry::trace::{SpanKind, Status, TraceContextExt, Tracer as _};
use opentelemetry::KeyValue;
use opentelemetry_sdk::trace::SdkTracer;

use crate::config::schema::SemanticConvention;
use crate::context::{ContextError, RequestContext};
use crate::http::client::connector::ConnectionPhases;
use crate::io::tracking::StreamTracker;
use crate::observability::attributes::{
    labels_from_key_values, method_label, request_header_attributes, response_header_attributes,
    set_label,
};
use crate::observability::handle::InstrumentationHandle;
use crate::observability::instruments::ClientInstruments;
use crate::observability::propagation::inject_context;
use crate::pipeline::outcome::Outcome;

/// Prefix of the response body read instruments.
pub const RESPONSE_READ_PREFIX: &str = "http.client.response.read.";

/// Detail of one signal (metrics or traces) of a client.
#[derive(Debug, Clone, Default)]
pub struct SignalOptions {
    /// One sample / span per round trip.
    pub round_trip: bool,
    /// Track reading the response body.
    pub read_payload: bool,
    /// Connection acquisition, DNS and TLS timings.
    pub detailed_connection: bool,
    pub static_attributes: Vec<KeyValue>,
}

impl SignalOptions {
    pub fn enabled(&self) -> bool {
        self.round_trip || self.read_payload
    }
}

/// Options of a [`RoundTripTracker`].
#[derive(Debug, Clone, Default)]
pub struct ClientOptions {
    /// Span name, and the `clientname` metric label when not empty.
    pub client_name: String,
    pub semantic_convention: SemanticConvention,
    pub metrics: SignalOptions,
    pub traces: SignalOptions,
    pub report_headers: bool,
}

impl ClientOptions {
    pub fn enabled(&self) -> bool {
        self.metrics.enabled() || self.traces.enabled()
    }
}

struct TrackerInner {
    handle: Arc<InstrumentationHandle>,
    instruments: Option<ClientInstruments>,
    metric_labels: Vec<Label>,
    tracer: Option<SdkTracer>,
    span_name: String,
    trace_attrs: Vec<KeyValue>,
    report_headers: bool,
    detailed_traces: bool,
    detailed: bool,
    body: StreamTracker,
}

/// Instruments and options shared by every round trip of one client.
#[derive(Clone)]
pub struct RoundTripTracker {
    inner: Arc<TrackerInner>,
}

impl fmt::Debug for RoundTripTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoundTripTracker")
            .field("span_name", &self.inner.span_name)
            .field("metrics", &self.inner.instruments.is_some())
            .field("traces", &self.inner.tracer.is_some())
            .finish()
    }
}

impl RoundTripTracker {
    /// `None` when neither signal has anything to report.
    pub fn new(handle: Arc<InstrumentationHandle>, opts: ClientOptions) -> Option<Self> {
        if !opts.enabled() {
            return None;
        }
        let meter = handle.meter();
        let tracer = handle.tracer();
        if meter.is_none() && tracer.is_none() {
            return None;
        }

        let instruments = meter.filter(|_| opts.metrics.round_trip).map(|m| {
            ClientInstruments::bind(m, opts.semantic_convention, opts.metrics.detailed_connection)
        });
        let mut metric_labels = labels_from_key_values(&opts.metrics.static_attributes);
        if !opts.client_name.is_empty() {
            set_label(&mut metric_labels, Label::new("clientname", opts.client_name.clone()));
        }

        let body = StreamTracker::reader(
            RESPONSE_READ_PREFIX,
            meter.filter(|_| opts.metrics.read_payload),
            tracer.filter(|_| opts.traces.read_payload),
            labels_from_key_values(&opts.metrics.static_attributes),
            opts.traces.static_attributes.clone(),
        );

        let tracer = tracer.filter(|_| opts.traces.round_trip).cloned();

        Some(Self {
            inner: Arc::new(TrackerInner {
                instruments,
                metric_labels,
                tracer,
                span_name: opts.client_name,
                trace_attrs: opts.traces.static_attributes,
                report_headers: opts.report_headers,
                detailed_traces: opts.traces.detailed_connection,
                detailed: opts.metrics.detailed_connection || opts.traces.detailed_connection,
                body,
                handle,
            }),
        })
    }

    /// Tracker of the response bodies.
    pub fn body_tracker(&self) -> &StreamTracker {
        &self.inner.body
    }

    /// Labels every round trip sample starts from.
    pub fn metric_labels(&self) -> &[Label] {
        &self.inner.metric_labels
    }

    /// Whether connection phase hooks should be installed.
    pub fn wants_connection_phases(&self) -> bool {
        self.inner.detailed
    }

    /// Begin tracking `req`, which is about to be dispatched.
    pub fn start<B: Body>(&self, cx: &RequestContext, req: &Request<B>) -> RoundTrip {
        let (server_address, server_port) = server_address_and_port(req.uri());
        let request_size = request_content_length(req);

        let span_cx = self.inner.tracer.as_ref().map(|tracer| {
            let mut attrs = self.inner.trace_attrs.clone();
            attrs.push(KeyValue::new("url.full", req.uri().to_string()));
            attrs.push(KeyValue::new("server.address", server_address.clone()));
            attrs.push(KeyValue::new("server.port", i64::from(server_port)));
            attrs.push(KeyValue::new("http.request.method", req.method().to_string()));
            if let Some(size) = request_size {
                attrs.push(KeyValue::new("http.request.body.size", size as i64));
            }
            if let Some(agent) = req.headers().get(USER_AGENT).and_then(|v| v.to_str().ok()) {
                attrs.push(KeyValue::new("user_agent.original", agent.to_string()));
            }
            if self.inner.report_headers {
                attrs.extend(request_header_attributes(req.headers()));
            }
            let span = tracer
                .span_builder(self.inner.span_name.clone())
                .with_kind(SpanKind::Client)
                .with_attributes(attrs)
                .start_with_context(tracer, cx.otel());
            cx.otel().with_span(span)
        });
        let cx = match &span_cx {
            Some(otel) => cx.with_otel(otel.clone()),
            None => cx.clone(),
        };

        RoundTrip {
            tracker: self.inner.clone(),
            cx,
            span_cx,
            method: req.method().clone(),
            server_address,
            server_port,
            request_size,
            phases: Arc::new(ConnectionPhases::default()),
            started: Instant::now(),
            finished: false,
        }
    }
}

/// One outbound request/response exchange.
///
/// Reports exactly once: on [`finish_response`](Self::finish_response),
/// [`finish_error`](Self::finish_error), or as a cancellation when dropped
/// before either.
pub struct RoundTrip {
    tracker: Arc<TrackerInner>,
    cx: RequestContext,
    span_cx: Option<opentelemetry::Context>,
    method: Method,
    server_address: String,
    server_port: u16,
    request_size: Option<u64>,
    phases: Arc<ConnectionPhases>,
    started: Instant,
    finished: bool,
}

impl fmt::Debug for RoundTrip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoundTrip")
            .field("method", &self.method)
            .field("server_address", &self.server_address)
            .field("finished", &self.finished)
            .finish()
    }
}

impl RoundTrip {
    /// Request context carrying the round trip span.
    pub fn context(&self) -> &RequestContext {
        &self.cx
    }

    pub fn phases(&self) -> &Arc<ConnectionPhases> {
        &self.phases
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// A copy of `original` with the trace context injected. `original`
    /// itself is left as is.
    pub fn outbound_headers(&self, original: &HeaderMap) -> HeaderMap {
        let mut headers = original.clone();
        if self.span_cx.is_some() {
            inject_context(self.tracker.handle.propagator(), self.cx.otel(), &mut headers);
        }
        headers
    }

    pub fn finish_response<B>(&mut self, resp: &Response<B>) {
        self.finish(Ok(resp.status()), Some(resp.headers()), None);
    }

    pub fn finish_error(&mut self, err: &(dyn Error + 'static)) {
        self.finish(Err(()), None, Some(err));
    }

    fn finish(
        &mut self,
        status: Result<StatusCode, ()>,
        resp_headers: Option<&HeaderMap>,
        err: Option<&(dyn Error + 'static)>,
    ) {
        if self.finished {
            return;
        }
        self.finished = true;
        let secs = self.started.elapsed().as_secs_f64();
        let outcome = match (&status, err) {
            (Ok(_), _) => Outcome::SUCCESS,
            (Err(()), Some(err)) => Outcome::round_trip(Some(err), Some(&self.cx)),
            (Err(()), None) => Outcome::round_trip(Some(&ContextError::Canceled), None),
        };
        let response_size = resp_headers.map(response_content_length);

        self.report_metrics(secs, &status, outcome, response_size);
        self.end_span(secs, &status, resp_headers, response_size, err);
    }

    fn report_metrics(
        &self,
        secs: f64,
        status: &Result<StatusCode, ()>,
        outcome: Outcome,
        response_size: Option<Option<u64>>,
    ) {
        let Some(instr) = &self.tracker.instruments else {
            return;
        };
        let status_code = status.as_ref().map(|s| s.as_u16()).unwrap_or(0);
        let mut labels = self.tracker.metric_labels.clone();
        set_label(&mut labels, Label::new("http.request.method", method_label(&self.method)));
        set_label(&mut labels, Label::new("server.address", self.server_address.clone()));
        set_label(&mut labels, Label::new("server.port", self.server_port.to_string()));
        set_label(
            &mut labels,
            Label::new("http.response.status_code", status_code.to_string()),
        );

        if let Some(started) = &instr.started {
            started.add(1, &labels);
        }
        if let Some(size) = self.request_size {
            if let Some(counter) = &instr.request_size {
                counter.add(size, &labels);
            }
            if let Some(hist) = &instr.request_size_hist {
                hist.record(size as f64, &labels);
            }
        }

        if outcome.canceled {
            if let Some(c) = &instr.canceled {
                c.add(1, &labels);
            }
        }
        if outcome.timed_out {
            if let Some(c) = &instr.timed_out {
                c.add(1, &labels);
            }
        }
        if outcome.failed {
            if let Some(c) = &instr.failed {
                c.add(1, &labels);
            }
        }

        instr.duration.record(secs, &labels);

        if self.method != Method::HEAD {
            match response_size {
                Some(Some(size)) => instr.response_size.record(size as f64, &labels),
                Some(None) => {
                    if let Some(c) = &instr.no_content_length {
                        c.add(1, &labels);
                    }
                }
                None => {}
            }
        }

        if let Some(h) = &instr.get_conn {
            h.record(self.phases.get_conn().as_secs_f64(), &labels);
        }
        if let Some(h) = &instr.dns {
            h.record(self.phases.dns().as_secs_f64(), &labels);
        }
        if let Some(h) = &instr.tls {
            h.record(self.phases.tls().as_secs_f64(), &labels);
        }
    }

    fn end_span(
        &mut self,
        secs: f64,
        status: &Result<StatusCode, ()>,
        resp_headers: Option<&HeaderMap>,
        response_size: Option<Option<u64>>,
        err: Option<&(dyn Error + 'static)>,
    ) {
        let Some(otel) = self.span_cx.take() else {
            return;
        };
        let span = otel.span();
        match status {
            Err(()) => {
                let msg = err
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| ContextError::Canceled.to_string());
                span.add_event(
                    "exception",
                    vec![KeyValue::new("exception.message", msg.clone())],
                );
                span.set_status(Status::error(msg));
            }
            Ok(code) => {
                span.set_attribute(KeyValue::new(
                    "http.response.status_code",
                    i64::from(code.as_u16()),
                ));
                if let Some(Some(size)) = response_size {
                    span.set_attribute(KeyValue::new("http.response.body.size", size as i64));
                }
                if self.tracker.report_headers {
                    if let Some(headers) = resp_headers {
                        for kv in response_header_attributes(headers) {
                            span.set_attribute(kv);
                        }
                    }
                }
                span.set_attribute(KeyValue::new("response-duration", secs));
                if self.tracker.detailed_traces {
                    span.set_attribute(KeyValue::new(
                        "get-conn-duration",
                        self.phases.get_conn().as_secs_f64(),
                    ));
                    span.set_attribute(KeyValue::new("dns-duration", self.phases.dns().as_secs_f64()));
                    span.set_attribute(KeyValue::new("tls-duration", self.phases.tls().as_secs_f64()));
                    if let Some(at) = self.phases.first_byte() {
                        span.add_event_with_timestamp("first-byte-time", at, Vec::new());
                    }
                }
                span.set_status(Status::Ok);
            }
        }
        span.end();
    }
}

impl Drop for RoundTrip {
    fn drop(&mut self) {
        self.finish(Err(()), None, None);
    }
}

fn request_content_length<B: Body>(req: &Request<B>) -> Option<u64> {
    req.headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .or_else(|| req.body().size_hint().exact())
}

fn response_content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

/// Host and port of `uri`, the port defaulting by scheme.
pub fn server_address_and_port(uri: &Uri) -> (String, u16) {
    let host = uri.host().unwrap_or_default().to_string();
    let port = uri.port_u16().unwrap_or_else(|| match uri.scheme_str() {
        Some("https") => 443,
        _ => 80,
    });
    (host, port)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::handle::testing::recording_handle;
    use crate::observability::meter::testing::*;
    use bytes::Bytes;
    use http_body_util::Full;
    use opentelemetry_sdk::trace::InMemorySpanExporter;

    fn options() -> ClientOptions {
        let signal = SignalOptions {
            round_trip: true,
            read_payload: true,
            detailed_connection: true,
            static_attributes: vec![KeyValue::new("http.route", "/users")],
        };
        ClientOptions {
            client_name: "/users".into(),
            semantic_convention: SemanticConvention::Legacy,
            metrics: signal.clone(),
            traces: signal,
            report_headers: false,
        }
    }

    fn tracker(opts: ClientOptions) -> (RoundTripTracker, MetricsProbe, InMemorySpanExporter) {
        let (handle, snap, spans) = recording_handle();
        let tracker = RoundTripTracker::new(Arc::new(handle), opts).unwrap();
        (tracker, snap, spans)
    }

    fn request(method: Method, body: &'static str) -> Request<Full<Bytes>> {
        Request::builder()
            .method(method)
            .uri("http://users.internal:8080/users/1")
            .header(USER_AGENT, "gateway-test")
            .body(Full::new(Bytes::from_static(body.as_bytes())))
            .unwrap()
    }

    fn response(len: Option<usize>) -> Response<()> {
        let mut builder = Response::builder().status(StatusCode::OK);
        if let Some(len) = len {
            builder = builder.header(CONTENT_LENGTH, len);
        }
        builder.body(()).unwrap()
    }

    #[test]
    fn test_disabled_options_build_nothing() {
        let (handle, _, _) = recording_handle();
        assert!(RoundTripTracker::new(Arc::new(handle), ClientOptions::default()).is_none());
        assert!(RoundTripTracker::new(Arc::new(InstrumentationHandle::disabled()), options()).is_none());
    }

    #[test]
    fn test_success_reports_once() {
        let (tracker, snap, spans) = tracker(options());
        let mut rt = tracker.start(&RequestContext::new(), &request(Method::POST, "hello"));
        rt.finish_response(&response(Some(42)));
        rt.finish_error(&std::io::Error::other("late"));
        drop(rt);

        assert_eq!(counter_total(&snap, "http.client.request.started.count"), 1);
        assert_eq!(counter_total(&snap, "http.client.request.failed.count"), 0);
        assert_eq!(counter_total(&snap, "http.client.request.size"), 5);
        assert_eq!(histogram_samples(&snap, "http.client.duration").len(), 1);
        assert_eq!(histogram_samples(&snap, "http.client.response.size"), vec![42.0]);
        assert_eq!(histogram_samples(&snap, "http.client.request.get-conn.duration").len(), 1);
        assert_eq!(
            label(&snap, "http.client.duration", "http.response.status_code").as_deref(),
            Some("200")
        );
        assert_eq!(
            label(&snap, "http.client.duration", "server.address").as_deref(),
            Some("users.internal")
        );
        assert_eq!(label(&snap, "http.client.duration", "server.port").as_deref(), Some("8080"));
        assert_eq!(label(&snap, "http.client.duration", "clientname").as_deref(), Some("/users"));

        let finished = spans.get_finished_spans().unwrap();
        assert_eq!(finished.len(), 1);
        let span = &finished[0];
        assert_eq!(span.name, "/users");
        assert_eq!(span.span_kind, SpanKind::Client);
        assert_eq!(span.status, Status::Ok);
        assert!(span
            .attributes
            .iter()
            .any(|kv| kv.key.as_str() == "url.full"
                && kv.value.as_str() == "http://users.internal:8080/users/1"));
        assert!(span.attributes.iter().any(|kv| kv.key.as_str() == "dns-duration"));
    }

    #[test]
    fn test_no_content_length() {
        let (tracker, snap, _spans) = tracker(options());
        let mut rt = tracker.start(&RequestContext::new(), &request(Method::GET, ""));
        rt.finish_response(&response(None));

        assert_eq!(counter_total(&snap, "http.client.response.no-content-length"), 1);
        assert!(histogram_samples(&snap, "http.client.response.size").is_empty());
    }

    #[test]
    fn test_head_skips_response_size() {
        let (tracker, snap, _spans) = tracker(options());
        let mut rt = tracker.start(&RequestContext::new(), &request(Method::HEAD, ""));
        rt.finish_response(&response(Some(100)));
        assert!(histogram_samples(&snap, "http.client.response.size").is_empty());
        assert_eq!(counter_total(&snap, "http.client.response.no-content-length"), 0);
    }

    #[test]
    fn test_context_timeout_is_failed_and_timed_out() {
        let (tracker, snap, spans) = tracker(options());
        let mut rt = tracker.start(&RequestContext::new(), &request(Method::GET, ""));
        rt.finish_error(&ContextError::DeadlineExceeded);

        assert_eq!(counter_total(&snap, "http.client.request.timedout.count"), 1);
        assert_eq!(counter_total(&snap, "http.client.request.failed.count"), 1);
        assert_eq!(counter_total(&snap, "http.client.request.canceled.count"), 0);
        assert_eq!(
            label(&snap, "http.client.duration", "http.response.status_code").as_deref(),
            Some("0")
        );
        let finished = spans.get_finished_spans().unwrap();
        assert!(matches!(finished[0].status, Status::Error { .. }));
    }

    #[test]
    fn test_dropped_round_trip_is_canceled() {
        let (tracker, snap, spans) = tracker(options());
        let rt = tracker.start(&RequestContext::new(), &request(Method::GET, ""));
        drop(rt);

        assert_eq!(counter_total(&snap, "http.client.request.canceled.count"), 1);
        assert_eq!(counter_total(&snap, "http.client.request.failed.count"), 0);
        assert_eq!(spans.get_finished_spans().unwrap().len(), 1);
    }

    #[test]
    fn test_outbound_headers_leave_original_untouched() {
        let (tracker, _snap, _spans) = tracker(options());
        let req = request(Method::GET, "");
        let mut rt = tracker.start(&RequestContext::new(), &req);
        let headers = rt.outbound_headers(req.headers());
        assert!(headers.contains_key("traceparent"));
        assert!(!req.headers().contains_key("traceparent"));
        rt.finish_response(&response(Some(0)));
    }

    #[test]
    fn test_v1_27_names() {
        let opts = ClientOptions {
            semantic_convention: SemanticConvention::V1_27,
            ..options()
        };
        let (tracker, snap, _spans) = tracker(opts);
        let mut rt = tracker.start(&RequestContext::new(), &request(Method::PUT, "abc"));
        rt.finish_response(&response(Some(3)));

        assert_eq!(histogram_samples(&snap, "http.client.request.duration").len(), 1);
        assert_eq!(histogram_samples(&snap, "http.client.request.body.size"), vec![3.0]);
        assert_eq!(histogram_samples(&snap, "http.client.response.body.size"), vec![3.0]);
    }

    #[test]
    fn test_server_address_defaults() {
        assert_eq!(
            server_address_and_port(&Uri::from_static("https://api.example.com/x")),
            ("api.example.com".to_string(), 443)
        );
        assert_eq!(
            server_address_and_port(&Uri::from_static("http://10.0.0.1/x")),
            ("10.0.0.1".to_string(), 80)
        );
    }
}
