//! Tracking of inbound requests.
//!
//! A [`RequestTracking`] is shared by the layer, the response body and
//! whatever handler picks it out of the request extensions. Reporting
//! happens once, on the first of:
//! - the response body reaching its end or failing
//! - a hijack of the connection (see [`HijackHandle`])
//! - the last clone of the tracking going away

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use http::header::{
    AUTHORIZATION, COOKIE, FORWARDED, HOST, PROXY_AUTHORIZATION, SET_COOKIE, USER_AGENT,
};
use http::uri::Scheme;
use http::{HeaderMap, HeaderName, Method, Request, StatusCode};
use metrics::Label;
use opentelemetry::trace::{SpanKind, Status, TraceContextExt, Tracer as _};
use opentelemetry::KeyValue;
use opentelemetry_sdk::trace::SdkTracer;

use crate::config::resolver::ConfigResolver;
use crate::context::RequestContext;
use crate::observability::attributes::{
    extend_key_values, key_values, labels, labels_from_key_values, method_label,
    request_header_attributes, response_header_attributes, set_label,
};
use crate::observability::handle::InstrumentationHandle;
use crate::observability::instruments::ServerInstruments;
use crate::observability::propagation::extract_context;
use crate::pipeline::stage::STAGE_ATTRIBUTE;

/// Stage reported on server spans.
pub const GLOBAL_STAGE: &str = "global";

/// Route reported for hijacked connections nobody routed.
pub const UPGRADED_ROUTE: &str = "Upgraded Connection";
/// Status reported for requests dropped before a response existed.
pub const ABORTED_STATUS: u16 = 499;
/// Route of aborted requests that were never matched.
pub const ABORTED_ROUTE: &str = "499 Client Closed Request";

/// Headers never copied into span attributes.
pub const SKIPPED_HEADERS: [HeaderName; 4] = [AUTHORIZATION, PROXY_AUTHORIZATION, COOKIE, SET_COOKIE];

struct TrackerInner {
    handle: Arc<InstrumentationHandle>,
    propagate: bool,
    instruments: Option<ServerInstruments>,
    metric_labels: Vec<Label>,
    tracer: Option<SdkTracer>,
    trace_attrs: Vec<KeyValue>,
    report_headers: bool,
    skip_paths: Vec<String>,
}

/// Instruments and options shared by every inbound request of one
/// configuration generation.
#[derive(Clone)]
pub struct ServerTracker {
    inner: Arc<TrackerInner>,
}

impl fmt::Debug for ServerTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerTracker")
            .field("propagate", &self.inner.propagate)
            .field("metrics", &self.inner.instruments.is_some())
            .field("traces", &self.inner.tracer.is_some())
            .finish()
    }
}

impl ServerTracker {
    pub fn new(resolver: &ConfigResolver, handle: &Arc<InstrumentationHandle>) -> Self {
        let opts = resolver.global_opts();
        let instruments = handle
            .meter()
            .filter(|_| !opts.disable_metrics)
            .map(|m| ServerInstruments::bind(m, opts.semantic_convention));
        let tracer = handle.tracer().filter(|_| !opts.disable_traces).cloned();

        let mut trace_attrs = vec![KeyValue::new(STAGE_ATTRIBUTE, GLOBAL_STAGE)];
        extend_key_values(&mut trace_attrs, key_values(&opts.traces_static_attributes));

        Self {
            inner: Arc::new(TrackerInner {
                handle: handle.clone(),
                propagate: !opts.disable_propagation,
                instruments,
                metric_labels: labels(&opts.metrics_static_attributes),
                tracer,
                trace_attrs,
                report_headers: opts.report_headers,
                skip_paths: resolver.config().skip_paths.clone(),
            }),
        }
    }

    /// Whether requests need a tracking at all.
    pub fn is_active(&self) -> bool {
        self.inner.propagate || self.inner.instruments.is_some() || self.inner.tracer.is_some()
    }

    /// Requests to `path` are served untracked.
    pub fn skips(&self, path: &str) -> bool {
        self.inner.skip_paths.iter().any(|p| p == path)
    }

    /// Begin tracking `req`: extract the caller's trace context and open
    /// the server span.
    pub fn start<B>(&self, req: &Request<B>) -> RequestTracking {
        let parent = if self.inner.propagate {
            extract_context(self.inner.handle.propagator(), req.headers())
        } else {
            opentelemetry::Context::new()
        };
        let scheme = request_scheme(req);

        let (otel, traced) = match &self.inner.tracer {
            Some(tracer) => {
                let mut attrs = request_attributes(req, &scheme);
                attrs.extend(self.inner.trace_attrs.iter().cloned());
                if self.inner.report_headers {
                    attrs.extend(request_header_attributes(&reportable_headers(req.headers())));
                }
                let span = tracer
                    .span_builder(req.uri().path().to_string())
                    .with_kind(SpanKind::Server)
                    .with_attributes(attrs)
                    .start_with_context(tracer, &parent);
                (parent.with_span(span), true)
            }
            None => (parent, false),
        };

        RequestTracking {
            shared: Arc::new(Shared {
                tracker: self.inner.clone(),
                otel,
                traced,
                method: req.method().clone(),
                scheme,
                started: Instant::now(),
                state: Mutex::new(TrackingState::default()),
            }),
        }
    }
}

/// Scheme of the connection a request arrived on, for servers that can
/// tell. Inserted into the request extensions by the accept loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionScheme(pub Scheme);

/// `url.scheme` of an inbound request.
///
/// Server request targets are usually origin-form, so the scheme comes
/// from, in order: the target itself, a [`ConnectionScheme`] extension,
/// `X-Forwarded-Proto`, the `proto` of `Forwarded`. Plain `http` otherwise.
pub fn request_scheme<B>(req: &Request<B>) -> String {
    if let Some(scheme) = req.uri().scheme_str() {
        return scheme.to_ascii_lowercase();
    }
    if let Some(ConnectionScheme(scheme)) = req.extensions().get::<ConnectionScheme>() {
        return scheme.as_str().to_ascii_lowercase();
    }
    let headers = req.headers();
    let forwarded_proto = headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    if let Some(proto) = forwarded_proto {
        return proto.to_ascii_lowercase();
    }
    let forwarded = headers
        .get(FORWARDED)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|first| {
            first.split(';').find_map(|pair| {
                let (name, value) = pair.split_once('=')?;
                name.trim()
                    .eq_ignore_ascii_case("proto")
                    .then(|| value.trim().trim_matches('"').to_ascii_lowercase())
            })
        })
        .filter(|v| !v.is_empty());
    forwarded.unwrap_or_else(|| "http".to_string())
}

fn request_attributes<B>(req: &Request<B>, scheme: &str) -> Vec<KeyValue> {
    let mut attrs = vec![
        KeyValue::new("http.request.method", req.method().to_string()),
        KeyValue::new("url.path", req.uri().path().to_string()),
        KeyValue::new("url.scheme", scheme.to_string()),
        KeyValue::new("network.protocol.version", protocol_version(req.version())),
    ];
    if let Some(query) = req.uri().query() {
        attrs.push(KeyValue::new("url.query", query.to_string()));
    }
    let host = req
        .uri()
        .host()
        .map(str::to_string)
        .or_else(|| {
            req.headers()
                .get(HOST)
                .and_then(|v| v.to_str().ok())
                .map(|h| h.split(':').next().unwrap_or(h).to_string())
        });
    if let Some(host) = host {
        attrs.push(KeyValue::new("server.address", host));
    }
    if let Some(agent) = req.headers().get(USER_AGENT).and_then(|v| v.to_str().ok()) {
        attrs.push(KeyValue::new("user_agent.original", agent.to_string()));
    }
    attrs
}

fn protocol_version(version: http::Version) -> &'static str {
    match version {
        http::Version::HTTP_09 => "0.9",
        http::Version::HTTP_10 => "1.0",
        http::Version::HTTP_2 => "2",
        http::Version::HTTP_3 => "3",
        _ => "1.1",
    }
}

/// `headers` without the ones listed in [`SKIPPED_HEADERS`].
pub fn reportable_headers(headers: &HeaderMap) -> HeaderMap {
    let mut kept = headers.clone();
    for name in &SKIPPED_HEADERS {
        kept.remove(name);
    }
    kept
}

#[derive(Debug)]
struct TrackingState {
    status: StatusCode,
    response_size: u64,
    response_headers: Option<Vec<KeyValue>>,
    write_error: Option<String>,
    endpoint_pattern: Option<String>,
    hijacked: bool,
    hijack_error: Option<String>,
    aborted: bool,
    metric_attrs: Vec<KeyValue>,
    trace_attrs: Vec<KeyValue>,
    finished: bool,
}

impl Default for TrackingState {
    fn default() -> Self {
        Self {
            status: StatusCode::OK,
            response_size: 0,
            response_headers: None,
            write_error: None,
            endpoint_pattern: None,
            hijacked: false,
            hijack_error: None,
            aborted: false,
            metric_attrs: Vec::new(),
            trace_attrs: Vec::new(),
            finished: false,
        }
    }
}

impl TrackingState {
    fn status_code(&self) -> u16 {
        if self.aborted {
            ABORTED_STATUS
        } else {
            self.status.as_u16()
        }
    }

    fn route(&self) -> String {
        match &self.endpoint_pattern {
            Some(pattern) => pattern.clone(),
            None if self.hijacked => UPGRADED_ROUTE.to_string(),
            None if self.aborted => ABORTED_ROUTE.to_string(),
            None => format!(
                "{} {}",
                self.status.as_u16(),
                self.status.canonical_reason().unwrap_or_default()
            ),
        }
    }
}

struct Shared {
    tracker: Arc<TrackerInner>,
    otel: opentelemetry::Context,
    traced: bool,
    method: Method,
    scheme: String,
    started: Instant,
    state: Mutex<TrackingState>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, TrackingState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn finish(&self, state: &mut TrackingState) -> bool {
        if state.finished {
            return false;
        }
        state.finished = true;
        let secs = self.started.elapsed().as_secs_f64();
        let route = state.route();
        self.report_metrics(secs, &route, state);
        self.end_span(&route, state);
        true
    }

    fn report_metrics(&self, secs: f64, route: &str, state: &TrackingState) {
        let Some(instr) = &self.tracker.instruments else {
            return;
        };
        let mut labels = self.tracker.metric_labels.clone();
        for label in labels_from_key_values(&state.metric_attrs) {
            set_label(&mut labels, label);
        }
        set_label(&mut labels, Label::new("http.request.method", method_label(&self.method)));
        set_label(&mut labels, Label::new("url.scheme", self.scheme.clone()));
        set_label(&mut labels, Label::new("http.route", route.to_string()));
        set_label(
            &mut labels,
            Label::new("http.response.status_code", state.status_code().to_string()),
        );
        instr.duration.record(secs, &labels);
        instr.response_size.record(state.response_size as f64, &labels);
    }

    fn end_span(&self, route: &str, state: &TrackingState) {
        if !self.traced {
            return;
        }
        let span = self.otel.span();
        if state.hijacked {
            span.set_attribute(KeyValue::new("http.connection.hijacked", true));
            if let Some(err) = &state.hijack_error {
                span.set_attribute(KeyValue::new("http.connection.error", err.clone()));
            }
        }
        span.set_attribute(KeyValue::new("http.route", route.to_string()));
        span.set_attribute(KeyValue::new(
            "http.response.status_code",
            i64::from(state.status_code()),
        ));
        span.set_attribute(KeyValue::new("http.response.body.size", state.response_size as i64));
        for kv in &state.trace_attrs {
            span.set_attribute(kv.clone());
        }
        if let Some(headers) = &state.response_headers {
            for kv in headers {
                span.set_attribute(kv.clone());
            }
        }
        if state.aborted {
            span.set_attribute(KeyValue::new("canceled", true));
            span.set_status(Status::error("request dropped before a response was written"));
            span.end();
            return;
        }
        match &state.write_error {
            Some(msg) => {
                span.add_event(
                    "exception",
                    vec![KeyValue::new("exception.message", msg.clone())],
                );
                span.set_status(Status::error(msg.clone()));
            }
            None => span.set_status(Status::Ok),
        }
        span.end();
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        let mut state = std::mem::take(self.state.get_mut().unwrap_or_else(PoisonError::into_inner));
        self.finish(&mut state);
    }
}

/// Tracking of one inbound request. Clones share the same state.
#[derive(Clone)]
pub struct RequestTracking {
    shared: Arc<Shared>,
}

impl fmt::Debug for RequestTracking {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestTracking")
            .field("method", &self.shared.method)
            .field("state", &*self.shared.lock())
            .finish()
    }
}

impl RequestTracking {
    /// Trace context carrying the server span, if any.
    pub fn context(&self) -> &opentelemetry::Context {
        &self.shared.otel
    }

    /// A fresh [`RequestContext`] under the server span.
    pub fn request_context(&self) -> RequestContext {
        RequestContext::from_otel(self.shared.otel.clone())
    }

    /// Route the request was matched to.
    pub fn set_endpoint_pattern(&self, pattern: impl Into<String>) {
        self.shared.lock().endpoint_pattern = Some(pattern.into());
    }

    /// Per-endpoint attributes for the metrics and the span.
    pub fn set_static_attributes(&self, metrics: Vec<KeyValue>, traces: Vec<KeyValue>) {
        let mut state = self.shared.lock();
        state.metric_attrs = metrics;
        state.trace_attrs = traces;
    }

    /// The response head is being written. Headers are captured the first
    /// time only.
    pub fn write_header(&self, status: StatusCode, headers: &HeaderMap) {
        let mut state = self.shared.lock();
        state.status = status;
        if self.shared.tracker.report_headers && self.shared.traced && state.response_headers.is_none() {
            state.response_headers = Some(response_header_attributes(&reportable_headers(headers)));
        }
    }

    /// Response body bytes handed to the connection.
    pub fn add_written(&self, bytes: u64) {
        self.shared.lock().response_size += bytes;
    }

    /// Writing the response failed. The first error is kept.
    pub fn write_failed(&self, err: &dyn fmt::Display) {
        let mut state = self.shared.lock();
        if state.write_error.is_none() {
            state.write_error = Some(err.to_string());
        }
    }

    /// Report now. Later calls, and a later hijack, do nothing.
    ///
    /// Returns whether this call did the reporting.
    pub fn finish(&self) -> bool {
        let mut state = self.shared.lock();
        self.shared.finish(&mut state)
    }

    pub fn is_finished(&self) -> bool {
        self.shared.lock().finished
    }

    /// The request was dropped before a response existed: the client went
    /// away or an outer timeout fired. Reports now, as canceled.
    ///
    /// Returns whether this call did the reporting.
    pub fn abort(&self) -> bool {
        let mut state = self.shared.lock();
        if state.finished {
            return false;
        }
        state.aborted = true;
        self.shared.finish(&mut state)
    }

    /// Current route: the endpoint pattern or its fallback.
    pub fn route(&self) -> String {
        self.shared.lock().route()
    }

    /// Capability to mark the connection as taken over.
    pub fn hijack_handle(&self) -> HijackHandle {
        HijackHandle {
            tracking: self.clone(),
        }
    }

    fn hijack(&self, err: Option<String>) -> bool {
        let mut state = self.shared.lock();
        if state.finished {
            return false;
        }
        state.hijacked = true;
        state.hijack_error = err;
        self.shared.finish(&mut state)
    }
}

/// Given to handlers of connections that can be upgraded.
///
/// Hijacking reports the request before returning, as nothing is written
/// through HTTP afterwards.
#[derive(Debug, Clone)]
pub struct HijackHandle {
    tracking: RequestTracking,
}

impl HijackHandle {
    /// The connection was taken over. Returns whether this call did the
    /// reporting.
    pub fn hijack(&self) -> bool {
        self.tracking.hijack(None)
    }

    /// Taking over the connection failed with `err`.
    pub fn hijack_failed(&self, err: &dyn fmt::Display) -> bool {
        self.tracking.hijack(Some(err.to_string()))
    }
}
