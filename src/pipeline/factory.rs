//! Decides, per endpoint and per backend, whether a stage gets wrapped.

use opentelemetry::KeyValue;

use crate::config::endpoint::{BackendConfig, EndpointConfig};
use crate::config::pattern::normalize_url_pattern;
use crate::config::resolver::Stage;
use crate::http::client::tracker::{ClientOptions, RoundTripTracker, SignalOptions};
use crate::observability::attributes::{extend_key_values, key_values, set_key_value};
use crate::observability::registry::Telemetry;
use crate::pipeline::proxy::Proxy;
use crate::pipeline::stage::{StageMiddleware, StageOptions, STAGE_ATTRIBUTE};

pub const PROXY_STAGE: &str = "proxy";
pub const BACKEND_STAGE: &str = "backend";
/// Stage reported on backend round trip spans.
pub const BACKEND_REQUEST_STAGE: &str = "backend-request";

/// Wrap the endpoint pipeline of `endpoint`.
///
/// Skipped endpoints and endpoints with both signals disabled get `next`
/// back untouched.
pub fn proxy_stage(telemetry: &Telemetry, endpoint: &EndpointConfig, next: Proxy) -> Proxy {
    let resolver = telemetry.resolver();
    if resolver.skip_endpoint(&endpoint.endpoint) {
        return next;
    }
    let opts = resolver.resolve(Stage::Pipe, &endpoint.extra_config);
    if !opts.enabled() {
        return next;
    }
    let url_pattern = normalize_url_pattern(&endpoint.endpoint);
    let static_attributes = vec![KeyValue::new("http.route", url_pattern.clone())];
    let stage_opts = StageOptions::from_effective(opts, static_attributes);
    StageMiddleware::new(PROXY_STAGE, url_pattern, telemetry.handle(), stage_opts).wrap(next)
}

/// Wrap the call to one backend.
pub fn backend_stage(telemetry: &Telemetry, backend: &BackendConfig, next: Proxy) -> Proxy {
    let resolver = telemetry.resolver();
    if resolver.skip_endpoint(&backend.parent_endpoint) {
        return next;
    }
    let opts = resolver.resolve(Stage::Backend, &backend.extra_config);
    let stage_opts = StageOptions::from_effective(opts, backend_static_attributes(backend));
    let url_pattern = normalize_url_pattern(&backend.url_pattern);
    StageMiddleware::new(BACKEND_STAGE, url_pattern, telemetry.handle(), stage_opts).wrap(next)
}

/// Round trip tracker for the HTTP client of one backend.
///
/// `None` for skipped endpoints and when the backend layer reports
/// nothing, in which case the client runs uninstrumented.
pub fn backend_round_trip_tracker(
    telemetry: &Telemetry,
    backend: &BackendConfig,
) -> Option<RoundTripTracker> {
    let resolver = telemetry.resolver();
    if resolver.skip_endpoint(&backend.parent_endpoint) {
        return None;
    }
    let opts = resolver.backend_opts(backend);
    if !opts.enabled() {
        return None;
    }

    let route_attrs = backend_route_attributes(backend);
    let mut metric_attrs = route_attrs.clone();
    extend_key_values(&mut metric_attrs, key_values(&opts.metrics.static_attributes));
    let mut trace_attrs = route_attrs;
    set_key_value(&mut trace_attrs, KeyValue::new(STAGE_ATTRIBUTE, BACKEND_REQUEST_STAGE));
    extend_key_values(&mut trace_attrs, key_values(&opts.traces.static_attributes));

    let client_opts = ClientOptions {
        client_name: normalize_url_pattern(&backend.url_pattern),
        semantic_convention: resolver.semantic_convention(),
        metrics: SignalOptions {
            round_trip: opts.metrics.round_trip,
            read_payload: opts.metrics.read_payload,
            detailed_connection: opts.metrics.detailed_connection,
            static_attributes: metric_attrs,
        },
        traces: SignalOptions {
            round_trip: opts.traces.round_trip,
            read_payload: opts.traces.read_payload,
            detailed_connection: opts.traces.detailed_connection,
            static_attributes: trace_attrs,
        },
        report_headers: opts.traces.report_headers,
    };
    RoundTripTracker::new(telemetry.handle().clone(), client_opts)
}

fn backend_route_attributes(backend: &BackendConfig) -> Vec<KeyValue> {
    vec![
        KeyValue::new("http.request.method", backend.method.clone()),
        KeyValue::new("http.route", normalize_url_pattern(&backend.url_pattern)),
        KeyValue::new("gateway.endpoint", normalize_url_pattern(&backend.parent_endpoint)),
        KeyValue::new("gateway.endpoint_method", backend.parent_endpoint_method.clone()),
    ]
}

/// Low cardinality attributes describing a backend, shared by its
/// metrics and spans.
pub fn backend_static_attributes(backend: &BackendConfig) -> Vec<KeyValue> {
    let mut attrs = backend_route_attributes(backend);
    match backend.hosts.as_slice() {
        [] => {}
        [host] => attrs.push(KeyValue::new("server.address", host.clone())),
        hosts => {
            let mut sorted = hosts.to_vec();
            sorted.sort();
            attrs.push(KeyValue::new("server.address", sorted.join("_")));
        }
    }
    attrs
}
