//! Duration and outcome reporting around one pipeline stage.

use std::error::Error;
use std::sync::Arc;
use std::time::Instant;

use futures_util::future::BoxFuture;
use metrics::Label;
use opentelemetry::trace::{SpanKind, Status, TraceContextExt, Tracer as _};
use opentelemetry::KeyValue;
use opentelemetry_sdk::trace::SdkTracer;

use crate::config::resolver::EffectiveOptions;
use crate::config::schema::Attributes;
use crate::context::RequestContext;
use crate::observability::attributes::{
    extend_key_values, extend_labels, key_values, labels, labels_from_key_values, method_label,
    request_header_attributes, response_header_attributes, set_key_value, set_label,
};
use crate::observability::handle::InstrumentationHandle;
use crate::observability::instruments::stage_duration;
use crate::observability::meter::HistogramInstrument;
use crate::pipeline::outcome::Outcome;
use crate::pipeline::proxy::{Proxy, ProxyRequest, ProxyResponse, ProxyResult};

/// Span attribute naming the stage.
pub const STAGE_ATTRIBUTE: &str = "gateway.stage";

/// What a [`StageMiddleware`] records.
#[derive(Debug, Clone, Default)]
pub struct StageOptions {
    pub metrics_enabled: bool,
    pub traces_enabled: bool,
    pub report_headers: bool,
    /// Attached to both the duration samples and the span.
    pub static_attributes: Vec<KeyValue>,
    pub metric_attributes: Attributes,
    pub trace_attributes: Attributes,
}

impl StageOptions {
    /// Options of a stage resolved to `opts`, plus attributes describing
    /// the wrapped component.
    pub fn from_effective(opts: EffectiveOptions, static_attributes: Vec<KeyValue>) -> Self {
        Self {
            metrics_enabled: opts.metrics_enabled,
            traces_enabled: opts.traces_enabled,
            report_headers: opts.report_headers,
            static_attributes,
            metric_attributes: opts.metric_attributes,
            trace_attributes: opts.trace_attributes,
        }
    }
}

/// Wraps a stage with a span named after its url pattern and a
/// `gateway.<stage>.duration` histogram.
pub struct StageMiddleware {
    url_pattern: String,
    duration: Option<HistogramInstrument>,
    tracer: Option<SdkTracer>,
    metric_labels: Vec<Label>,
    trace_attrs: Vec<KeyValue>,
    report_headers: bool,
}

impl StageMiddleware {
    pub fn new(
        stage: &str,
        url_pattern: impl Into<String>,
        handle: &InstrumentationHandle,
        opts: StageOptions,
    ) -> Self {
        let mut metric_labels = labels_from_key_values(&opts.static_attributes);
        extend_labels(&mut metric_labels, labels(&opts.metric_attributes));

        let mut trace_attrs = Vec::new();
        extend_key_values(&mut trace_attrs, opts.static_attributes);
        extend_key_values(&mut trace_attrs, key_values(&opts.trace_attributes));
        set_key_value(&mut trace_attrs, KeyValue::new(STAGE_ATTRIBUTE, stage.to_string()));

        Self {
            url_pattern: url_pattern.into(),
            duration: handle
                .meter()
                .filter(|_| opts.metrics_enabled)
                .map(|meter| stage_duration(meter, stage)),
            tracer: handle.tracer().filter(|_| opts.traces_enabled).cloned(),
            metric_labels,
            trace_attrs,
            report_headers: opts.report_headers,
        }
    }

    /// Whether wrapping with this middleware records anything at all.
    pub fn is_active(&self) -> bool {
        self.duration.is_some() || self.tracer.is_some()
    }

    /// Wrap `next`. Inactive middlewares return it untouched.
    pub fn wrap(self, next: Proxy) -> Proxy {
        if !self.is_active() {
            return next;
        }
        let this = Arc::new(self);
        Arc::new(
            move |cx: RequestContext, req: ProxyRequest| -> BoxFuture<'static, ProxyResult> {
                let this = this.clone();
                let next = next.clone();
                Box::pin(async move { this.call(cx, req, &next).await })
            },
        )
    }

    /// Run `next` under this stage's instrumentation.
    pub async fn call(&self, cx: RequestContext, req: ProxyRequest, next: &Proxy) -> ProxyResult {
        let mut tracking = self.start(&cx, &req);
        let next_cx = match &tracking.span_cx {
            Some(otel) => cx.with_otel(otel.clone()),
            None => cx.clone(),
        };

        let result = next(next_cx, req).await;

        let err = result.as_ref().err().map(|e| e as &(dyn Error + 'static));
        let outcome = Outcome::stage(err, Some(&cx));
        tracking.finish(outcome, result.as_ref().ok(), err);
        result
    }

    fn start(&self, cx: &RequestContext, req: &ProxyRequest) -> StageTracking<'_> {
        let span_cx = self.tracer.as_ref().map(|tracer| {
            let mut attrs = self.trace_attrs.clone();
            attrs.push(KeyValue::new("http.request.method", req.method.to_string()));
            if self.report_headers {
                attrs.extend(request_header_attributes(&req.headers));
            }
            let span = tracer
                .span_builder(self.url_pattern.clone())
                .with_kind(SpanKind::Internal)
                .with_attributes(attrs)
                .start_with_context(tracer, cx.otel());
            cx.otel().with_span(span)
        });
        StageTracking {
            middleware: self,
            method: method_label(&req.method),
            span_cx,
            started: Instant::now(),
            finished: false,
        }
    }
}

/// One invocation. Reports once; dropping it unfinished reports a
/// cancellation.
struct StageTracking<'a> {
    middleware: &'a StageMiddleware,
    method: &'static str,
    span_cx: Option<opentelemetry::Context>,
    started: Instant,
    finished: bool,
}

impl StageTracking<'_> {
    fn finish(
        &mut self,
        outcome: Outcome,
        response: Option<&ProxyResponse>,
        err: Option<&(dyn Error + 'static)>,
    ) {
        if self.finished {
            return;
        }
        self.finished = true;
        let secs = self.started.elapsed().as_secs_f64();
        let complete = response.is_some_and(|r| r.is_complete);

        if let Some(duration) = &self.middleware.duration {
            let mut labels = self.middleware.metric_labels.clone();
            set_label(&mut labels, Label::new("http.request.method", self.method));
            set_label(&mut labels, Label::new("error", outcome.failed.to_string()));
            set_label(&mut labels, Label::new("canceled", outcome.canceled.to_string()));
            set_label(&mut labels, Label::new("complete", complete.to_string()));
            duration.record(secs, &labels);
        }

        let Some(otel) = self.span_cx.take() else {
            return;
        };
        let span = otel.span();
        if outcome.is_success() {
            if let Some(resp) = response {
                span.set_attribute(KeyValue::new(
                    "http.response.status_code",
                    i64::from(resp.status.as_u16()),
                ));
                if self.middleware.report_headers {
                    for kv in response_header_attributes(&resp.headers) {
                        span.set_attribute(kv);
                    }
                }
            }
        } else {
            if outcome.canceled {
                span.set_attribute(KeyValue::new("canceled", true));
            } else {
                let msg = err.map(|e| e.to_string()).unwrap_or_default();
                span.set_attribute(KeyValue::new("error", msg.clone()));
                span.set_status(Status::error(msg));
            }
            span.set_attribute(KeyValue::new("http.response.status_code", 500_i64));
        }
        span.set_attribute(KeyValue::new("complete", complete));
        span.end();
    }
}

impl Drop for StageTracking<'_> {
    fn drop(&mut self) {
        let abandoned = Outcome {
            canceled: true,
            ..Outcome::SUCCESS
        };
        self.finish(abandoned, None, None);
    }
}
