//! Instrument sets: metric names bound to a semantic convention.
//!
//! Every tracker asks for its instruments here, so switching the naming
//! convention never touches a call site. An instrument left as `None` is
//! not part of the selected convention and is silently skipped.

use metrics::Unit;

use crate::config::schema::SemanticConvention;
use crate::observability::meter::{
    CounterInstrument, FloatCounterInstrument, HistogramInstrument, Meter,
};

/// Prefix of the per-stage duration histograms.
pub const STAGE_PREFIX: &str = "gateway";

/// Instruments of an outbound round trip.
#[derive(Clone)]
pub struct ClientInstruments {
    pub started: Option<CounterInstrument>,
    pub failed: Option<CounterInstrument>,
    pub canceled: Option<CounterInstrument>,
    pub timed_out: Option<CounterInstrument>,
    /// Declared request content length, as a counter.
    pub request_size: Option<CounterInstrument>,
    /// Declared request content length, as a histogram.
    pub request_size_hist: Option<HistogramInstrument>,
    pub duration: HistogramInstrument,
    pub response_size: HistogramInstrument,
    pub no_content_length: Option<CounterInstrument>,
    pub get_conn: Option<HistogramInstrument>,
    pub dns: Option<HistogramInstrument>,
    pub tls: Option<HistogramInstrument>,
}

impl ClientInstruments {
    /// Bind the client instruments of `semconv`.
    ///
    /// Under 1.27 the gateway's own counters and connection timings are
    /// only reported when `detailed_connection` is set.
    pub fn bind(meter: &Meter, semconv: SemanticConvention, detailed_connection: bool) -> Self {
        match semconv {
            SemanticConvention::Legacy => Self {
                started: Some(meter.counter("http.client.request.started.count")),
                failed: Some(meter.counter("http.client.request.failed.count")),
                canceled: Some(meter.counter("http.client.request.canceled.count")),
                timed_out: Some(meter.counter("http.client.request.timedout.count")),
                request_size: Some(meter.counter("http.client.request.size")),
                request_size_hist: None,
                duration: meter.histogram("http.client.duration"),
                response_size: meter.histogram("http.client.response.size"),
                no_content_length: Some(meter.counter("http.client.response.no-content-length")),
                get_conn: detailed_connection
                    .then(|| meter.histogram("http.client.request.get-conn.duration")),
                dns: detailed_connection.then(|| meter.histogram("http.client.request.dns.duration")),
                tls: detailed_connection.then(|| meter.histogram("http.client.request.tls.duration")),
            },
            SemanticConvention::V1_27 => {
                meter.describe_histogram(
                    "http.client.request.duration",
                    Unit::Seconds,
                    "Duration of HTTP client requests.",
                );
                meter.describe_histogram(
                    "http.client.request.body.size",
                    Unit::Bytes,
                    "Size of HTTP client request bodies.",
                );
                meter.describe_histogram(
                    "http.client.response.body.size",
                    Unit::Bytes,
                    "Size of HTTP client response bodies.",
                );
                let mut set = Self {
                    started: None,
                    failed: None,
                    canceled: None,
                    timed_out: None,
                    request_size: None,
                    request_size_hist: Some(meter.histogram("http.client.request.body.size")),
                    duration: meter.histogram("http.client.request.duration"),
                    response_size: meter.histogram("http.client.response.body.size"),
                    no_content_length: None,
                    get_conn: None,
                    dns: None,
                    tls: None,
                };
                if detailed_connection {
                    meter.describe_counter(
                        "http.client.response.no-content-length",
                        Unit::Count,
                        "Client received responses that do not have 'Content-Length' value set",
                    );
                    meter.describe_histogram(
                        "http.client.request.get-conn.duration",
                        Unit::Seconds,
                        "Time spent acquiring a client connection",
                    );
                    meter.describe_histogram(
                        "http.client.request.dns.duration",
                        Unit::Seconds,
                        "Time spent resolving the DNS name",
                    );
                    meter.describe_histogram(
                        "http.client.request.tls.duration",
                        Unit::Seconds,
                        "Time spent on TLS negotiation and connection",
                    );
                    set.started = Some(meter.counter("http.client.request.started.count"));
                    set.failed = Some(meter.counter("http.client.request.failed.count"));
                    set.canceled = Some(meter.counter("http.client.request.canceled.count"));
                    set.timed_out = Some(meter.counter("http.client.request.timedout.count"));
                    set.no_content_length =
                        Some(meter.counter("http.client.response.no-content-length"));
                    set.get_conn = Some(meter.histogram("http.client.request.get-conn.duration"));
                    set.dns = Some(meter.histogram("http.client.request.dns.duration"));
                    set.tls = Some(meter.histogram("http.client.request.tls.duration"));
                }
                set
            }
        }
    }
}

/// Instruments of an inbound request.
#[derive(Clone)]
pub struct ServerInstruments {
    pub duration: HistogramInstrument,
    pub response_size: HistogramInstrument,
}

impl ServerInstruments {
    pub fn bind(meter: &Meter, semconv: SemanticConvention) -> Self {
        match semconv {
            SemanticConvention::Legacy => Self {
                duration: meter.histogram("http.server.duration"),
                response_size: meter.histogram("http.server.response.size"),
            },
            SemanticConvention::V1_27 => {
                meter.describe_histogram(
                    "http.server.request.duration",
                    Unit::Seconds,
                    "Duration of HTTP server requests.",
                );
                meter.describe_histogram(
                    "http.server.response.body.size",
                    Unit::Bytes,
                    "Size of HTTP server response bodies.",
                );
                Self {
                    duration: meter.histogram("http.server.request.duration"),
                    response_size: meter.histogram("http.server.response.body.size"),
                }
            }
        }
    }
}

/// Duration histogram of a pipeline stage (`gateway.<stage>.duration`).
pub fn stage_duration(meter: &Meter, stage: &str) -> HistogramInstrument {
    meter.histogram(format!("{STAGE_PREFIX}.{stage}.duration"))
}

/// Instruments of a tracked byte stream, all sharing one prefix.
#[derive(Clone)]
pub struct IoInstruments {
    pub size: CounterInstrument,
    pub size_hist: HistogramInstrument,
    pub time: FloatCounterInstrument,
    pub time_hist: HistogramInstrument,
    pub errors: CounterInstrument,
}

impl IoInstruments {
    pub fn bind(meter: &Meter, prefix: &str) -> Self {
        Self {
            size: meter.counter(format!("{prefix}size")),
            size_hist: meter.histogram(format!("{prefix}size-hist")),
            time: meter.float_counter(format!("{prefix}time")),
            time_hist: meter.histogram(format!("{prefix}time-hist")),
            errors: meter.counter(format!("{prefix}errors")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::meter::testing::debugging_meter;

    #[test]
    fn test_legacy_client_names() {
        let (meter, _) = debugging_meter();
        let set = ClientInstruments::bind(&meter, SemanticConvention::Legacy, false);
        assert_eq!(set.duration.name(), "http.client.duration");
        assert_eq!(set.response_size.name(), "http.client.response.size");
        assert_eq!(
            set.started.as_ref().map(|c| c.name()),
            Some("http.client.request.started.count")
        );
        assert!(set.request_size_hist.is_none());
        assert!(set.get_conn.is_none());
    }

    #[test]
    fn test_semconv_client_names() {
        let (meter, _) = debugging_meter();
        let set = ClientInstruments::bind(&meter, SemanticConvention::V1_27, false);
        assert_eq!(set.duration.name(), "http.client.request.duration");
        assert_eq!(set.response_size.name(), "http.client.response.body.size");
        assert!(set.started.is_none());
        assert!(set.request_size.is_none());

        let detailed = ClientInstruments::bind(&meter, SemanticConvention::V1_27, true);
        assert!(detailed.started.is_some());
        assert!(detailed.tls.is_some());
    }

    #[test]
    fn test_server_and_stage_names() {
        let (meter, _) = debugging_meter();
        let legacy = ServerInstruments::bind(&meter, SemanticConvention::Legacy);
        assert_eq!(legacy.duration.name(), "http.server.duration");
        let v127 = ServerInstruments::bind(&meter, SemanticConvention::V1_27);
        assert_eq!(v127.response_size.name(), "http.server.response.body.size");
        assert_eq!(stage_duration(&meter, "proxy").name(), "gateway.proxy.duration");
    }

    #[test]
    fn test_io_names_share_prefix() {
        let (meter, _) = debugging_meter();
        let io = IoInstruments::bind(&meter, "read.");
        assert_eq!(io.size.name(), "read.size");
        assert_eq!(io.size_hist.name(), "read.size-hist");
        assert_eq!(io.time.name(), "read.time");
        assert_eq!(io.time_hist.name(), "read.time-hist");
        assert_eq!(io.errors.name(), "read.errors");
    }
}
