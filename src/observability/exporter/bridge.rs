//! Recorder forwarding measurements into an OpenTelemetry meter.
//!
//! Integer counters become `u64` counters, float counters (recorded as
//! increment-only gauges) become `f64` counters and histograms keep the
//! bucket boundaries chosen by metric name.

use std::sync::Arc;

use dashmap::DashMap;
use metrics::{
    Counter, CounterFn, Gauge, GaugeFn, Histogram, HistogramFn, Key, KeyName, Metadata, Recorder,
    SharedString, Unit,
};
use metrics_util::registry::{Registry, Storage};
use opentelemetry::metrics::Meter;
use opentelemetry::KeyValue;

use crate::config::buckets::bounds_for;

#[derive(Clone)]
struct Description {
    unit: Option<Unit>,
    text: SharedString,
}

type Descriptions = Arc<DashMap<String, Description>>;

/// OpenTelemetry unit notation.
fn otel_unit(unit: Unit) -> &'static str {
    match unit {
        Unit::Seconds => "s",
        Unit::Milliseconds => "ms",
        Unit::Microseconds => "us",
        Unit::Nanoseconds => "ns",
        Unit::Bytes => "By",
        Unit::Count => "{count}",
        other => other.as_str(),
    }
}

fn attributes(key: &Key) -> Vec<KeyValue> {
    key.labels()
        .map(|l| KeyValue::new(l.key().to_string(), l.value().to_string()))
        .collect()
}

struct OtelStorage {
    meter: Meter,
    descriptions: Descriptions,
}

impl OtelStorage {
    fn description(&self, name: &str) -> Option<Description> {
        self.descriptions.get(name).map(|d| d.clone())
    }
}

impl Storage<Key> for OtelStorage {
    type Counter = Arc<OtelCounter>;
    type Gauge = Arc<OtelFloatCounter>;
    type Histogram = Arc<OtelHistogram>;

    fn counter(&self, key: &Key) -> Self::Counter {
        let name = key.name().to_string();
        let mut builder = self.meter.u64_counter(name.clone());
        if let Some(d) = self.description(&name) {
            builder = builder.with_description(d.text.to_string());
            if let Some(unit) = d.unit {
                builder = builder.with_unit(otel_unit(unit));
            }
        }
        Arc::new(OtelCounter {
            counter: builder.build(),
            attributes: attributes(key),
        })
    }

    fn gauge(&self, key: &Key) -> Self::Gauge {
        let name = key.name().to_string();
        let mut builder = self.meter.f64_counter(name.clone());
        if let Some(d) = self.description(&name) {
            builder = builder.with_description(d.text.to_string());
            if let Some(unit) = d.unit {
                builder = builder.with_unit(otel_unit(unit));
            }
        }
        Arc::new(OtelFloatCounter {
            counter: builder.build(),
            attributes: attributes(key),
        })
    }

    fn histogram(&self, key: &Key) -> Self::Histogram {
        let name = key.name().to_string();
        let mut builder = self.meter.f64_histogram(name.clone());
        if let Some(d) = self.description(&name) {
            builder = builder.with_description(d.text.to_string());
            if let Some(unit) = d.unit {
                builder = builder.with_unit(otel_unit(unit));
            }
        }
        if let Some(bounds) = bounds_for(&name) {
            builder = builder.with_boundaries(bounds.to_vec());
        }
        Arc::new(OtelHistogram {
            histogram: builder.build(),
            attributes: attributes(key),
        })
    }
}

struct OtelCounter {
    counter: opentelemetry::metrics::Counter<u64>,
    attributes: Vec<KeyValue>,
}

impl CounterFn for OtelCounter {
    fn increment(&self, value: u64) {
        self.counter.add(value, &self.attributes);
    }

    // OTel counters are deltas only.
    fn absolute(&self, _value: u64) {}
}

struct OtelFloatCounter {
    counter: opentelemetry::metrics::Counter<f64>,
    attributes: Vec<KeyValue>,
}

impl GaugeFn for OtelFloatCounter {
    fn increment(&self, value: f64) {
        self.counter.add(value, &self.attributes);
    }

    fn decrement(&self, _value: f64) {}

    fn set(&self, _value: f64) {}
}

struct OtelHistogram {
    histogram: opentelemetry::metrics::Histogram<f64>,
    attributes: Vec<KeyValue>,
}

impl HistogramFn for OtelHistogram {
    fn record(&self, value: f64) {
        self.histogram.record(value, &self.attributes);
    }
}

/// A [`Recorder`] backed by an OpenTelemetry [`Meter`].
#[derive(Clone)]
pub struct OtelRecorder {
    registry: Arc<Registry<Key, OtelStorage>>,
    descriptions: Descriptions,
}

impl OtelRecorder {
    pub fn new(meter: Meter) -> Self {
        let descriptions: Descriptions = Arc::new(DashMap::new());
        let storage = OtelStorage {
            meter,
            descriptions: descriptions.clone(),
        };
        Self {
            registry: Arc::new(Registry::new(storage)),
            descriptions,
        }
    }

    fn describe(&self, key_name: KeyName, unit: Option<Unit>, text: SharedString) {
        self.descriptions
            .insert(key_name.as_str().to_string(), Description { unit, text });
    }
}

impl Recorder for OtelRecorder {
    fn describe_counter(&self, key_name: KeyName, unit: Option<Unit>, description: SharedString) {
        self.describe(key_name, unit, description);
    }

    fn describe_gauge(&self, key_name: KeyName, unit: Option<Unit>, description: SharedString) {
        self.describe(key_name, unit, description);
    }

    fn describe_histogram(&self, key_name: KeyName, unit: Option<Unit>, description: SharedString) {
        self.describe(key_name, unit, description);
    }

    fn register_counter(&self, key: &Key, _metadata: &Metadata<'_>) -> Counter {
        self.registry
            .get_or_create_counter(key, |c| Counter::from_arc(c.clone()))
    }

    fn register_gauge(&self, key: &Key, _metadata: &Metadata<'_>) -> Gauge {
        self.registry
            .get_or_create_gauge(key, |g| Gauge::from_arc(g.clone()))
    }

    fn register_histogram(&self, key: &Key, _metadata: &Metadata<'_>) -> Histogram {
        self.registry
            .get_or_create_histogram(key, |h| Histogram::from_arc(h.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::meter::Meter as GatewayMeter;
    use metrics::Label;
    use opentelemetry::metrics::MeterProvider as _;
    use opentelemetry_sdk::metrics::data::{AggregatedMetrics, MetricData};
    use opentelemetry_sdk::metrics::{InMemoryMetricExporter, PeriodicReader, SdkMeterProvider};

    fn provider() -> (SdkMeterProvider, InMemoryMetricExporter) {
        let exporter = InMemoryMetricExporter::default();
        let reader = PeriodicReader::builder(exporter.clone()).build();
        let provider = SdkMeterProvider::builder().with_reader(reader).build();
        (provider, exporter)
    }

    #[test]
    fn test_forwards_counters_and_histograms() {
        let (provider, exporter) = provider();
        let recorder = OtelRecorder::new(provider.meter("bridge-test"));
        let meter = GatewayMeter::from_recorder(recorder);

        meter
            .counter("http.client.request.started.count")
            .add(2, &[Label::new("http.request.method", "GET")]);
        meter
            .histogram("http.client.request.duration")
            .record(0.2, &[]);
        meter.float_counter("read.time").add(0.5, &[]);
        provider.force_flush().unwrap();

        let metrics = exporter.get_finished_metrics().unwrap();
        let names: Vec<String> = metrics
            .iter()
            .flat_map(|rm| rm.scope_metrics())
            .flat_map(|sm| sm.metrics())
            .map(|m| m.name().to_string())
            .collect();
        assert!(names.contains(&"http.client.request.started.count".to_string()));
        assert!(names.contains(&"http.client.request.duration".to_string()));
        assert!(names.contains(&"read.time".to_string()));
    }

    #[test]
    fn test_histogram_uses_time_buckets() {
        let (provider, exporter) = provider();
        let meter = GatewayMeter::from_recorder(OtelRecorder::new(provider.meter("bridge-test")));
        meter.histogram("gateway.proxy.duration").record(0.01, &[]);
        provider.force_flush().unwrap();

        let metrics = exporter.get_finished_metrics().unwrap();
        let metric = metrics
            .iter()
            .flat_map(|rm| rm.scope_metrics())
            .flat_map(|sm| sm.metrics())
            .find(|m| m.name() == "gateway.proxy.duration")
            .expect("histogram exported");
        match metric.data() {
            AggregatedMetrics::F64(MetricData::Histogram(h)) => {
                let point = h.data_points().next().unwrap();
                assert_eq!(
                    point.bounds().collect::<Vec<_>>(),
                    bounds_for("gateway.proxy.duration").unwrap().to_vec()
                );
            }
            _ => panic!("not an f64 histogram"),
        }
    }
}
