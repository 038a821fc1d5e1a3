//! Metric instruments bound to a set of recorders.
//!
//! A [`Meter`] fans every measurement out to all the recorders produced by
//! the configured exporters. No meter at all (`Option<Meter>::None`) is the
//! disabled path: instruments are never created and nothing is recorded.

use std::sync::Arc;

use metrics::{Key, KeyName, Label, Level, Metadata, Recorder, SharedString, Unit};

/// A recorder shared between the meter and its exporter.
pub type SharedRecorder = Arc<dyn Recorder + Send + Sync>;

fn metadata() -> Metadata<'static> {
    Metadata::new(module_path!(), Level::INFO, Some(module_path!()))
}

/// Factory of named instruments over one or more recorders.
#[derive(Clone)]
pub struct Meter {
    recorders: Arc<[SharedRecorder]>,
}

impl std::fmt::Debug for Meter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Meter")
            .field("recorders", &self.recorders.len())
            .finish()
    }
}

impl Meter {
    /// Returns `None` when there is nothing to record into.
    pub fn new(recorders: Vec<SharedRecorder>) -> Option<Self> {
        if recorders.is_empty() {
            return None;
        }
        Some(Self {
            recorders: recorders.into(),
        })
    }

    /// Convenience for a single recorder.
    pub fn from_recorder<R>(recorder: R) -> Self
    where
        R: Recorder + Send + Sync + 'static,
    {
        Self {
            recorders: Arc::from(vec![Arc::new(recorder) as SharedRecorder]),
        }
    }

    pub fn counter(&self, name: impl Into<String>) -> CounterInstrument {
        CounterInstrument {
            recorders: self.recorders.clone(),
            name: KeyName::from(name.into()),
        }
    }

    /// Monotonic counter of fractional values.
    pub fn float_counter(&self, name: impl Into<String>) -> FloatCounterInstrument {
        FloatCounterInstrument {
            recorders: self.recorders.clone(),
            name: KeyName::from(name.into()),
        }
    }

    pub fn histogram(&self, name: impl Into<String>) -> HistogramInstrument {
        HistogramInstrument {
            recorders: self.recorders.clone(),
            name: KeyName::from(name.into()),
        }
    }

    /// Attach a unit and description to a counter name.
    pub fn describe_counter(&self, name: &str, unit: Unit, description: &'static str) {
        for r in self.recorders.iter() {
            r.describe_counter(
                KeyName::from(name.to_string()),
                Some(unit),
                SharedString::const_str(description),
            );
        }
    }

    /// Attach a unit and description to a histogram name.
    pub fn describe_histogram(&self, name: &str, unit: Unit, description: &'static str) {
        for r in self.recorders.iter() {
            r.describe_histogram(
                KeyName::from(name.to_string()),
                Some(unit),
                SharedString::const_str(description),
            );
        }
    }
}

/// Monotonic integer counter.
#[derive(Clone)]
pub struct CounterInstrument {
    recorders: Arc<[SharedRecorder]>,
    name: KeyName,
}

impl CounterInstrument {
    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    pub fn add(&self, value: u64, labels: &[Label]) {
        let key = Key::from_parts(self.name.clone(), labels.to_vec());
        let meta = metadata();
        for r in self.recorders.iter() {
            r.register_counter(&key, &meta).increment(value);
        }
    }
}

/// Monotonic counter of fractional values.
///
/// The metrics facade only has integer counters, so these are recorded as
/// gauges that are only ever incremented.
#[derive(Clone)]
pub struct FloatCounterInstrument {
    recorders: Arc<[SharedRecorder]>,
    name: KeyName,
}

impl FloatCounterInstrument {
    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    pub fn add(&self, value: f64, labels: &[Label]) {
        let key = Key::from_parts(self.name.clone(), labels.to_vec());
        let meta = metadata();
        for r in self.recorders.iter() {
            r.register_gauge(&key, &meta).increment(value);
        }
    }
}

/// Distribution of values; buckets are chosen by the exporters.
#[derive(Clone)]
pub struct HistogramInstrument {
    recorders: Arc<[SharedRecorder]>,
    name: KeyName,
}

impl HistogramInstrument {
    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    pub fn record(&self, value: f64, labels: &[Label]) {
        let key = Key::from_parts(self.name.clone(), labels.to_vec());
        let meta = metadata();
        for r in self.recorders.iter() {
            r.register_histogram(&key, &meta).record(value);
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[test]
    fn test_meter_requires_recorders() {
        assert!(Meter::new(Vec::new()).is_none());
    }

    #[test]
    fn test_instruments_record_with_labels() {
        let (meter, snap) = debugging_meter();
        let counter = meter.counter("requests");
        counter.add(1, &[Label::new("method", "GET")]);
        counter.add(2, &[Label::new("method", "GET")]);
        meter.histogram("latency.duration").record(0.5, &[]);
        meter.float_counter("read.time").add(0.25, &[]);
        meter.float_counter("read.time").add(0.25, &[]);

        assert_eq!(counter_total(&snap, "requests"), 3);
        assert_eq!(label(&snap, "requests", "method").as_deref(), Some("GET"));
        assert_eq!(histogram_samples(&snap, "latency.duration"), vec![0.5]);
        assert_eq!(gauge_total(&snap, "read.time"), 0.5);
    }

    #[test]
    fn test_fanout_to_every_recorder() {
        let (first, snap_a) = ProbeRecorder::new();
        let (second, snap_b) = ProbeRecorder::new();
        let meter = Meter::new(vec![Arc::new(first), Arc::new(second)]).unwrap();

        meter.counter("fanned").add(4, &[]);
        assert_eq!(counter_total(&snap_a, "fanned"), 4);
        assert_eq!(counter_total(&snap_b, "fanned"), 4);
    }
}
