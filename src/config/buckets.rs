//! Histogram bucket boundaries shared by every metric exporter.
//!
//! Instruments do not carry their buckets: exporters pick them by
//! instrument-name suffix so the Prometheus matchers and the OTLP bridge
//! agree on the same layout.

/// Bucket boundaries, in seconds, for latency histograms.
pub const TIME_BUCKETS: [f64; 20] = [
    0.010, 0.020, 0.050, 0.075, 0.100, 0.125, 0.150, 0.175, 0.200, 0.250, 0.300, 0.350, 0.500,
    0.750, 1.000, 1.500, 2.000, 3.500, 5.000, 10.000,
];

const KB: f64 = 1024.0;
const MB: f64 = 1024.0 * 1024.0;

/// Bucket boundaries, in bytes, for payload size histograms.
pub const SIZE_BUCKETS: [f64; 15] = [
    128.0,
    256.0,
    512.0,
    KB,
    4.0 * KB,
    8.0 * KB,
    16.0 * KB,
    32.0 * KB,
    64.0 * KB,
    256.0 * KB,
    512.0 * KB,
    MB,
    4.0 * MB,
    16.0 * MB,
    64.0 * MB,
];

/// Name suffixes of histograms reported with [`TIME_BUCKETS`].
pub const TIME_SUFFIXES: [&str; 2] = ["duration", "time-hist"];

/// Name suffixes of histograms reported with [`SIZE_BUCKETS`].
pub const SIZE_SUFFIXES: [&str; 2] = ["size-hist", "size"];

/// Returns the bucket layout for a histogram name, if one applies.
pub fn bounds_for(name: &str) -> Option<&'static [f64]> {
    if TIME_SUFFIXES.iter().any(|s| name.ends_with(s)) {
        return Some(&TIME_BUCKETS);
    }
    if SIZE_SUFFIXES.iter().any(|s| name.ends_with(s)) {
        return Some(&SIZE_BUCKETS);
    }
    None
}
