//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! ConfigData
//!     → exporter/ (OTLP collector, Prometheus scrape endpoint)
//!     → handle.rs (meter fan-out, tracer, propagator)
//!     → registry.rs (current generation, swapped on reload)
//!
//! Trackers (http/, io/, pipeline/) bind:
//!     → instruments.rs (names per semantic convention)
//!     → attributes.rs (labels, span attributes, header attributes)
//!     → propagation.rs (W3C trace context in and out)
//!
//! The crate's own diagnostics:
//!     → logging.rs (structured log events)
//! ```
//!
//! # Design Decisions
//! - Metrics go through the `metrics` facade, traces through OpenTelemetry
//! - A handle without meter or tracer is a valid, silent handle
//! - Instruments are bound once per generation, not per request

pub mod attributes;
pub mod exporter;
pub mod handle;
pub mod instruments;
pub mod logging;
pub mod meter;
pub mod propagation;
pub mod registry;

pub use exporter::{ExporterError, ExporterSet, MetricExporter, MetricReader, TraceExporter};
pub use handle::{HandleBuilder, InstrumentationHandle};
pub use meter::Meter;
pub use registry::{Registry, Telemetry};
