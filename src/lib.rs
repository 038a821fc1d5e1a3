//! OpenTelemetry instrumentation for an API gateway.
//!
//! Reports metrics and traces for every stage a request crosses: the
//! inbound server, the endpoint pipeline, each backend call and the HTTP
//! round trips underneath it, down to body reads and writes.

pub mod config;
pub mod context;
pub mod http;
pub mod io;
pub mod lifecycle;
pub mod observability;
pub mod pipeline;

pub use config::{ConfigData, ConfigResolver};
pub use context::RequestContext;
pub use http::{InstrumentedClient, RoundTripTracker, ServerTracker, ServerTrackingLayer};
pub use io::StreamTracker;
pub use lifecycle::Shutdown;
pub use observability::{InstrumentationHandle, Registry, Telemetry};
pub use pipeline::StageMiddleware;
