//! Outbound HTTP instrumentation.
//!
//! # Data Flow
//! ```text
//! InstrumentedClient::request
//!     → RoundTripTracker::start (span, propagation headers on a copy)
//!     → hyper-util client (TrackedConnector / TrackedTcp / TrackedResolver
//!       report phases, TLS through hyper-rustls)
//!     → RoundTrip::finish_* (one metric sample set, one span)
//!     → response body wrapped by the response read StreamTracker
//! ```

pub mod client;
pub mod connector;
pub mod tracker;

pub use client::{ClientBody, ClientError, InstrumentedClient};
pub use connector::{
    native_tls_config, ConnectionPhases, TcpConnector, TrackedConnector, TrackedResolver, TrackedTcp,
};
pub use tracker::{ClientOptions, RoundTrip, RoundTripTracker, SignalOptions};
