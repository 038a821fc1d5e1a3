//! HTTP instrumentation, both directions.
//!
//! # Data Flow
//! ```text
//! inbound request
//!     → server (ServerTrackingLayer, one RequestTracking per request)
//!     → pipeline stages
//!     → client (InstrumentedClient, one RoundTrip per backend call)
//!     → response bodies through StreamTracker / ServerBody
//! ```

pub mod client;
pub mod server;

pub use client::{InstrumentedClient, RoundTripTracker};
pub use server::{RequestTracking, ServerTracker, ServerTrackingLayer};
