//! Inbound HTTP instrumentation.
//!
//! # Data Flow
//! ```text
//! ServerTrackingLayer (current Telemetry generation)
//!     → ServerTracker::start (extract caller context, open server span)
//!     → handler (sets route and endpoint attributes, may hijack)
//!     → ServerBody (counts response bytes, reports at end of body)
//! ```

pub mod body;
pub mod layer;
pub mod tracking;

pub use body::ServerBody;
pub use layer::{ServerTracking, ServerTrackingLayer};
pub use tracking::{
    request_scheme, ConnectionScheme, HijackHandle, RequestTracking, ServerTracker, ABORTED_ROUTE,
    ABORTED_STATUS, GLOBAL_STAGE, UPGRADED_ROUTE,
};
