//! Byte stream instrumentation.
//!
//! # Data Flow
//! ```text
//! StreamTracker (instruments + label sets, built once)
//!     → track() per stream
//!     → TrackedReader / TrackedWriter / TrackedBody
//!     → first transfer opens the span, end/error/close reports once
//! ```
//!
//! # Design Decisions
//! - The span starts at the first transfer, not at wrap time
//! - A clean end of stream is never an error; other errors are recorded
//!   and passed through unchanged

pub mod body;
pub mod reader;
pub mod tracking;
pub mod writer;

pub use body::TrackedBody;
pub use reader::TrackedReader;
pub use tracking::{StreamTracker, Tracking, READ_PREFIX, WRITE_PREFIX};
pub use writer::TrackedWriter;
