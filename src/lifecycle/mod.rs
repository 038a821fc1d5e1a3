//! Process lifecycle: signals and shutdown fan-out.
//!
//! # Data Flow
//! ```text
//! SIGTERM / Ctrl-C (signals.rs)
//!     → Shutdown::trigger (shutdown.rs)
//!     → demo server stops accepting, scrape listeners exit
//!     → InstrumentationHandle::shutdown flushes exporters within a deadline
//! ```

pub mod shutdown;
pub mod signals;

pub use shutdown::Shutdown;
pub use signals::shutdown_signal;
