//! Pipeline stage instrumentation.
//!
//! # Data Flow
//! ```text
//! EndpointConfig / BackendConfig
//!     → factory.rs (skip list, disabled layers, static attributes)
//!     → stage.rs (span + gateway.<stage>.duration around the next stage)
//!     → outcome.rs (error / canceled / complete)
//! ```
//!
//! # Design Decisions
//! - A stage is an `Arc`'d async callable
//! - A fan-out error is canceled only when every backend was canceled

pub mod factory;
pub mod outcome;
pub mod proxy;
pub mod stage;

pub use factory::{
    backend_round_trip_tracker, backend_stage, backend_static_attributes, proxy_stage,
};
pub use outcome::{MultiError, Outcome};
pub use proxy::{proxy_fn, Proxy, ProxyError, ProxyRequest, ProxyResponse, ProxyResult};
pub use stage::{StageMiddleware, StageOptions};
