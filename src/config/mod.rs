//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML/JSON) or host extra_config tree
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → ConfigData (validated, defaults applied, immutable)
//!     → resolver.rs (per-stage, per-endpoint effective options)
//!
//! On reload:
//!     watcher.rs detects change
//!     → loader.rs loads new config
//!     → validation.rs validates
//!     → registry swaps a new snapshot
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; changes require full reload
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod buckets;
pub mod endpoint;
pub mod loader;
pub mod memo;
pub mod pattern;
pub mod resolver;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use endpoint::{BackendConfig, EndpointConfig, ExtraConfig, NAMESPACE};
pub use loader::{load_config, ConfigError};
pub use pattern::normalize_url_pattern;
pub use resolver::{ConfigResolver, EffectiveOptions, Stage};
pub use schema::{Attribute, Attributes, ConfigData, SemanticConvention};
