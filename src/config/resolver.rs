//! Layered option resolution.
//!
//! # Data Flow
//! ```text
//! service-level layers (ConfigData.layers)
//!     + endpoint/backend override (extra_config["telemetry/opentelemetry"].layers)
//!     → merge (scalars replaced, attribute lists appended)
//!     → effective options, cached per distinct override document
//! ```
//!
//! # Design Decisions
//! - An absent or malformed override is "no config", never an error for
//!   the request pipeline; the service-level options apply
//! - Attribute lists are concatenated service-first and never deduplicated
//! - Results are immutable and shared through `Arc`

use std::sync::Arc;

use dashmap::DashMap;
use serde::Deserialize;

use crate::config::endpoint::{BackendConfig, EndpointConfig, ExtraConfig, NAMESPACE};
use crate::config::loader::ConfigError;
use crate::config::schema::{
    Attributes, BackendMetricOpts, BackendOpts, BackendTraceOpts, ConfigData, GlobalOpts,
    PipeOpts, SemanticConvention,
};

/// Instrumented stage of the request lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Inbound HTTP handling.
    Global,
    /// Endpoint pipeline.
    Pipe,
    /// Backend call.
    Backend,
}

/// Layers overridden at the endpoint or backend level.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct LayersOverride {
    pub global: Option<GlobalOpts>,
    pub proxy: Option<PipeOpts>,
    pub backend: Option<BackendOverride>,
}

/// Backend override; each half replaces the service-level half it names.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct BackendOverride {
    pub metrics: Option<BackendMetricOpts>,
    pub traces: Option<BackendTraceOpts>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct OverrideDocument {
    layers: LayersOverride,
}

/// Read the override section of an endpoint or backend `extra_config`.
///
/// Returns [`ConfigError::NoConfig`] when the namespace is absent, and a
/// JSON error when it cannot be decoded. An empty section is a valid,
/// empty override.
pub fn parse_override(extra: &ExtraConfig) -> Result<LayersOverride, ConfigError> {
    let section = extra.get(NAMESPACE).ok_or(ConfigError::NoConfig)?;
    let doc: OverrideDocument = serde_json::from_value(section.clone())?;
    Ok(doc.layers)
}

/// Options that can be refined by an override.
pub trait Layered: Clone + Default {
    /// Scalars from `over`, attribute lists of `self` followed by `over`'s.
    fn merged_with(&self, over: &Self) -> Self;
}

/// Combine a service-level value with an optional override.
pub fn merge<T: Layered>(service: Option<&T>, over: Option<&T>) -> T {
    match (service, over) {
        (None, None) => T::default(),
        (Some(s), None) => s.clone(),
        (None, Some(o)) => o.clone(),
        (Some(s), Some(o)) => s.merged_with(o),
    }
}

impl Layered for GlobalOpts {
    fn merged_with(&self, over: &Self) -> Self {
        GlobalOpts {
            metrics_static_attributes: self
                .metrics_static_attributes
                .concat(&over.metrics_static_attributes),
            traces_static_attributes: self
                .traces_static_attributes
                .concat(&over.traces_static_attributes),
            ..over.clone()
        }
    }
}

impl Layered for PipeOpts {
    fn merged_with(&self, over: &Self) -> Self {
        PipeOpts {
            metrics_static_attributes: self
                .metrics_static_attributes
                .concat(&over.metrics_static_attributes),
            traces_static_attributes: self
                .traces_static_attributes
                .concat(&over.traces_static_attributes),
            ..over.clone()
        }
    }
}

impl Layered for BackendMetricOpts {
    fn merged_with(&self, over: &Self) -> Self {
        BackendMetricOpts {
            static_attributes: self.static_attributes.concat(&over.static_attributes),
            ..over.clone()
        }
    }
}

impl Layered for BackendTraceOpts {
    fn merged_with(&self, over: &Self) -> Self {
        BackendTraceOpts {
            static_attributes: self.static_attributes.concat(&over.static_attributes),
            ..over.clone()
        }
    }
}

impl Layered for BackendOpts {
    fn merged_with(&self, over: &Self) -> Self {
        BackendOpts {
            metrics: self.metrics.merged_with(&over.metrics),
            traces: self.traces.merged_with(&over.traces),
        }
    }
}

fn merge_backend(service: &BackendOpts, over: Option<&BackendOverride>) -> BackendOpts {
    let Some(over) = over else {
        return service.clone();
    };
    BackendOpts {
        metrics: merge(Some(&service.metrics), over.metrics.as_ref()),
        traces: merge(Some(&service.traces), over.traces.as_ref()),
    }
}

/// What a stage records, after merging.
#[derive(Debug, Clone, PartialEq)]
pub struct EffectiveOptions {
    pub metrics_enabled: bool,
    pub traces_enabled: bool,
    pub report_headers: bool,
    pub detailed_connection: bool,
    pub metric_attributes: Attributes,
    pub trace_attributes: Attributes,
    pub semantic_convention: SemanticConvention,
}

impl EffectiveOptions {
    /// Whether the stage records anything.
    pub fn enabled(&self) -> bool {
        self.metrics_enabled || self.traces_enabled
    }

    pub fn from_global(opts: &GlobalOpts) -> Self {
        Self {
            metrics_enabled: !opts.disable_metrics,
            traces_enabled: !opts.disable_traces,
            report_headers: opts.report_headers,
            detailed_connection: false,
            metric_attributes: opts.metrics_static_attributes.clone(),
            trace_attributes: opts.traces_static_attributes.clone(),
            semantic_convention: opts.semantic_convention,
        }
    }

    pub fn from_pipe(opts: &PipeOpts, semconv: SemanticConvention) -> Self {
        Self {
            metrics_enabled: !opts.disable_metrics,
            traces_enabled: !opts.disable_traces,
            report_headers: opts.report_headers,
            detailed_connection: false,
            metric_attributes: opts.metrics_static_attributes.clone(),
            trace_attributes: opts.traces_static_attributes.clone(),
            semantic_convention: semconv,
        }
    }

    /// Stage-level view of the backend options. Round trip and payload
    /// detail stay on [`BackendOpts`].
    pub fn from_backend(opts: &BackendOpts, semconv: SemanticConvention) -> Self {
        Self {
            metrics_enabled: !opts.metrics.disable_stage,
            traces_enabled: !opts.traces.disable_stage,
            report_headers: opts.traces.report_headers,
            detailed_connection: opts.metrics.detailed_connection || opts.traces.detailed_connection,
            metric_attributes: opts.metrics.static_attributes.clone(),
            trace_attributes: opts.traces.static_attributes.clone(),
            semantic_convention: semconv,
        }
    }
}

/// Resolves effective options for every stage of every endpoint.
pub struct ConfigResolver {
    config: Arc<ConfigData>,
    global_cache: DashMap<String, Arc<GlobalOpts>>,
    pipe_cache: DashMap<String, Arc<PipeOpts>>,
    backend_cache: DashMap<String, Arc<BackendOpts>>,
}

impl ConfigResolver {
    pub fn new(mut config: ConfigData) -> Self {
        config.apply_defaults();
        Self {
            config: Arc::new(config),
            global_cache: DashMap::new(),
            pipe_cache: DashMap::new(),
            backend_cache: DashMap::new(),
        }
    }

    pub fn config(&self) -> &ConfigData {
        &self.config
    }

    /// Service-level options of the inbound handler stage.
    pub fn global_opts(&self) -> &GlobalOpts {
        &self.config.layers.global
    }

    pub fn semantic_convention(&self) -> SemanticConvention {
        self.config.layers.global.semantic_convention
    }

    /// Exact match against the skip list.
    pub fn skip_endpoint(&self, endpoint: &str) -> bool {
        self.config.skip_paths.iter().any(|p| p == endpoint)
    }

    /// Pipe options of an endpoint.
    pub fn endpoint_pipe_opts(&self, endpoint: &EndpointConfig) -> Arc<PipeOpts> {
        self.pipe_opts(&endpoint.endpoint, &endpoint.extra_config)
    }

    /// Backend options of an upstream call.
    pub fn backend_opts(&self, backend: &BackendConfig) -> Arc<BackendOpts> {
        self.backend_opts_for(&backend.url_pattern, &backend.extra_config)
    }

    /// Effective options of `stage` for a component with the given
    /// `extra_config`. Merges are cached per distinct override.
    pub fn resolve(&self, stage: Stage, extra: &ExtraConfig) -> EffectiveOptions {
        let semconv = self.semantic_convention();
        match stage {
            Stage::Global => EffectiveOptions::from_global(&self.global_opts_for(extra)),
            Stage::Pipe => EffectiveOptions::from_pipe(&self.pipe_opts("", extra), semconv),
            Stage::Backend => {
                EffectiveOptions::from_backend(&self.backend_opts_for("", extra), semconv)
            }
        }
    }

    fn global_opts_for(&self, extra: &ExtraConfig) -> Arc<GlobalOpts> {
        let key = cache_key(extra);
        if let Some(cached) = self.global_cache.get(&key) {
            return cached.clone();
        }
        let over = self.override_for("", extra);
        let opts = Arc::new(merge(
            Some(&self.config.layers.global),
            over.as_ref().and_then(|o| o.global.as_ref()),
        ));
        self.global_cache.insert(key, opts.clone());
        opts
    }

    fn pipe_opts(&self, owner: &str, extra: &ExtraConfig) -> Arc<PipeOpts> {
        let key = cache_key(extra);
        if let Some(cached) = self.pipe_cache.get(&key) {
            return cached.clone();
        }
        let over = self.override_for(owner, extra);
        let opts = Arc::new(merge(
            Some(&self.config.layers.proxy),
            over.as_ref().and_then(|o| o.proxy.as_ref()),
        ));
        self.pipe_cache.insert(key, opts.clone());
        opts
    }

    fn backend_opts_for(&self, owner: &str, extra: &ExtraConfig) -> Arc<BackendOpts> {
        let key = cache_key(extra);
        if let Some(cached) = self.backend_cache.get(&key) {
            return cached.clone();
        }
        let over = self.override_for(owner, extra);
        let opts = Arc::new(merge_backend(
            &self.config.layers.backend,
            over.as_ref().and_then(|o| o.backend.as_ref()),
        ));
        self.backend_cache.insert(key, opts.clone());
        opts
    }

    fn override_for(&self, owner: &str, extra: &ExtraConfig) -> Option<LayersOverride> {
        match parse_override(extra) {
            Ok(over) => Some(over),
            Err(ConfigError::NoConfig) => None,
            Err(e) => {
                tracing::warn!(
                    owner = %owner,
                    error = %e,
                    "Ignoring malformed telemetry override"
                );
                None
            }
        }
    }
}

fn cache_key(extra: &ExtraConfig) -> String {
    extra
        .get(NAMESPACE)
        .map(|v| v.to_string())
        .unwrap_or_default()
}
