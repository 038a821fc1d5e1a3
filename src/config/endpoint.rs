//! Endpoint and backend descriptors supplied by the host router.
//!
//! The router owns matching and dispatch; this crate only needs the
//! metadata below to decide what to instrument and how to label it.

use serde::{Deserialize, Serialize};

/// Key of the telemetry section inside any `extra_config` map.
pub const NAMESPACE: &str = "telemetry/opentelemetry";

/// Free-form per-component configuration, keyed by namespace.
pub type ExtraConfig = serde_json::Map<String, serde_json::Value>;

/// A public endpoint exposed by the gateway.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// Route pattern, possibly templated (`/users/{{.Id}}`).
    pub endpoint: String,
    pub method: String,
    pub extra_config: ExtraConfig,
    pub backends: Vec<BackendConfig>,
}

/// An upstream call made on behalf of an endpoint.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Upstream path pattern, possibly templated.
    pub url_pattern: String,
    pub method: String,
    /// Candidate hosts (`http://host:port`).
    pub hosts: Vec<String>,
    pub parent_endpoint: String,
    pub parent_endpoint_method: String,
    pub extra_config: ExtraConfig,
}

impl EndpointConfig {
    /// Backend descriptors with their parent fields filled in.
    pub fn linked_backends(&self) -> Vec<BackendConfig> {
        self.backends
            .iter()
            .cloned()
            .map(|mut b| {
                b.parent_endpoint = self.endpoint.clone();
                b.parent_endpoint_method = self.method.clone();
                b
            })
            .collect()
    }
}
