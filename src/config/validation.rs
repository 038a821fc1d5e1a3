//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Exporter names are unique across every exporter kind
//! - Static attribute lists carry no duplicate keys
//! - Exporter endpoints are addressable
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ConfigData → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashSet;

use thiserror::Error;

use crate::config::schema::{Attributes, ConfigData, Exporters};

/// A single semantic problem found in a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{kind} exporter with duplicate name: {name} (at idx {index})")]
    DuplicateExporterName {
        kind: &'static str,
        name: String,
        index: usize,
    },

    #[error("{kind} exporter at idx {index} has no name")]
    UnnamedExporter { kind: &'static str, index: usize },

    #[error("{kind} exporter {name} has an invalid port")]
    InvalidExporterPort { kind: &'static str, name: String },

    #[error("duplicate attribute key {key:?} in {scope}")]
    DuplicateAttributeKey { scope: &'static str, key: String },
}

/// Validate a decoded configuration.
pub fn validate_config(config: &ConfigData) -> Result<(), Vec<ValidationError>> {
    let mut errors = validate_exporters(&config.exporters);

    let layers = &config.layers;
    let scopes: [(&'static str, &Attributes); 6] = [
        ("layers.global.metrics_static_attributes", &layers.global.metrics_static_attributes),
        ("layers.global.traces_static_attributes", &layers.global.traces_static_attributes),
        ("layers.proxy.metrics_static_attributes", &layers.proxy.metrics_static_attributes),
        ("layers.proxy.traces_static_attributes", &layers.proxy.traces_static_attributes),
        ("layers.backend.metrics.static_attributes", &layers.backend.metrics.static_attributes),
        ("layers.backend.traces.static_attributes", &layers.backend.traces.static_attributes),
    ];
    for (scope, attrs) in scopes {
        if let Err(e) = validate_attributes(scope, attrs) {
            errors.push(e);
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Check exporter naming and addressing.
pub fn validate_exporters(exporters: &Exporters) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    let mut names = HashSet::with_capacity(exporters.otlp.len() + exporters.prometheus.len());

    let otlp = exporters
        .otlp
        .iter()
        .enumerate()
        .map(|(index, e)| ("OTLP", index, e.name.as_str(), e.port));
    let prometheus = exporters
        .prometheus
        .iter()
        .enumerate()
        .map(|(index, e)| ("prometheus", index, e.name.as_str(), e.port));

    for (kind, index, name, port) in otlp.chain(prometheus) {
        if name.is_empty() {
            errors.push(ValidationError::UnnamedExporter { kind, index });
            continue;
        }
        if !names.insert(name) {
            errors.push(ValidationError::DuplicateExporterName {
                kind,
                name: name.to_string(),
                index,
            });
        }
        if port == 0 {
            errors.push(ValidationError::InvalidExporterPort {
                kind,
                name: name.to_string(),
            });
        }
    }
    errors
}

/// Reject a static attribute list with a repeated key.
pub fn validate_attributes(scope: &'static str, attrs: &Attributes) -> Result<(), ValidationError> {
    attrs
        .to_map()
        .map(|_| ())
        .map_err(|dup| ValidationError::DuplicateAttributeKey { scope, key: dup.0 })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::{Attribute, OtlpExporterConfig, PrometheusExporterConfig};

    fn otlp(name: &str) -> OtlpExporterConfig {
        OtlpExporterConfig {
            name: name.to_string(),
            ..Default::default()
        }
    }

    fn prometheus(name: &str) -> PrometheusExporterConfig {
        PrometheusExporterConfig {
            name: name.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(validate_config(&ConfigData::default()).is_ok());
    }

    #[test]
    fn test_duplicate_exporter_names_across_kinds() {
        let mut cfg = ConfigData::default();
        cfg.exporters.otlp = vec![otlp("a"), otlp("b")];
        cfg.exporters.prometheus = vec![prometheus("c"), prometheus("a")];

        let errors = validate_config(&cfg).unwrap_err();
        assert_eq!(
            errors,
            vec![ValidationError::DuplicateExporterName {
                kind: "prometheus",
                name: "a".into(),
                index: 1,
            }]
        );
        assert_eq!(
            errors[0].to_string(),
            "prometheus exporter with duplicate name: a (at idx 1)"
        );
    }

    #[test]
    fn test_duplicate_otlp_names() {
        let mut cfg = ConfigData::default();
        cfg.exporters.otlp = vec![otlp("x"), otlp("x")];
        let errors = validate_config(&cfg).unwrap_err();
        assert_eq!(errors[0].to_string(), "OTLP exporter with duplicate name: x (at idx 1)");
    }

    #[test]
    fn test_reports_all_errors() {
        let mut cfg = ConfigData::default();
        cfg.exporters.otlp = vec![otlp(""), OtlpExporterConfig { port: 0, ..otlp("zero") }];
        cfg.layers.proxy.metrics_static_attributes = Attributes::new(vec![
            Attribute::new("env", "a"),
            Attribute::new("env", "b"),
        ]);

        let errors = validate_config(&cfg).unwrap_err();
        assert_eq!(errors.len(), 3);
        assert!(errors.contains(&ValidationError::UnnamedExporter { kind: "OTLP", index: 0 }));
        assert!(errors.contains(&ValidationError::InvalidExporterPort {
            kind: "OTLP",
            name: "zero".into(),
        }));
        assert!(errors.contains(&ValidationError::DuplicateAttributeKey {
            scope: "layers.proxy.metrics_static_attributes",
            key: "env".into(),
        }));
    }
}
