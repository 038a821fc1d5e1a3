//! Attribute helpers shared by the trackers.
//!
//! Metric labels and span attributes come from the same configured
//! [`Attributes`], so both conversions live here.

use http::{HeaderMap, Method};
use metrics::Label;
use opentelemetry::{Array, KeyValue, StringValue, Value};

use crate::config::schema::Attributes;

/// Method reported for anything outside the known set.
pub const OTHER_METHOD: &str = "_OTHER";

/// Metric labels for the reportable entries of `attrs`. A key listed
/// twice keeps its last value.
pub fn labels(attrs: &Attributes) -> Vec<Label> {
    let mut out = Vec::new();
    extend_labels(
        &mut out,
        attrs
            .reportable()
            .map(|a| Label::new(a.key.clone(), a.value.clone())),
    );
    out
}

/// Span attributes for the reportable entries of `attrs`. A key listed
/// twice keeps its last value.
pub fn key_values(attrs: &Attributes) -> Vec<KeyValue> {
    let mut out = Vec::new();
    extend_key_values(
        &mut out,
        attrs
            .reportable()
            .map(|a| KeyValue::new(a.key.clone(), a.value.clone())),
    );
    out
}

/// Metric labels carrying the same pairs as `kvs`.
pub fn labels_from_key_values(kvs: &[KeyValue]) -> Vec<Label> {
    let mut out = Vec::new();
    extend_labels(
        &mut out,
        kvs.iter()
            .map(|kv| Label::new(kv.key.as_str().to_string(), kv.value.as_str().into_owned())),
    );
    out
}

/// Add `label`, replacing a label with the same key so a series never
/// carries a key twice.
pub fn set_label(labels: &mut Vec<Label>, label: Label) {
    match labels.iter_mut().find(|l| l.key() == label.key()) {
        Some(existing) => *existing = label,
        None => labels.push(label),
    }
}

/// [`set_label`] for each of `more`, in order.
pub fn extend_labels(labels: &mut Vec<Label>, more: impl IntoIterator<Item = Label>) {
    for label in more {
        set_label(labels, label);
    }
}

/// Add `kv`, replacing an attribute with the same key.
pub fn set_key_value(attrs: &mut Vec<KeyValue>, kv: KeyValue) {
    match attrs.iter_mut().find(|a| a.key == kv.key) {
        Some(existing) => *existing = kv,
        None => attrs.push(kv),
    }
}

/// [`set_key_value`] for each of `more`, in order.
pub fn extend_key_values(attrs: &mut Vec<KeyValue>, more: impl IntoIterator<Item = KeyValue>) {
    for kv in more {
        set_key_value(attrs, kv);
    }
}

/// The method name, or [`OTHER_METHOD`] for non-standard methods.
pub fn method_label(method: &Method) -> &'static str {
    match *method {
        Method::CONNECT => "CONNECT",
        Method::DELETE => "DELETE",
        Method::GET => "GET",
        Method::HEAD => "HEAD",
        Method::OPTIONS => "OPTIONS",
        Method::PATCH => "PATCH",
        Method::POST => "POST",
        Method::PUT => "PUT",
        Method::TRACE => "TRACE",
        _ => OTHER_METHOD,
    }
}

/// One string-array attribute per header name, `<prefix>.<lowercase name>`.
pub fn header_attributes(prefix: &str, headers: &HeaderMap) -> Vec<KeyValue> {
    headers
        .keys()
        .map(|name| {
            let values: Vec<StringValue> = headers
                .get_all(name)
                .iter()
                .map(|v| StringValue::from(String::from_utf8_lossy(v.as_bytes()).into_owned()))
                .collect();
            KeyValue::new(
                format!("{prefix}.{}", name.as_str()),
                Value::Array(Array::String(values)),
            )
        })
        .collect()
}

/// Request headers as `http.request.header.*` attributes.
pub fn request_header_attributes(headers: &HeaderMap) -> Vec<KeyValue> {
    header_attributes("http.request.header", headers)
}

/// Response headers as `http.response.header.*` attributes.
pub fn response_header_attributes(headers: &HeaderMap) -> Vec<KeyValue> {
    header_attributes("http.response.header", headers)
}
