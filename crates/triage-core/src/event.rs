//! Typed views of the payloads carried on the ingest stream.
//!
//! Producers publish two kinds of entries, each with a JSON-encoded `data`
//! field. These structs are deliberately tolerant: every field is optional
//! or defaulted, and validity is decided by the consumer per event kind
//! rather than by deserialization failing wholesale.

use crate::severity::Severity;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// A single metric observation. Feeds anomaly detection only; metrics have
/// no persisted identity of their own.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricEvent {
    #[serde(default)]
    pub metric_name: Option<String>,
    /// Raw value as published. Producers are not trusted to send a number,
    /// so coercion happens in [`MetricEvent::numeric_value`].
    #[serde(default)]
    pub metric_value: Option<serde_json::Value>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

/// Rejection reasons for a metric value. The display strings are stored in
/// detection results and must stay stable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValueError {
    #[error("Missing metric_value")]
    Missing,
    #[error("Non-finite value")]
    NonFinite,
    #[error("Invalid value")]
    Invalid,
}

impl MetricEvent {
    pub fn name(&self) -> &str {
        self.metric_name.as_deref().unwrap_or("unknown")
    }

    /// Coerce the published value to a finite float.
    ///
    /// Numbers pass through; numeric strings are parsed; anything else is
    /// invalid. NaN and infinities are rejected separately so the error is
    /// diagnosable downstream.
    pub fn numeric_value(&self) -> Result<f64, ValueError> {
        let raw = match &self.metric_value {
            None | Some(serde_json::Value::Null) => return Err(ValueError::Missing),
            Some(value) => value,
        };

        let parsed = match raw {
            serde_json::Value::Number(n) => n.as_f64().ok_or(ValueError::Invalid)?,
            serde_json::Value::String(s) => s.trim().parse::<f64>().map_err(|_| ValueError::Invalid)?,
            _ => return Err(ValueError::Invalid),
        };

        if !parsed.is_finite() {
            return Err(ValueError::NonFinite);
        }
        Ok(parsed)
    }
}

/// An alert event as published by the producer: a stable id plus the alert
/// payload (labels and annotations).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AlertEvent {
    #[serde(default)]
    pub alert_id: Option<String>,
    #[serde(default)]
    pub payload: AlertPayload,
}

/// Labels and annotations of an alert. `alertname`, `instance` and
/// `severity` are expected label keys; `description` and `summary` are
/// expected annotation keys. All are treated as optional at this boundary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AlertPayload {
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub annotations: HashMap<String, String>,
}

impl AlertPayload {
    pub fn alert_name(&self) -> Option<&str> {
        self.labels.get("alertname").map(String::as_str)
    }

    pub fn instance(&self) -> Option<&str> {
        self.labels.get("instance").map(String::as_str)
    }

    pub fn severity(&self) -> Severity {
        self.labels
            .get("severity")
            .map(|s| Severity::from_label(s))
            .unwrap_or(Severity::Warning)
    }

    pub fn description(&self) -> Option<&str> {
        self.annotations.get("description").map(String::as_str)
    }

    pub fn summary(&self) -> Option<&str> {
        self.annotations.get("summary").map(String::as_str)
    }

    /// The narrow value the classifier keys on. Absent labels become empty
    /// strings so an alert without identity still classifies (it can never
    /// match a prior row, so it analyzes as a first occurrence).
    pub fn classification_input(&self) -> ClassificationInput {
        ClassificationInput {
            alert_name: self.alert_name().unwrap_or_default().to_string(),
            instance: self.instance().unwrap_or_default().to_string(),
            severity: self.severity(),
        }
    }
}

/// Exactly what the duplicate classifier needs, nothing more.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassificationInput {
    pub alert_name: String,
    pub instance: String,
    pub severity: Severity,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn metric(value: serde_json::Value) -> MetricEvent {
        MetricEvent {
            metric_name: Some("cpu".into()),
            metric_value: Some(value),
            labels: HashMap::new(),
        }
    }

    #[test]
    fn numeric_value_accepts_numbers_and_numeric_strings() {
        assert_eq!(metric(json!(95.0)).numeric_value(), Ok(95.0));
        assert_eq!(metric(json!(-3)).numeric_value(), Ok(-3.0));
        assert_eq!(metric(json!("42.5")).numeric_value(), Ok(42.5));
    }

    #[test]
    fn numeric_value_rejects_missing() {
        let event = MetricEvent::default();
        assert_eq!(event.numeric_value(), Err(ValueError::Missing));
        assert_eq!(metric(serde_json::Value::Null).numeric_value(), Err(ValueError::Missing));
    }

    #[test]
    fn numeric_value_rejects_non_numeric() {
        assert_eq!(metric(json!("text")).numeric_value(), Err(ValueError::Invalid));
        assert_eq!(metric(json!([1, 2])).numeric_value(), Err(ValueError::Invalid));
        assert_eq!(metric(json!(true)).numeric_value(), Err(ValueError::Invalid));
    }

    #[test]
    fn numeric_value_rejects_non_finite() {
        assert_eq!(metric(json!("NaN")).numeric_value(), Err(ValueError::NonFinite));
        assert_eq!(metric(json!("inf")).numeric_value(), Err(ValueError::NonFinite));
        assert_eq!(metric(json!("-inf")).numeric_value(), Err(ValueError::NonFinite));
    }

    #[test]
    fn error_strings_are_stable() {
        assert_eq!(ValueError::Missing.to_string(), "Missing metric_value");
        assert_eq!(ValueError::NonFinite.to_string(), "Non-finite value");
        assert_eq!(ValueError::Invalid.to_string(), "Invalid value");
    }

    #[test]
    fn alert_payload_accessors() {
        let payload: AlertPayload = serde_json::from_value(json!({
            "labels": {
                "alertname": "HighCPU",
                "instance": "srv-1",
                "severity": "critical"
            },
            "annotations": {
                "description": "CPU 95%",
                "summary": "CPU saturated"
            }
        }))
        .unwrap();

        assert_eq!(payload.alert_name(), Some("HighCPU"));
        assert_eq!(payload.instance(), Some("srv-1"));
        assert_eq!(payload.severity(), Severity::Critical);
        assert_eq!(payload.description(), Some("CPU 95%"));

        let input = payload.classification_input();
        assert_eq!(input.alert_name, "HighCPU");
        assert_eq!(input.instance, "srv-1");
        assert_eq!(input.severity, Severity::Critical);
    }

    #[test]
    fn alert_payload_tolerates_missing_labels() {
        let payload = AlertPayload::default();
        assert_eq!(payload.alert_name(), None);
        assert_eq!(payload.severity(), Severity::Warning);
        let input = payload.classification_input();
        assert_eq!(input.alert_name, "");
    }
}
