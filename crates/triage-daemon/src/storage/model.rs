//! Row models for the tables the worker touches.

use chrono::{DateTime, Utc};
use serde_json::Value;
use triage_core::Severity;

pub const ANALYSIS_TYPE_LLM: &str = "llm_analysis";
pub const ANALYSIS_TYPE_ANOMALY: &str = "anomaly_detection";
pub const ANALYSIS_TYPE_DUPLICATE: &str = "duplicate_reference";

/// The most recent analyzed (non-duplicate) occurrence of an
/// `(alert_name, instance)` pair, joined to its analysis row.
#[derive(Debug, Clone)]
pub struct LastAnalysis {
    pub alert_id: String,
    pub severity: Severity,
    pub created_at: DateTime<Utc>,
    pub analysis_id: i64,
}

/// A row of the `alerts` table. Written by the producer; the worker only
/// flips the duplicate marker.
#[derive(Debug, Clone)]
pub struct AlertRecord {
    pub id: String,
    pub alert_name: String,
    pub instance: String,
    pub severity: Severity,
    pub is_duplicate: bool,
    pub reference_alert_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A row of the `ai_analysis_results` table. Append-only.
#[derive(Debug, Clone)]
pub struct AnalysisRecord {
    pub id: i64,
    pub alert_id: Option<String>,
    pub analysis_type: String,
    pub model_name: String,
    pub analysis_data: Value,
    pub confidence_score: f64,
    pub reference_analysis_id: Option<i64>,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}
