//! The gateway trait: every statement the worker runs, as a typed
//! operation. No SQL escapes this module's implementors.

use super::model::LastAnalysis;
use super::StorageResult;
use async_trait::async_trait;
use serde_json::Value;
use triage_core::AnalysisReason;

#[async_trait]
pub trait AnalysisStore: Send + Sync {
    /// Record an anomaly hit for a metric. Returns the new analysis id.
    async fn insert_anomaly_result(
        &self,
        model_version: &str,
        analysis_data: &Value,
        confidence: f64,
    ) -> StorageResult<i64>;

    /// Record a completed analysis for an alert. Returns the new analysis id.
    async fn insert_llm_result(
        &self,
        alert_id: &str,
        model_name: &str,
        analysis: &Value,
        confidence: f64,
        reason: AnalysisReason,
    ) -> StorageResult<i64>;

    /// Record a terminal analysis failure for an alert (confidence 0.0,
    /// `failure: true` in metadata). Returns the new analysis id.
    async fn insert_llm_failure(
        &self,
        alert_id: &str,
        model_name: &str,
        error: &str,
        reason: AnalysisReason,
    ) -> StorageResult<i64>;

    /// Flip the alert's duplicate marker and insert its reference row in
    /// one transaction.
    async fn mark_duplicate(
        &self,
        alert_id: &str,
        reference_alert_id: &str,
        reference_analysis_id: i64,
        reason: &str,
    ) -> StorageResult<()>;

    /// The most recent analyzed, non-duplicate occurrence of the pair.
    async fn find_last_analysis(
        &self,
        alert_name: &str,
        instance: &str,
    ) -> StorageResult<Option<LastAnalysis>>;

    /// Most recent metric values for model training, newest first. NULLs
    /// come back as 0.0.
    async fn fetch_training_values(&self, limit: i64) -> StorageResult<Vec<f64>>;

    /// Liveness probe used by the health listener.
    async fn ping(&self) -> StorageResult<()>;
}
