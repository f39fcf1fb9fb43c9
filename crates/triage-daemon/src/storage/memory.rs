//! In-memory gateway for tests. Mirrors the Postgres semantics closely
//! enough that consumer scenarios run unchanged against it.

use super::model::{AlertRecord, AnalysisRecord, LastAnalysis};
use super::traits::AnalysisStore;
use super::{StorageResult, ANALYSIS_TYPE_ANOMALY, ANALYSIS_TYPE_DUPLICATE, ANALYSIS_TYPE_LLM};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::Mutex;
use triage_core::{AnalysisReason, Severity};

#[derive(Default)]
struct Inner {
    alerts: Vec<AlertRecord>,
    analyses: Vec<AnalysisRecord>,
    metric_values: Vec<Option<f64>>,
    next_analysis_id: i64,
}

/// In-memory stand-in for the relational store.
#[derive(Default)]
pub struct InMemoryStore {
    inner: Mutex<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an alert row the way the producer would.
    pub fn insert_alert(&self, id: &str, alert_name: &str, instance: &str, severity: Severity) {
        let mut inner = self.inner.lock().expect("store lock");
        inner.alerts.push(AlertRecord {
            id: id.to_string(),
            alert_name: alert_name.to_string(),
            instance: instance.to_string(),
            severity,
            is_duplicate: false,
            reference_alert_id: None,
            created_at: Utc::now(),
        });
    }

    /// Seed historical metric values for training.
    pub fn push_metric_values(&self, values: &[Option<f64>]) {
        let mut inner = self.inner.lock().expect("store lock");
        inner.metric_values.extend_from_slice(values);
    }

    pub fn alert(&self, id: &str) -> Option<AlertRecord> {
        let inner = self.inner.lock().expect("store lock");
        inner.alerts.iter().find(|a| a.id == id).cloned()
    }

    pub fn analyses(&self) -> Vec<AnalysisRecord> {
        let inner = self.inner.lock().expect("store lock");
        inner.analyses.clone()
    }

    fn push_analysis(
        inner: &mut Inner,
        alert_id: Option<String>,
        analysis_type: &str,
        model_name: &str,
        analysis_data: Value,
        confidence_score: f64,
        reference_analysis_id: Option<i64>,
        metadata: Value,
    ) -> i64 {
        inner.next_analysis_id += 1;
        let id = inner.next_analysis_id;
        inner.analyses.push(AnalysisRecord {
            id,
            alert_id,
            analysis_type: analysis_type.to_string(),
            model_name: model_name.to_string(),
            analysis_data,
            confidence_score,
            reference_analysis_id,
            metadata,
            created_at: Utc::now(),
        });
        id
    }
}

#[async_trait]
impl AnalysisStore for InMemoryStore {
    async fn insert_anomaly_result(
        &self,
        model_version: &str,
        analysis_data: &Value,
        confidence: f64,
    ) -> StorageResult<i64> {
        let mut inner = self.inner.lock().expect("store lock");
        Ok(Self::push_analysis(
            &mut inner,
            None,
            ANALYSIS_TYPE_ANOMALY,
            model_version,
            analysis_data.clone(),
            confidence,
            None,
            Value::Null,
        ))
    }

    async fn insert_llm_result(
        &self,
        alert_id: &str,
        model_name: &str,
        analysis: &Value,
        confidence: f64,
        reason: AnalysisReason,
    ) -> StorageResult<i64> {
        let mut inner = self.inner.lock().expect("store lock");
        Ok(Self::push_analysis(
            &mut inner,
            Some(alert_id.to_string()),
            ANALYSIS_TYPE_LLM,
            model_name,
            analysis.clone(),
            confidence,
            None,
            json!({ "analysis_reason": reason.as_str() }),
        ))
    }

    async fn insert_llm_failure(
        &self,
        alert_id: &str,
        model_name: &str,
        error: &str,
        reason: AnalysisReason,
    ) -> StorageResult<i64> {
        let mut inner = self.inner.lock().expect("store lock");
        Ok(Self::push_analysis(
            &mut inner,
            Some(alert_id.to_string()),
            ANALYSIS_TYPE_LLM,
            model_name,
            json!({ "error": error }),
            0.0,
            None,
            json!({ "analysis_reason": reason.as_str(), "failure": true }),
        ))
    }

    async fn mark_duplicate(
        &self,
        alert_id: &str,
        reference_alert_id: &str,
        reference_analysis_id: i64,
        reason: &str,
    ) -> StorageResult<()> {
        let mut inner = self.inner.lock().expect("store lock");

        if let Some(alert) = inner.alerts.iter_mut().find(|a| a.id == alert_id) {
            alert.is_duplicate = true;
            alert.reference_alert_id = Some(reference_alert_id.to_string());
        }

        Self::push_analysis(
            &mut inner,
            Some(alert_id.to_string()),
            ANALYSIS_TYPE_DUPLICATE,
            "deduplication",
            json!({ "duplicate": true, "message": "Same alert already analyzed" }),
            1.0,
            Some(reference_analysis_id),
            json!({ "analysis_reason": reason }),
        );
        Ok(())
    }

    async fn find_last_analysis(
        &self,
        alert_name: &str,
        instance: &str,
    ) -> StorageResult<Option<LastAnalysis>> {
        let inner = self.inner.lock().expect("store lock");

        // Newest non-duplicate alert of the pair that has an llm_analysis
        // row, like the SQL join. Iterating in reverse keeps insertion
        // order as the tiebreak for identical timestamps.
        for alert in inner.alerts.iter().rev() {
            if alert.is_duplicate
                || alert.alert_name != alert_name
                || alert.instance != instance
            {
                continue;
            }
            let analysis = inner
                .analyses
                .iter()
                .rev()
                .find(|r| {
                    r.analysis_type == ANALYSIS_TYPE_LLM
                        && r.alert_id.as_deref() == Some(alert.id.as_str())
                });
            if let Some(analysis) = analysis {
                return Ok(Some(LastAnalysis {
                    alert_id: alert.id.clone(),
                    severity: alert.severity,
                    created_at: alert.created_at,
                    analysis_id: analysis.id,
                }));
            }
        }
        Ok(None)
    }

    async fn fetch_training_values(&self, limit: i64) -> StorageResult<Vec<f64>> {
        let inner = self.inner.lock().expect("store lock");
        Ok(inner
            .metric_values
            .iter()
            .rev()
            .take(limit as usize)
            .map(|v| v.unwrap_or(0.0))
            .collect())
    }

    async fn ping(&self) -> StorageResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn find_last_analysis_requires_llm_row() {
        let store = InMemoryStore::new();
        store.insert_alert("A1", "HighCPU", "srv-1", Severity::Warning);

        // Producer row alone is not an analyzed occurrence.
        assert!(store
            .find_last_analysis("HighCPU", "srv-1")
            .await
            .unwrap()
            .is_none());

        let analysis_id = store
            .insert_llm_result("A1", "llama2", &json!({"ok": true}), 0.85, AnalysisReason::FirstOccurrence)
            .await
            .unwrap();

        let found = store
            .find_last_analysis("HighCPU", "srv-1")
            .await
            .unwrap()
            .expect("analyzed occurrence");
        assert_eq!(found.alert_id, "A1");
        assert_eq!(found.analysis_id, analysis_id);
        assert_eq!(found.severity, Severity::Warning);
    }

    #[tokio::test]
    async fn find_last_analysis_skips_duplicates() {
        let store = InMemoryStore::new();
        store.insert_alert("A1", "HighCPU", "srv-1", Severity::Critical);
        let analysis_id = store
            .insert_llm_result("A1", "llama2", &json!({}), 0.85, AnalysisReason::FirstOccurrence)
            .await
            .unwrap();

        store.insert_alert("A2", "HighCPU", "srv-1", Severity::Critical);
        store
            .mark_duplicate("A2", "A1", analysis_id, "duplicate_same_severity")
            .await
            .unwrap();

        // A2 is the newest row but a duplicate; the lookup must keep
        // resolving to A1.
        let found = store
            .find_last_analysis("HighCPU", "srv-1")
            .await
            .unwrap()
            .expect("analyzed occurrence");
        assert_eq!(found.alert_id, "A1");

        let a2 = store.alert("A2").unwrap();
        assert!(a2.is_duplicate);
        assert_eq!(a2.reference_alert_id.as_deref(), Some("A1"));
    }

    #[tokio::test]
    async fn training_values_substitute_zero_for_null() {
        let store = InMemoryStore::new();
        store.push_metric_values(&[Some(1.0), None, Some(3.0)]);
        let values = store.fetch_training_values(10).await.unwrap();
        assert_eq!(values, vec![3.0, 0.0, 1.0]);
    }
}
