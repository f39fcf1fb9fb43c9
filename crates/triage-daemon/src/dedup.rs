//! Resource-aware alert deduplication.
//!
//! An expensive analysis runs only when the situation changed: first sight
//! of an `(alert_name, instance)` pair, or a move up (escalation) or down
//! (recovery) in severity against the last analyzed occurrence. Repeats at
//! the same severity are recorded as cheap duplicate references instead.

use crate::storage::{AnalysisStore, LastAnalysis, StorageResult};
use std::sync::Arc;
use triage_core::{classify, Classification, ClassificationInput};

pub struct Deduplicator {
    store: Arc<dyn AnalysisStore>,
}

impl Deduplicator {
    pub fn new(store: Arc<dyn AnalysisStore>) -> Self {
        Self { store }
    }

    /// Decide whether the alert warrants analysis. Also returns the prior
    /// occurrence so a duplicate can be linked without a second lookup.
    pub async fn classify(
        &self,
        input: &ClassificationInput,
    ) -> StorageResult<(Classification, Option<LastAnalysis>)> {
        let prior = self
            .store
            .find_last_analysis(&input.alert_name, &input.instance)
            .await?;

        let decision = classify(input.severity, prior.as_ref().map(|p| p.severity));

        match decision {
            Classification::Analyze(reason) => {
                tracing::info!(
                    alert_name = %input.alert_name,
                    instance = %input.instance,
                    severity = %input.severity,
                    reason = %reason,
                    "alert selected for analysis"
                );
            }
            Classification::DuplicateSameSeverity => {
                tracing::debug!(
                    alert_name = %input.alert_name,
                    instance = %input.instance,
                    severity = %input.severity,
                    "duplicate alert at unchanged severity"
                );
            }
        }

        Ok((decision, prior))
    }

    /// Mark the alert as a duplicate of the prior occurrence and insert the
    /// reference row pointing at its analysis.
    pub async fn mark_duplicate(
        &self,
        alert_id: &str,
        prior: &LastAnalysis,
        reason: &str,
    ) -> StorageResult<()> {
        self.store
            .mark_duplicate(alert_id, &prior.alert_id, prior.analysis_id, reason)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStore;
    use serde_json::json;
    use triage_core::{AnalysisReason, Severity};

    fn input(severity: Severity) -> ClassificationInput {
        ClassificationInput {
            alert_name: "HighMem".into(),
            instance: "srv-2".into(),
            severity,
        }
    }

    async fn seed_analyzed(store: &InMemoryStore, id: &str, severity: Severity) -> i64 {
        store.insert_alert(id, "HighMem", "srv-2", severity);
        store
            .insert_llm_result(id, "llama2", &json!({}), 0.85, AnalysisReason::FirstOccurrence)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn unseen_pair_is_first_occurrence() {
        let store = Arc::new(InMemoryStore::new());
        let dedup = Deduplicator::new(store);
        let (decision, prior) = dedup.classify(&input(Severity::Warning)).await.unwrap();
        assert_eq!(
            decision,
            Classification::Analyze(AnalysisReason::FirstOccurrence)
        );
        assert!(prior.is_none());
    }

    #[tokio::test]
    async fn severity_change_against_prior_state() {
        let store = Arc::new(InMemoryStore::new());
        seed_analyzed(&store, "A1", Severity::Warning).await;
        let dedup = Deduplicator::new(store);

        let (escalation, _) = dedup.classify(&input(Severity::Critical)).await.unwrap();
        assert_eq!(
            escalation,
            Classification::Analyze(AnalysisReason::Escalation)
        );

        let (recovery, _) = dedup.classify(&input(Severity::Info)).await.unwrap();
        assert_eq!(recovery, Classification::Analyze(AnalysisReason::Recovery));

        let (duplicate, prior) = dedup.classify(&input(Severity::Warning)).await.unwrap();
        assert_eq!(duplicate, Classification::DuplicateSameSeverity);
        assert_eq!(prior.unwrap().alert_id, "A1");
    }

    #[tokio::test]
    async fn mark_duplicate_links_to_prior_analysis() {
        let store = Arc::new(InMemoryStore::new());
        let analysis_id = seed_analyzed(&store, "A1", Severity::Critical).await;
        store.insert_alert("A2", "HighMem", "srv-2", Severity::Critical);

        let dedup = Deduplicator::new(store.clone());
        let (_, prior) = dedup.classify(&input(Severity::Critical)).await.unwrap();
        dedup
            .mark_duplicate("A2", &prior.unwrap(), "duplicate_same_severity")
            .await
            .unwrap();

        let a2 = store.alert("A2").unwrap();
        assert!(a2.is_duplicate);
        assert_eq!(a2.reference_alert_id.as_deref(), Some("A1"));

        let reference = store
            .analyses()
            .into_iter()
            .find(|r| r.analysis_type == "duplicate_reference")
            .expect("reference row");
        assert_eq!(reference.reference_analysis_id, Some(analysis_id));
        assert_eq!(reference.confidence_score, 1.0);
    }
}
