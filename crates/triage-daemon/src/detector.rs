//! Anomaly detector service: owns the persisted model artifact and scores
//! incoming metric events against it.
//!
//! The artifact is loaded (or bootstrapped) once at startup. Retraining
//! fits a replacement on a worker thread, persists it with a
//! write-temp-then-rename, and only then swaps it in; scoring keeps using
//! the previous artifact until the swap.

use crate::error::{DaemonError, DaemonResult};
use crate::storage::AnalysisStore;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use triage_core::{Detection, MetricEvent, ModelArtifact};

/// Rows fetched per retrain, newest first.
const TRAINING_FETCH_LIMIT: i64 = 10_000;

/// Rows sampled per evaluation pass.
const EVALUATION_SAMPLE: i64 = 1_000;

/// Scoring and lifecycle of the anomaly model.
#[async_trait]
pub trait Detector: Send + Sync {
    /// Score one metric event. Never fails: invalid input comes back as a
    /// rejected detection.
    async fn detect(&self, metric: &MetricEvent) -> Detection;

    /// Refit the model on recent history and persist the new artifact.
    /// A no-op when there is no training data.
    async fn retrain(&self) -> DaemonResult<()>;

    /// Score a recent sample and log aggregate statistics.
    async fn evaluate(&self) -> DaemonResult<()>;
}

/// Isolation-forest detector backed by an on-disk artifact.
pub struct ForestDetector {
    store: Arc<dyn AnalysisStore>,
    artifact_path: PathBuf,
    model: RwLock<Arc<ModelArtifact>>,
}

impl ForestDetector {
    /// Load the artifact from disk, or bootstrap-fit and persist one if
    /// none exists yet. A present-but-unreadable artifact aborts startup;
    /// silently retraining over it would hide an operational problem.
    pub async fn load_or_init(
        store: Arc<dyn AnalysisStore>,
        path: impl Into<PathBuf>,
    ) -> DaemonResult<Self> {
        let path = path.into();

        let artifact = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let artifact = ModelArtifact::decode(&bytes)
                    .map_err(|e| DaemonError::Model(e.to_string()))?;
                tracing::info!(path = %path.display(), "model artifact loaded");
                artifact
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "no model artifact found, bootstrapping");
                let artifact = tokio::task::spawn_blocking(ModelArtifact::bootstrap)
                    .await
                    .map_err(|e| DaemonError::Model(format!("bootstrap task failed: {e}")))?;
                Self::persist(&artifact, &path).await?;
                artifact
            }
            Err(e) => {
                return Err(DaemonError::Model(format!(
                    "cannot read model artifact {}: {e}",
                    path.display()
                )))
            }
        };

        Ok(Self {
            store,
            artifact_path: path,
            model: RwLock::new(Arc::new(artifact)),
        })
    }

    async fn persist(artifact: &ModelArtifact, path: &Path) -> DaemonResult<()> {
        let bytes = artifact
            .encode()
            .map_err(|e| DaemonError::Model(e.to_string()))?;
        let path = path.to_path_buf();

        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            // Write-then-rename keeps a reader (or a crash) from ever
            // observing a half-written artifact.
            let tmp = path.with_extension("tmp");
            std::fs::write(&tmp, &bytes)?;
            std::fs::rename(&tmp, &path)
        })
        .await
        .map_err(|e| DaemonError::Model(format!("persist task failed: {e}")))?
        .map_err(|e| DaemonError::Model(format!("failed to persist model artifact: {e}")))?;

        Ok(())
    }

    #[cfg(test)]
    pub async fn current_artifact(&self) -> Arc<ModelArtifact> {
        self.model.read().await.clone()
    }
}

#[async_trait]
impl Detector for ForestDetector {
    async fn detect(&self, metric: &MetricEvent) -> Detection {
        let value = match metric.numeric_value() {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(metric = %metric.name(), error = %e, "rejected metric value");
                return Detection::rejected(e.to_string());
            }
        };

        let model = self.model.read().await.clone();
        model.detect(value)
    }

    async fn retrain(&self) -> DaemonResult<()> {
        tracing::info!("starting model retraining");

        let values = self.store.fetch_training_values(TRAINING_FETCH_LIMIT).await?;
        if values.is_empty() {
            tracing::warn!("no training data available, skipping retrain");
            return Ok(());
        }

        let sample_count = values.len();
        let artifact = tokio::task::spawn_blocking(move || ModelArtifact::fit(&values))
            .await
            .map_err(|e| DaemonError::Model(format!("training task failed: {e}")))?;

        Self::persist(&artifact, &self.artifact_path).await?;
        *self.model.write().await = Arc::new(artifact);

        tracing::info!(samples = sample_count, "model retrained and persisted");
        Ok(())
    }

    async fn evaluate(&self) -> DaemonResult<()> {
        let values = self.store.fetch_training_values(EVALUATION_SAMPLE).await?;
        if values.is_empty() {
            tracing::info!("no recent metric data to evaluate against");
            return Ok(());
        }

        let model = self.model.read().await.clone();
        let mut anomalies = 0usize;
        let mut score_sum = 0.0;
        let mut scored = 0usize;
        for value in &values {
            if let Detection::Scored {
                is_anomaly,
                anomaly_score,
                ..
            } = model.detect(*value)
            {
                scored += 1;
                score_sum += anomaly_score;
                if is_anomaly {
                    anomalies += 1;
                }
            }
        }

        let anomaly_rate = anomalies as f64 / scored.max(1) as f64;
        tracing::info!(
            sample = scored,
            anomaly_rate,
            mean_score = score_sum / scored.max(1) as f64,
            "model evaluation completed"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStore;
    use serde_json::json;
    use std::collections::HashMap;

    fn metric(value: serde_json::Value) -> MetricEvent {
        MetricEvent {
            metric_name: Some("cpu".into()),
            metric_value: Some(value),
            labels: HashMap::new(),
        }
    }

    fn artifact_path(dir: &tempfile::TempDir) -> PathBuf {
        dir.path().join("models").join("isolation_forest.bin")
    }

    #[tokio::test]
    async fn bootstraps_and_persists_on_first_start() {
        let dir = tempfile::tempdir().unwrap();
        let path = artifact_path(&dir);
        let store = Arc::new(InMemoryStore::new());

        let detector = ForestDetector::load_or_init(store.clone(), &path)
            .await
            .unwrap();
        assert!(path.exists(), "bootstrap artifact not persisted");

        // A restart loads the same artifact and scores identically.
        let reloaded = ForestDetector::load_or_init(store, &path).await.unwrap();
        assert_eq!(
            detector.detect(&metric(json!(500.0))).await,
            reloaded.detect(&metric(json!(500.0))).await
        );
    }

    #[tokio::test]
    async fn corrupt_artifact_aborts_startup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.bin");
        tokio::fs::write(&path, b"definitely not a model").await.unwrap();

        let result =
            ForestDetector::load_or_init(Arc::new(InMemoryStore::new()), &path).await;
        assert!(matches!(result, Err(DaemonError::Model(_))));
    }

    #[tokio::test]
    async fn detect_rejects_bad_values_with_stable_errors() {
        let dir = tempfile::tempdir().unwrap();
        let detector = ForestDetector::load_or_init(
            Arc::new(InMemoryStore::new()),
            artifact_path(&dir),
        )
        .await
        .unwrap();

        for (value, expected) in [
            (json!("text"), "Invalid value"),
            (json!("NaN"), "Non-finite value"),
            (json!("inf"), "Non-finite value"),
        ] {
            match detector.detect(&metric(value)).await {
                Detection::Rejected { error, is_anomaly } => {
                    assert_eq!(error, expected);
                    assert!(!is_anomaly);
                }
                other => panic!("expected rejection, got {other:?}"),
            }
        }

        match detector.detect(&MetricEvent::default()).await {
            Detection::Rejected { error, .. } => assert_eq!(error, "Missing metric_value"),
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn retrain_refits_on_recent_history() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryStore::new());
        let detector = ForestDetector::load_or_init(store.clone(), artifact_path(&dir))
            .await
            .unwrap();

        // Bootstrap distribution is centered on 50, so 500 is anomalous.
        assert!(detector.detect(&metric(json!(500.0))).await.is_anomaly());

        // After retraining on history centered around 500, it no longer is.
        let history: Vec<Option<f64>> =
            (0..1000).map(|i| Some(480.0 + (i % 40) as f64)).collect();
        store.push_metric_values(&history);
        detector.retrain().await.unwrap();

        assert!(!detector.detect(&metric(json!(500.0))).await.is_anomaly());
        assert!(detector.detect(&metric(json!(50.0))).await.is_anomaly());
    }

    #[tokio::test]
    async fn retrain_without_data_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryStore::new());
        let detector = ForestDetector::load_or_init(store, artifact_path(&dir))
            .await
            .unwrap();

        let before = detector.current_artifact().await;
        detector.retrain().await.unwrap();
        let after = detector.current_artifact().await;

        assert!(Arc::ptr_eq(&before, &after), "artifact replaced without data");
    }

    #[tokio::test]
    async fn evaluate_tolerates_empty_history() {
        let dir = tempfile::tempdir().unwrap();
        let detector = ForestDetector::load_or_init(
            Arc::new(InMemoryStore::new()),
            artifact_path(&dir),
        )
        .await
        .unwrap();
        detector.evaluate().await.unwrap();
    }
}
