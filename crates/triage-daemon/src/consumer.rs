//! The stream consumer loop.
//!
//! Entries are read in small batches and dispatched by kind: metrics go
//! through the anomaly detector, alerts through deduplication and (when
//! warranted) the analysis backend. Every entry is acked once processing
//! reaches a terminal outcome - success, a persisted failure row, or a
//! payload that cannot be parsed. Redelivery is never used as a retry
//! mechanism; retries are bounded and internal, and durability lives in
//! the results table, not the stream.

use crate::config::Settings;
use crate::dedup::Deduplicator;
use crate::detector::Detector;
use crate::llm::{AlertAnalyzer, AnalysisOutcome};
use crate::metrics;
use crate::storage::AnalysisStore;
use crate::stream::{EventStream, StreamEntry};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use triage_core::{AlertEvent, AlertPayload, AnalysisReason, Classification, Detection, MetricEvent};

/// Confidence recorded on completed analyses.
const LLM_CONFIDENCE: f64 = 0.85;

/// Loop tunables, split from `Settings` so tests can shrink every delay.
#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    /// Entries per stream read.
    pub batch_size: usize,
    /// Stream read block duration.
    pub block: Duration,
    /// Sleep between polls when the stream is empty.
    pub poll_sleep: Duration,
    /// Run the stale-pending sweep every N iterations.
    pub sweep_every: u64,
    /// Pending entries idle longer than this get reclaimed.
    pub pending_idle: Duration,
    /// Total analysis attempts per alert.
    pub retry_attempts: u32,
    /// Delay between analysis attempts.
    pub retry_backoff: Duration,
    /// Backoff after a stream-level failure.
    pub failure_backoff: Duration,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            batch_size: 10,
            block: Duration::from_secs(1),
            poll_sleep: Duration::from_millis(100),
            sweep_every: 50,
            pending_idle: Duration::from_secs(300),
            retry_attempts: 2,
            retry_backoff: Duration::from_secs(5),
            failure_backoff: Duration::from_secs(5),
        }
    }
}

impl From<&Settings> for ConsumerOptions {
    fn from(settings: &Settings) -> Self {
        Self {
            batch_size: settings.batch_size,
            block: Duration::from_millis(settings.block_ms),
            sweep_every: settings.sweep_every,
            pending_idle: Duration::from_millis(settings.pending_idle_ms),
            ..Self::default()
        }
    }
}

/// The consumer: composes the stream client, the detector, the
/// deduplicator, the analyzer and the store.
pub struct Consumer<S: EventStream> {
    stream: S,
    store: Arc<dyn AnalysisStore>,
    detector: Arc<dyn Detector>,
    analyzer: Arc<dyn AlertAnalyzer>,
    dedup: Deduplicator,
    options: ConsumerOptions,
    stop: watch::Receiver<bool>,
}

impl<S: EventStream> Consumer<S> {
    pub fn new(
        stream: S,
        store: Arc<dyn AnalysisStore>,
        detector: Arc<dyn Detector>,
        analyzer: Arc<dyn AlertAnalyzer>,
        options: ConsumerOptions,
        stop: watch::Receiver<bool>,
    ) -> Self {
        let dedup = Deduplicator::new(store.clone());
        Self {
            stream,
            store,
            detector,
            analyzer,
            dedup,
            options,
            stop,
        }
    }

    /// Run until the stop signal flips. The in-flight batch finishes and
    /// acks before the loop exits.
    pub async fn run(mut self) {
        tracing::info!("consumer started");
        let mut iteration: u64 = 0;

        while !*self.stop.borrow() {
            iteration += 1;

            if self.options.sweep_every > 0 && iteration % self.options.sweep_every == 0 {
                let reclaimed = self.stream.reclaim_stale(self.options.pending_idle).await;
                if reclaimed > 0 {
                    metrics::PENDING_RECLAIMED.inc_by(reclaimed);
                }
            }

            let batch = match self
                .stream
                .read(self.options.batch_size, self.options.block)
                .await
            {
                Ok(batch) => batch,
                Err(e) => {
                    tracing::error!(error = %e, "consumer loop error, backing off");
                    metrics::PROCESSING_ERRORS.with_label_values(&["stream"]).inc();
                    let backoff = self.options.failure_backoff;
                    self.idle(backoff).await;
                    continue;
                }
            };

            if batch.is_empty() {
                let sleep = self.options.poll_sleep;
                self.idle(sleep).await;
                continue;
            }

            for entry in batch {
                self.dispatch(&entry).await;
                self.stream.ack(&entry.id).await;
            }
        }

        tracing::info!("consumer stopped");
    }

    /// Sleep, waking early on the stop signal.
    async fn idle(&mut self, duration: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = self.stop.changed() => {}
        }
    }

    async fn dispatch(&self, entry: &StreamEntry) {
        let kind = entry.kind.as_deref().unwrap_or("");
        let data = entry.data.as_deref().unwrap_or("");

        match kind {
            "metric" => {
                metrics::EVENTS_CONSUMED.with_label_values(&["metric"]).inc();
                match serde_json::from_str::<MetricEvent>(data) {
                    Ok(metric) => self.process_metric(metric).await,
                    Err(e) => self.discard_malformed(entry, &e),
                }
            }
            "alert" => {
                metrics::EVENTS_CONSUMED.with_label_values(&["alert"]).inc();
                match serde_json::from_str::<AlertEvent>(data) {
                    Ok(alert) => self.process_alert(alert).await,
                    Err(e) => self.discard_malformed(entry, &e),
                }
            }
            other => {
                metrics::EVENTS_CONSUMED.with_label_values(&["unknown"]).inc();
                tracing::warn!(entry_id = %entry.id, kind = %other, "unknown entry kind");
                metrics::EVENTS_PROCESSED.with_label_values(&["unknown"]).inc();
            }
        }
    }

    fn discard_malformed(&self, entry: &StreamEntry, error: &serde_json::Error) {
        tracing::error!(entry_id = %entry.id, error = %error, "malformed entry payload");
        metrics::EVENTS_PROCESSED.with_label_values(&["malformed"]).inc();
    }

    async fn process_metric(&self, metric: MetricEvent) {
        match self.detector.detect(&metric).await {
            Detection::Scored {
                is_anomaly: true,
                anomaly_score,
                model_version,
            } => {
                tracing::warn!(
                    metric = %metric.name(),
                    score = anomaly_score,
                    "anomaly detected"
                );
                let data = json!({
                    "metric_name": metric.metric_name,
                    "metric_value": metric.metric_value,
                    "anomaly_score": anomaly_score,
                });
                let confidence = anomaly_score.abs().clamp(0.0, 1.0);
                match self
                    .store
                    .insert_anomaly_result(&model_version, &data, confidence)
                    .await
                {
                    Ok(_) => {
                        metrics::EVENTS_PROCESSED.with_label_values(&["anomaly"]).inc();
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "failed to persist anomaly result");
                        metrics::PROCESSING_ERRORS.with_label_values(&["storage"]).inc();
                    }
                }
            }
            Detection::Scored { .. } => {
                metrics::EVENTS_PROCESSED.with_label_values(&["normal"]).inc();
            }
            Detection::Rejected { error, .. } => {
                tracing::debug!(metric = %metric.name(), error = %error, "metric not scored");
                metrics::EVENTS_PROCESSED.with_label_values(&["rejected"]).inc();
            }
        }
    }

    async fn process_alert(&self, alert: AlertEvent) {
        let Some(alert_id) = alert.alert_id else {
            tracing::warn!("alert event without alert_id");
            metrics::EVENTS_PROCESSED.with_label_values(&["malformed"]).inc();
            return;
        };

        let input = alert.payload.classification_input();
        let (decision, prior) = match self.dedup.classify(&input).await {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(alert_id = %alert_id, error = %e, "classification lookup failed");
                metrics::PROCESSING_ERRORS.with_label_values(&["storage"]).inc();
                return;
            }
        };

        match decision {
            Classification::DuplicateSameSeverity => {
                tracing::info!(alert_id = %alert_id, "duplicate alert, skipping analysis");
                if let Some(prior) = prior {
                    match self
                        .dedup
                        .mark_duplicate(&alert_id, &prior, decision.reason_str())
                        .await
                    {
                        Ok(()) => {
                            metrics::EVENTS_PROCESSED.with_label_values(&["duplicate"]).inc();
                        }
                        Err(e) => {
                            tracing::error!(
                                alert_id = %alert_id,
                                error = %e,
                                "failed to mark duplicate"
                            );
                            metrics::PROCESSING_ERRORS.with_label_values(&["storage"]).inc();
                        }
                    }
                }
            }
            Classification::Analyze(reason) => {
                self.analyze_alert(&alert_id, &alert.payload, reason).await;
            }
        }
    }

    async fn analyze_alert(&self, alert_id: &str, payload: &AlertPayload, reason: AnalysisReason) {
        let attempts = self.options.retry_attempts.max(1);

        for attempt in 1..=attempts {
            tracing::info!(
                alert_id = %alert_id,
                reason = %reason,
                attempt,
                attempts,
                "analysis attempt"
            );

            match self.analyzer.analyze(payload, reason).await {
                AnalysisOutcome::Completed(analysis) => {
                    match self
                        .store
                        .insert_llm_result(
                            alert_id,
                            self.analyzer.model_name(),
                            &analysis,
                            LLM_CONFIDENCE,
                            reason,
                        )
                        .await
                    {
                        Ok(_) => {
                            tracing::info!(alert_id = %alert_id, reason = %reason, "analysis stored");
                            metrics::EVENTS_PROCESSED.with_label_values(&["analyzed"]).inc();
                        }
                        Err(e) => {
                            // The entry still acks: the stream is not the
                            // durable record of analyses.
                            tracing::error!(
                                alert_id = %alert_id,
                                error = %e,
                                "failed to persist analysis result"
                            );
                            metrics::PROCESSING_ERRORS.with_label_values(&["storage"]).inc();
                        }
                    }
                    return;
                }
                AnalysisOutcome::Failed { error, .. } => {
                    tracing::warn!(
                        alert_id = %alert_id,
                        attempt,
                        error = %error,
                        "analysis attempt failed"
                    );

                    if attempt < attempts {
                        tokio::time::sleep(self.options.retry_backoff).await;
                        continue;
                    }

                    let message = format!("Analysis failed after {attempts} attempts: {error}");
                    match self
                        .store
                        .insert_llm_failure(alert_id, self.analyzer.model_name(), &message, reason)
                        .await
                    {
                        Ok(_) => {
                            metrics::EVENTS_PROCESSED
                                .with_label_values(&["analysis_failed"])
                                .inc();
                        }
                        Err(e) => {
                            tracing::error!(
                                alert_id = %alert_id,
                                error = %e,
                                "failed to persist analysis failure"
                            );
                            metrics::PROCESSING_ERRORS.with_label_values(&["storage"]).inc();
                        }
                    }
                }
            }
        }
    }
}
