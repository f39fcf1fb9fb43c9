//! Root-cause analysis client for the generate endpoint.
//!
//! Calls are gated by a small counting semaphore so a burst of alerts
//! cannot pile concurrent long-running generations onto the backend; the
//! queue-depth gauge counts callers holding or waiting on a permit. The
//! client never returns an `Err`: every failure mode is a value the
//! consumer turns into a retry or a persisted failure row.

use crate::error::{DaemonError, DaemonResult};
use crate::metrics;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use triage_core::{build_prompt, AlertPayload, AnalysisReason};

/// Model requested from the generate endpoint.
const DEFAULT_MODEL: &str = "llama2";

/// Outcome of one analysis call.
#[derive(Debug, Clone, PartialEq)]
pub enum AnalysisOutcome {
    /// The backend answered with parseable JSON.
    Completed(Value),
    /// Transport error, bad status, or an unparseable answer. `raw` carries
    /// the verbatim text when the backend answered but not with JSON.
    Failed { error: String, raw: Option<String> },
}

impl AnalysisOutcome {
    fn failed(error: impl Into<String>) -> Self {
        AnalysisOutcome::Failed {
            error: error.into(),
            raw: None,
        }
    }
}

/// The analysis operation the consumer depends on.
#[async_trait]
pub trait AlertAnalyzer: Send + Sync {
    /// Model name recorded on persisted result rows.
    fn model_name(&self) -> &str;

    async fn analyze(&self, payload: &AlertPayload, reason: AnalysisReason) -> AnalysisOutcome;
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: String,
}

/// Client for an Ollama-compatible generate endpoint.
pub struct OllamaAnalyzer {
    http: reqwest::Client,
    base_url: String,
    model: String,
    permits: Arc<Semaphore>,
}

impl OllamaAnalyzer {
    pub fn new(
        base_url: String,
        max_concurrent: usize,
        timeout: Duration,
    ) -> DaemonResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DaemonError::Llm(format!("failed to build http client: {e}")))?;

        Ok(Self {
            http,
            base_url,
            model: DEFAULT_MODEL.to_string(),
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
        })
    }

    async fn call_generate(&self, prompt: String) -> AnalysisOutcome {
        let body = json!({
            "model": self.model,
            "prompt": prompt,
            "stream": false,
        });

        let response = match self
            .http
            .post(format!("{}/api/generate", self.base_url))
            .json(&body)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => return AnalysisOutcome::failed(e.to_string()),
        };

        let status = response.status();
        if !status.is_success() {
            return AnalysisOutcome::failed(format!("generate endpoint returned {status}"));
        }

        let body: GenerateResponse = match response.json().await {
            Ok(body) => body,
            Err(e) => return AnalysisOutcome::failed(format!("invalid response body: {e}")),
        };

        // The response field is itself JSON-encoded text. A model that
        // ignored the format instructions still produced something worth
        // keeping, so the raw text rides along with the error.
        match serde_json::from_str::<Value>(&body.response) {
            Ok(analysis) => AnalysisOutcome::Completed(analysis),
            Err(_) => AnalysisOutcome::Failed {
                error: "Failed to parse JSON".to_string(),
                raw: Some(body.response),
            },
        }
    }
}

#[async_trait]
impl AlertAnalyzer for OllamaAnalyzer {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn analyze(&self, payload: &AlertPayload, reason: AnalysisReason) -> AnalysisOutcome {
        let _depth = DepthGuard::new();

        let permit = match self.permits.acquire().await {
            Ok(permit) => permit,
            Err(_) => return AnalysisOutcome::failed("analysis gate closed"),
        };

        let prompt = build_prompt(payload, reason);
        let outcome = self.call_generate(prompt).await;
        drop(permit);

        if let AnalysisOutcome::Failed { error, .. } = &outcome {
            tracing::error!(reason = %reason, error = %error, "analysis call failed");
        }
        outcome
    }
}

/// Holds the queue-depth gauge up for its lifetime, so every exit path
/// decrements exactly once.
struct DepthGuard;

impl DepthGuard {
    fn new() -> Self {
        metrics::LLM_QUEUE_DEPTH.inc();
        DepthGuard
    }
}

impl Drop for DepthGuard {
    fn drop(&mut self) {
        metrics::LLM_QUEUE_DEPTH.dec();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Instant;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn payload() -> AlertPayload {
        let mut labels = HashMap::new();
        labels.insert("alertname".into(), "HighCPU".into());
        labels.insert("instance".into(), "srv-1".into());
        labels.insert("severity".into(), "critical".into());
        let mut annotations = HashMap::new();
        annotations.insert("description".into(), "CPU 95%".into());
        AlertPayload {
            labels,
            annotations,
        }
    }

    fn analyzer(base_url: String) -> OllamaAnalyzer {
        OllamaAnalyzer::new(base_url, 2, Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn parses_nested_json_response() {
        let server = MockServer::start().await;
        let inner = json!({
            "root_cause": { "technical_reason": "CPU 95%" },
            "immediate_actions": []
        });
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .and(body_partial_json(json!({ "model": "llama2", "stream": false })))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "response": inner.to_string() })),
            )
            .expect(1)
            .mount(&server)
            .await;

        let outcome = analyzer(server.uri())
            .analyze(&payload(), AnalysisReason::FirstOccurrence)
            .await;

        assert_eq!(outcome, AnalysisOutcome::Completed(inner));
    }

    #[tokio::test]
    async fn unparseable_inner_json_is_a_failure_with_raw_text() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "response": "I think the CPU is busy" })),
            )
            .mount(&server)
            .await;

        let outcome = analyzer(server.uri())
            .analyze(&payload(), AnalysisReason::Escalation)
            .await;

        match outcome {
            AnalysisOutcome::Failed { error, raw } => {
                assert_eq!(error, "Failed to parse JSON");
                assert_eq!(raw.as_deref(), Some("I think the CPU is busy"));
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn http_error_status_is_a_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let outcome = analyzer(server.uri())
            .analyze(&payload(), AnalysisReason::FirstOccurrence)
            .await;

        match outcome {
            AnalysisOutcome::Failed { error, raw } => {
                assert!(error.contains("500"), "unexpected error: {error}");
                assert!(raw.is_none());
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn transport_error_is_a_failure_not_a_panic() {
        // Nothing listens here.
        let outcome = analyzer("http://127.0.0.1:1".to_string())
            .analyze(&payload(), AnalysisReason::Recovery)
            .await;
        assert!(matches!(outcome, AnalysisOutcome::Failed { .. }));
    }

    #[tokio::test]
    async fn concurrency_is_capped_by_the_semaphore() {
        let server = MockServer::start().await;
        let delay = Duration::from_millis(300);
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "response": "{}" }))
                    .set_delay(delay),
            )
            .expect(3)
            .mount(&server)
            .await;

        let analyzer = Arc::new(analyzer(server.uri()));
        let started = Instant::now();
        let mut handles = Vec::new();
        for _ in 0..3 {
            let analyzer = analyzer.clone();
            handles.push(tokio::spawn(async move {
                analyzer
                    .analyze(&payload(), AnalysisReason::FirstOccurrence)
                    .await
            }));
        }
        for handle in handles {
            assert!(matches!(
                handle.await.unwrap(),
                AnalysisOutcome::Completed(_)
            ));
        }

        // With two permits the third call cannot start until one of the
        // first two finishes, so three calls take at least two delays.
        assert!(
            started.elapsed() >= delay * 2 - Duration::from_millis(50),
            "third call was not queued (took {:?})",
            started.elapsed()
        );

        // All permits returned once the calls finished.
        assert_eq!(analyzer.permits.available_permits(), 2);
    }
}
