//! PostgreSQL gateway over a sqlx pool.
//!
//! The pool opens with a bounded retry so the worker can start before the
//! database accepts connections. Statements run with a server-side
//! statement timeout so a stuck query surfaces as an error, never a hang.

use super::model::LastAnalysis;
use super::traits::AnalysisStore;
use super::{StorageError, StorageResult, ANALYSIS_TYPE_ANOMALY, ANALYSIS_TYPE_DUPLICATE, ANALYSIS_TYPE_LLM};
use crate::config::Settings;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use sqlx::Row;
use std::str::FromStr;
use std::time::Duration;
use triage_core::{AnalysisReason, Severity};

const OPEN_ATTEMPTS: u32 = 5;
const OPEN_BACKOFF: Duration = Duration::from_secs(5);

/// Postgres-backed gateway.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Open the pool, retrying a fixed number of times with a fixed
    /// backoff. Aborts startup once the attempts are exhausted.
    pub async fn connect(settings: &Settings) -> StorageResult<Self> {
        let timeout_ms = settings.db_command_timeout_secs * 1000;
        let options = PgConnectOptions::from_str(&settings.database_url())
            .map_err(|e| StorageError::Backend(format!("invalid database url: {e}")))?
            .options([("statement_timeout", timeout_ms.to_string().as_str())]);

        let mut last_err = None;
        for attempt in 1..=OPEN_ATTEMPTS {
            match PgPoolOptions::new()
                .min_connections(settings.db_pool_min)
                .max_connections(settings.db_pool_max)
                .acquire_timeout(Duration::from_secs(settings.db_command_timeout_secs))
                .connect_with(options.clone())
                .await
            {
                Ok(pool) => {
                    tracing::info!("database connection pool created");
                    return Ok(Self { pool });
                }
                Err(e) => {
                    tracing::warn!(
                        attempt,
                        max_attempts = OPEN_ATTEMPTS,
                        error = %e,
                        "database connection failed, retrying"
                    );
                    last_err = Some(e);
                    if attempt < OPEN_ATTEMPTS {
                        tokio::time::sleep(OPEN_BACKOFF).await;
                    }
                }
            }
        }

        Err(StorageError::Backend(format!(
            "failed to open database pool after {OPEN_ATTEMPTS} attempts: {}",
            last_err.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl AnalysisStore for PgStore {
    async fn insert_anomaly_result(
        &self,
        model_version: &str,
        analysis_data: &Value,
        confidence: f64,
    ) -> StorageResult<i64> {
        let row = sqlx::query(
            r#"
            INSERT INTO ai_analysis_results
                (alert_id, analysis_type, model_name, analysis_data, confidence_score)
            VALUES (NULL, $1, $2, $3, $4)
            RETURNING id
            "#,
        )
        .bind(ANALYSIS_TYPE_ANOMALY)
        .bind(model_version)
        .bind(sqlx::types::Json(analysis_data))
        .bind(confidence)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.try_get("id")?)
    }

    async fn insert_llm_result(
        &self,
        alert_id: &str,
        model_name: &str,
        analysis: &Value,
        confidence: f64,
        reason: AnalysisReason,
    ) -> StorageResult<i64> {
        let metadata = json!({ "analysis_reason": reason.as_str() });
        let row = sqlx::query(
            r#"
            INSERT INTO ai_analysis_results
                (alert_id, analysis_type, model_name, analysis_data, confidence_score, metadata)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id
            "#,
        )
        .bind(alert_id)
        .bind(ANALYSIS_TYPE_LLM)
        .bind(model_name)
        .bind(sqlx::types::Json(analysis))
        .bind(confidence)
        .bind(sqlx::types::Json(&metadata))
        .fetch_one(&self.pool)
        .await?;

        Ok(row.try_get("id")?)
    }

    async fn insert_llm_failure(
        &self,
        alert_id: &str,
        model_name: &str,
        error: &str,
        reason: AnalysisReason,
    ) -> StorageResult<i64> {
        let analysis = json!({ "error": error });
        let metadata = json!({ "analysis_reason": reason.as_str(), "failure": true });
        let row = sqlx::query(
            r#"
            INSERT INTO ai_analysis_results
                (alert_id, analysis_type, model_name, analysis_data, confidence_score, metadata)
            VALUES ($1, $2, $3, $4, 0.0, $5)
            RETURNING id
            "#,
        )
        .bind(alert_id)
        .bind(ANALYSIS_TYPE_LLM)
        .bind(model_name)
        .bind(sqlx::types::Json(&analysis))
        .bind(sqlx::types::Json(&metadata))
        .fetch_one(&self.pool)
        .await?;

        Ok(row.try_get("id")?)
    }

    async fn mark_duplicate(
        &self,
        alert_id: &str,
        reference_alert_id: &str,
        reference_analysis_id: i64,
        reason: &str,
    ) -> StorageResult<()> {
        // Both writes in one transaction: a duplicate marker without its
        // reference row (or vice versa) must never be observable.
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            UPDATE alerts
            SET is_duplicate = TRUE,
                reference_alert_id = $1
            WHERE id = $2
            "#,
        )
        .bind(reference_alert_id)
        .bind(alert_id)
        .execute(&mut *tx)
        .await?;

        let analysis = json!({ "duplicate": true, "message": "Same alert already analyzed" });
        let metadata = json!({ "analysis_reason": reason });
        sqlx::query(
            r#"
            INSERT INTO ai_analysis_results
                (alert_id, analysis_type, reference_analysis_id, model_name,
                 analysis_data, confidence_score, metadata)
            VALUES ($1, $2, $3, 'deduplication', $4, 1.0, $5)
            "#,
        )
        .bind(alert_id)
        .bind(ANALYSIS_TYPE_DUPLICATE)
        .bind(reference_analysis_id)
        .bind(sqlx::types::Json(&analysis))
        .bind(sqlx::types::Json(&metadata))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn find_last_analysis(
        &self,
        alert_name: &str,
        instance: &str,
    ) -> StorageResult<Option<LastAnalysis>> {
        let row = sqlx::query(
            r#"
            SELECT
                a.id AS alert_id,
                a.severity,
                a.created_at,
                r.id AS analysis_id
            FROM alerts a
            INNER JOIN ai_analysis_results r
                ON a.id = r.alert_id
                AND r.analysis_type = $3
            WHERE a.alert_name = $1
              AND a.labels->>'instance' = $2
              AND a.is_duplicate = FALSE
            ORDER BY a.created_at DESC
            LIMIT 1
            "#,
        )
        .bind(alert_name)
        .bind(instance)
        .bind(ANALYSIS_TYPE_LLM)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let severity: String = row.try_get("severity")?;
        Ok(Some(LastAnalysis {
            alert_id: row.try_get("alert_id")?,
            severity: Severity::from_label(&severity),
            created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
            analysis_id: row.try_get("analysis_id")?,
        }))
    }

    async fn fetch_training_values(&self, limit: i64) -> StorageResult<Vec<f64>> {
        let rows = sqlx::query(
            r#"
            SELECT metric_value FROM metrics
            ORDER BY timestamp DESC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let values = rows
            .iter()
            .map(|row| {
                row.try_get::<Option<f64>, _>("metric_value")
                    .map(|v| v.unwrap_or(0.0))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(values)
    }

    async fn ping(&self) -> StorageResult<()> {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await?;
        Ok(())
    }
}
