//! Periodic model maintenance.
//!
//! Two cron jobs - a nightly retrain and a six-hourly evaluation - plus an
//! on-demand retrain that enqueues a one-shot job, replacing any manual
//! retrain still queued. The jobs share the cooperative scheduler with the
//! consumer; the CPU-heavy part of retraining runs on the blocking pool
//! inside the detector, so consumption never stalls behind a fit.

use crate::detector::Detector;
use crate::error::{DaemonError, DaemonResult};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler, JobSchedulerError};
use uuid::Uuid;

/// Nightly retrain at 02:00.
const RETRAIN_SCHEDULE: &str = "0 0 2 * * *";

/// Evaluation every six hours.
const EVALUATE_SCHEDULE: &str = "0 0 */6 * * *";

pub struct MaintenanceScheduler {
    scheduler: JobScheduler,
    detector: Arc<dyn Detector>,
    manual_job: Mutex<Option<Uuid>>,
}

impl MaintenanceScheduler {
    /// Register the periodic jobs and start the scheduler.
    pub async fn start(detector: Arc<dyn Detector>) -> DaemonResult<Self> {
        let scheduler = JobScheduler::new().await.map_err(sched_err)?;

        let retrain_detector = detector.clone();
        let retrain_job = Job::new_async(RETRAIN_SCHEDULE, move |_id, _scheduler| {
            let detector = retrain_detector.clone();
            Box::pin(async move {
                tracing::info!("scheduled model retraining starting");
                match detector.retrain().await {
                    Ok(()) => tracing::info!("scheduled model retraining completed"),
                    Err(e) => tracing::error!(error = %e, "scheduled model retraining failed"),
                }
            })
        })
        .map_err(sched_err)?;
        scheduler.add(retrain_job).await.map_err(sched_err)?;

        let evaluate_detector = detector.clone();
        let evaluate_job = Job::new_async(EVALUATE_SCHEDULE, move |_id, _scheduler| {
            let detector = evaluate_detector.clone();
            Box::pin(async move {
                if let Err(e) = detector.evaluate().await {
                    tracing::error!(error = %e, "scheduled model evaluation failed");
                }
            })
        })
        .map_err(sched_err)?;
        scheduler.add(evaluate_job).await.map_err(sched_err)?;

        scheduler.start().await.map_err(sched_err)?;
        tracing::info!("maintenance scheduler started");

        Ok(Self {
            scheduler,
            detector,
            manual_job: Mutex::new(None),
        })
    }

    /// Enqueue an immediate one-shot retrain. A manual retrain already
    /// queued is replaced rather than stacked.
    pub async fn trigger_retrain(&self) -> DaemonResult<()> {
        let mut slot = self.manual_job.lock().await;

        if let Some(previous) = slot.take() {
            // Removal fails harmlessly when the job already ran.
            let _ = self.scheduler.remove(&previous).await;
        }

        let detector = self.detector.clone();
        let job = Job::new_one_shot_async(Duration::from_secs(0), move |_id, _scheduler| {
            let detector = detector.clone();
            Box::pin(async move {
                tracing::info!("manual model retraining triggered");
                if let Err(e) = detector.retrain().await {
                    tracing::error!(error = %e, "manual model retraining failed");
                }
            })
        })
        .map_err(sched_err)?;

        let id = self.scheduler.add(job).await.map_err(sched_err)?;
        *slot = Some(id);
        Ok(())
    }

    pub async fn shutdown(&mut self) -> DaemonResult<()> {
        self.scheduler.shutdown().await.map_err(sched_err)
    }
}

fn sched_err(err: JobSchedulerError) -> DaemonError {
    DaemonError::Scheduler(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DaemonResult;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use triage_core::{Detection, MetricEvent};

    struct CountingDetector {
        retrains: AtomicUsize,
    }

    #[async_trait]
    impl Detector for CountingDetector {
        async fn detect(&self, _metric: &MetricEvent) -> Detection {
            Detection::rejected("unused")
        }

        async fn retrain(&self) -> DaemonResult<()> {
            self.retrains.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn evaluate(&self) -> DaemonResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn manual_trigger_runs_a_retrain() {
        let detector = Arc::new(CountingDetector {
            retrains: AtomicUsize::new(0),
        });
        let mut scheduler = MaintenanceScheduler::start(detector.clone()).await.unwrap();

        scheduler.trigger_retrain().await.unwrap();

        // One-shot jobs fire on the scheduler's next tick; poll briefly.
        let mut fired = false;
        for _ in 0..30 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            if detector.retrains.load(Ordering::SeqCst) > 0 {
                fired = true;
                break;
            }
        }
        assert!(fired, "manual retrain job never ran");

        scheduler.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn repeated_triggers_replace_the_pending_job() {
        let detector = Arc::new(CountingDetector {
            retrains: AtomicUsize::new(0),
        });
        let mut scheduler = MaintenanceScheduler::start(detector.clone()).await.unwrap();

        scheduler.trigger_retrain().await.unwrap();
        scheduler.trigger_retrain().await.unwrap();

        scheduler.shutdown().await.unwrap();
    }
}
