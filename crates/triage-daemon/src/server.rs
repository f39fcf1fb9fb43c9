//! Daemon assembly and lifecycle.
//!
//! `Daemon::new` builds every component in dependency order - pool (with
//! open retry), detector (artifact load or bootstrap), analyzer - and
//! `run` connects the stream, spawns the consumer, the maintenance
//! scheduler and the health listener, then waits for a shutdown signal.
//! There is no process-global state: everything the components share is
//! owned here and handed out as `Arc`s.

use crate::api::{self, ApiState};
use crate::config::Settings;
use crate::consumer::{Consumer, ConsumerOptions};
use crate::detector::{Detector, ForestDetector};
use crate::error::DaemonResult;
use crate::llm::{AlertAnalyzer, OllamaAnalyzer};
use crate::scheduler::MaintenanceScheduler;
use crate::storage::{AnalysisStore, PgStore};
use crate::stream::RedisStream;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

pub struct Daemon {
    settings: Settings,
    store: Arc<PgStore>,
    detector: Arc<ForestDetector>,
    analyzer: Arc<OllamaAnalyzer>,
}

impl Daemon {
    pub async fn new(settings: Settings) -> DaemonResult<Self> {
        let store = Arc::new(PgStore::connect(&settings).await?);

        let detector = Arc::new(
            ForestDetector::load_or_init(
                store.clone() as Arc<dyn AnalysisStore>,
                settings.model_path.clone(),
            )
            .await?,
        );

        let analyzer = Arc::new(OllamaAnalyzer::new(
            settings.ollama_url(),
            settings.llm_max_concurrent,
            Duration::from_secs(settings.llm_timeout_secs),
        )?);

        Ok(Self {
            settings,
            store,
            detector,
            analyzer,
        })
    }

    /// On-demand retrain, useful for operational tooling and tests.
    pub async fn retrain_now(&self) -> DaemonResult<()> {
        self.detector.retrain().await
    }

    pub async fn run(self) -> DaemonResult<()> {
        let (stop_tx, stop_rx) = watch::channel(false);

        let stream = RedisStream::connect(&self.settings).await?;
        let consumer = Consumer::new(
            stream,
            self.store.clone() as Arc<dyn AnalysisStore>,
            self.detector.clone() as Arc<dyn Detector>,
            self.analyzer.clone() as Arc<dyn AlertAnalyzer>,
            ConsumerOptions::from(&self.settings),
            stop_rx.clone(),
        );
        let consumer_handle = tokio::spawn(consumer.run());

        let mut scheduler =
            MaintenanceScheduler::start(self.detector.clone() as Arc<dyn Detector>).await?;

        let api_state = ApiState::new(self.store.clone() as Arc<dyn AnalysisStore>);
        let api_handle = tokio::spawn(api::serve(
            self.settings.listen_addr,
            api_state,
            stop_rx.clone(),
        ));

        tracing::info!(
            stream = %self.settings.redis_stream,
            group = %self.settings.redis_group,
            consumer = %self.settings.consumer_name,
            "triage daemon running"
        );

        shutdown_signal().await;
        tracing::info!("shutdown signal received, draining");
        let _ = stop_tx.send(true);

        if let Err(e) = consumer_handle.await {
            tracing::error!(error = %e, "consumer task panicked");
        }
        if let Err(e) = scheduler.shutdown().await {
            tracing::warn!(error = %e, "scheduler shutdown failed");
        }
        match api_handle.await {
            Ok(Err(e)) => tracing::warn!(error = %e, "health listener exited with error"),
            Err(e) => tracing::error!(error = %e, "health listener task panicked"),
            Ok(Ok(())) => {}
        }

        tracing::info!("triage daemon stopped");
        Ok(())
    }
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("received terminate signal, initiating graceful shutdown");
        }
    }
}
