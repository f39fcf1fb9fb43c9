//! triaged - the triage worker binary.

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use triage_daemon::config::Settings;
use triage_daemon::error::{DaemonError, DaemonResult};
use triage_daemon::server::Daemon;

/// Triage worker CLI
#[derive(Parser)]
#[command(name = "triaged")]
#[command(about = "Triage worker - anomaly detection and LLM alert analysis", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "TRIAGE_CONFIG")]
    config: Option<String>,

    /// Log level
    #[arg(long, env = "TRIAGE_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Enable JSON logging
    #[arg(long, env = "TRIAGE_LOG_JSON")]
    json: bool,
}

#[tokio::main]
async fn main() -> DaemonResult<()> {
    let cli = Cli::parse();

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| cli.log_level.clone().into());

    if cli.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    let settings = Settings::load(cli.config.as_deref())
        .map_err(|e| DaemonError::Config(e.to_string()))?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        stream = %settings.redis_stream,
        listen = %settings.listen_addr,
        "starting triage daemon"
    );

    let daemon = Daemon::new(settings).await?;
    daemon.run().await
}
