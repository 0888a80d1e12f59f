use anyhow::{Context, Result};
use clap::Parser;
use scene_tts::api::FishSpeechClient;
use scene_tts::config::Config;
use scene_tts::store::Database;
use scene_tts::worker::Worker;
use scene_tts::{init_tracing, logi, logw};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::watch;

/// Polls the job queue and synthesizes scene narration.
#[derive(Parser, Debug)]
#[command(name = "tts-worker", version)]
struct Args {
    /// JSON config file; missing means defaults plus environment.
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    /// Poll interval in seconds when the queue is empty.
    #[arg(long)]
    interval: Option<u64>,

    /// Speech service request timeout in seconds.
    #[arg(long)]
    timeout: Option<u64>,
}

async fn wait_for_signal(shutdown: watch::Sender<bool>) -> Result<()> {
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

    tokio::select! {
        _ = sigint.recv() => logw("SIGINT received, finishing current job"),
        _ = sigterm.recv() => logw("SIGTERM received, finishing current job"),
    }
    let _ = shutdown.send(true);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let mut config = Config::load(&args.config).await?;
    if let Some(secs) = args.interval {
        config.poll_interval_secs = secs;
    }
    if let Some(secs) = args.timeout {
        config.request_timeout_secs = secs;
    }
    config.validate()?;

    logi(format!(
        "speech service {} (timeout {}s), database {}",
        config.fish_speech_url,
        config.request_timeout_secs,
        config.database_path.display()
    ));

    let db = Arc::new(Database::open(&config.database_path)?);
    let synth = Arc::new(FishSpeechClient::from_config(&config)?);
    let worker = Worker::new(db, synth, &config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let signals = tokio::spawn(wait_for_signal(shutdown_tx));

    worker.run(shutdown_rx).await?;
    signals.abort();
    Ok(())
}
