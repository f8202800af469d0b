use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use petcare_voice::assistant::open_backend;
use petcare_voice::voice::{
    AudioSource, CaptureConstraints, FrameSink, MicrophoneSource, TranscribingClassifier,
    calculate_rms,
};
use petcare_voice::{
    Assistant, CommandTranscriber, Config, ResponseCache, SystemClock, WakeWordMonitor,
};

/// Petvoice - Always-on voice core for the pet-care assistant
#[derive(Parser)]
#[command(name = "petvoice", version, about)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Config file to use instead of the standard location
    #[arg(short, long, env = "PETVOICE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Listen for the wake phrase until interrupted
    Listen,
    /// Inspect or maintain the response cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
    /// Test microphone input
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// Print cache statistics as JSON
    Stats,
    /// Remove every cached response
    Clear,
    /// Remove old, rarely used responses
    Cleanup,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,petcare_voice=info",
        1 => "info,petcare_voice=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    tracing::debug!(?config, "loaded configuration");

    match cli.command {
        Command::Listen => listen(config).await,
        Command::Cache { action } => cache_command(&config, &action),
        Command::TestMic { duration } => test_mic(&config, duration).await,
    }
}

async fn listen(config: Config) -> anyhow::Result<()> {
    let command = config
        .wake
        .stt_command
        .as_deref()
        .context("wake.stt_command (or PETVOICE_STT_COMMAND) is required to listen")?;
    let transcriber = CommandTranscriber::new(command)?;

    let monitor = WakeWordMonitor::new(
        config.wake.clone(),
        Arc::new(SystemClock),
        Box::new(MicrophoneSource::new()),
        Box::new(TranscribingClassifier::new(Box::new(transcriber))),
    );
    let backend = open_backend(&config)?;
    let assistant = Assistant::new(config, backend, monitor);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = shutdown_tx.send(true);
        }
    });

    assistant.run(shutdown_rx).await?;
    Ok(())
}

fn cache_command(config: &Config, action: &CacheAction) -> anyhow::Result<()> {
    let backend = open_backend(config)?.context("cache persistence is disabled")?;
    let cache = ResponseCache::open(config.cache.clone(), Arc::new(SystemClock), backend);

    match action {
        CacheAction::Stats => {
            println!("{}", serde_json::to_string_pretty(&cache.stats())?);
        }
        CacheAction::Clear => {
            let entries = cache.len();
            cache.clear();
            println!("Cleared {entries} cached responses");
        }
        CacheAction::Cleanup => {
            let removed = cache.cleanup();
            println!("Removed {removed} stale responses, {} remain", cache.len());
        }
    }

    cache.flush();
    Ok(())
}

async fn test_mic(config: &Config, duration: u64) -> anyhow::Result<()> {
    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone!\n");

    let buffer = Arc::new(Mutex::new(Vec::<f32>::new()));
    let sink_buffer = Arc::clone(&buffer);
    let sink = FrameSink::new(move |samples| {
        if let Ok(mut buffer) = sink_buffer.lock() {
            buffer.extend_from_slice(samples);
        }
        true
    });

    let mut source = MicrophoneSource::new();
    source.open(&CaptureConstraints::voice(config.wake.sample_rate), sink)?;

    println!("Sample rate: {} Hz", config.wake.sample_rate);
    println!("---");

    for i in 0..duration {
        tokio::time::sleep(Duration::from_secs(1)).await;

        // Clear buffer each second
        let samples = buffer
            .lock()
            .map(|mut b| std::mem::take(&mut *b))
            .unwrap_or_default();
        let energy = calculate_rms(&samples);
        let peak = samples.iter().map(|s| s.abs()).fold(0.0f32, f32::max);

        // Visual meter
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let meter_len = (energy * 100.0).min(50.0) as usize;
        let meter: String = "#".repeat(meter_len) + &" ".repeat(50 - meter_len);

        println!(
            "[{:2}s] RMS: {:.4} | Peak: {:.4} | [{}]",
            i + 1,
            energy,
            peak,
            meter
        );
    }

    source.close();

    println!("\n---");
    println!("If you saw movement in the meter, your mic is working!");
    println!("If RMS stayed near 0, check:");
    println!("  1. Is your mic plugged in?");
    println!("  2. Run: arecord -l (to list devices)");

    Ok(())
}
