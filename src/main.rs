//! Train Detector CLI Application

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

use train_detector::audio::NextBlock;
use train_detector::{AudioCapture, Block, Config, OutputWriter, PersistenceWorker, Pipeline};

const OVERFLOW_REPORT_INTERVAL: Duration = Duration::from_secs(5);
const RECEIVE_TIMEOUT: Duration = Duration::from_secs(1);

/// Sustained-noise (train) detector
#[derive(Parser)]
#[command(name = "train-detector")]
#[command(about = "Detects passing trains from microphone noise levels", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Listen and log detected events
    Run(Overrides),

    /// List available audio input devices
    Devices,

    /// Validate the configuration and print the effective settings
    #[command(name = "config")]
    ShowConfig(Overrides),
}

/// Command-line overrides for configuration file values
#[derive(Args)]
struct Overrides {
    /// Audio input device (substring of the device name)
    #[arg(short, long)]
    device: Option<String>,

    /// Trigger threshold in dBFS
    #[arg(short, long, allow_hyphen_values = true)]
    threshold: Option<f64>,

    /// Hysteresis in dB (release = threshold - hysteresis)
    #[arg(long)]
    hysteresis: Option<f64>,

    /// Minimum sustained duration in seconds
    #[arg(long)]
    min_duration: Option<f64>,

    /// Stop hold in seconds
    #[arg(long)]
    stop_hold: Option<f64>,

    /// Smoothing window in seconds
    #[arg(long)]
    smooth: Option<f64>,

    /// Event log path
    #[arg(short, long)]
    events: Option<PathBuf>,

    /// Also log every block level
    #[arg(long)]
    write_levels: bool,

    /// Level log path (implies --write-levels)
    #[arg(long)]
    levels: Option<PathBuf>,

    /// Output format (csv, json)
    #[arg(short, long)]
    format: Option<String>,

    /// Do not echo events to stdout
    #[arg(long)]
    no_console: bool,
}

impl Overrides {
    fn apply(self, config: &mut Config) -> Result<()> {
        if let Some(device) = self.device {
            config.audio.device = Some(device);
        }
        if let Some(threshold) = self.threshold {
            config.detection.threshold_dbfs = threshold;
        }
        if let Some(hysteresis) = self.hysteresis {
            config.detection.hysteresis_db = hysteresis;
        }
        if let Some(min_duration) = self.min_duration {
            config.detection.min_duration_s = min_duration;
        }
        if let Some(stop_hold) = self.stop_hold {
            config.detection.stop_hold_s = stop_hold;
        }
        if let Some(smooth) = self.smooth {
            config.detection.smooth_sec = smooth;
        }
        if let Some(events) = self.events {
            config.output.events_path = events;
        }
        if let Some(levels) = self.levels {
            config.output.levels_path = levels;
            config.output.write_levels = true;
        }
        if self.write_levels {
            config.output.write_levels = true;
        }
        if let Some(format) = self.format {
            config.output.format = format.parse()?;
        }
        if self.no_console {
            config.output.enable_console = false;
        }
        Ok(())
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging - warnings by default, use -v for more
    let log_level = match cli.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(log_level.into()))
        .init();

    // Load configuration
    let mut config = if let Some(ref config_path) = cli.config {
        Config::from_file(config_path)
            .with_context(|| format!("Failed to load config from {}", config_path.display()))?
    } else {
        Config::default()
    };

    match cli.command {
        Commands::Run(overrides) => {
            overrides.apply(&mut config)?;
            run_detector(config)
        }
        Commands::Devices => list_devices(),
        Commands::ShowConfig(overrides) => {
            overrides.apply(&mut config)?;
            check_config(&config)
        }
    }
}

/// Statistics for a detection session
struct SessionStats {
    blocks: u64,
    events: u64,
    overflows: u64,
    queue_drops: u64,
    start_time: Instant,
}

impl SessionStats {
    fn new() -> Self {
        Self {
            blocks: 0,
            events: 0,
            overflows: 0,
            queue_drops: 0,
            start_time: Instant::now(),
        }
    }

    fn log_summary(&self) {
        let duration = self.start_time.elapsed();
        info!(
            "Session complete: {} blocks, {} events, {} capture overflows, {} rows not queued, duration: {:.1}s",
            self.blocks,
            self.events,
            self.overflows,
            self.queue_drops,
            duration.as_secs_f32()
        );
    }
}

/// Run one block through the pipeline and queue its records
fn handle_block(
    block: &Block,
    pipeline: &mut Pipeline,
    worker: &PersistenceWorker,
    write_levels: bool,
    stats: &mut SessionStats,
) {
    let output = pipeline.process_block(block);
    stats.blocks += 1;

    if let Some(event) = output.event {
        stats.events += 1;
        if !worker.submit_event(event) {
            stats.queue_drops += 1;
        }
    }
    if write_levels && !worker.submit_level(output.level) {
        stats.queue_drops += 1;
    }
}

/// Listen until Ctrl-C or the capture stream ends
fn run_detector(config: Config) -> Result<()> {
    config.validate().context("Invalid configuration")?;

    // Setup signal handler for graceful shutdown
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        info!("Received shutdown signal");
        r.store(false, Ordering::SeqCst);
    })?;

    let mut pipeline =
        Pipeline::new(&config.detection).context("Failed to create detection pipeline")?;

    let writer = OutputWriter::new(config.output.clone()).with_context(|| {
        format!(
            "Failed to open event log {}",
            config.output.events_path.display()
        )
    })?;
    let worker = PersistenceWorker::spawn(
        writer,
        config.output.queue_capacity,
        config.output.write_retries,
    )
    .context("Failed to start persistence worker")?;

    let mut capture =
        AudioCapture::new(config.audio.clone()).context("Failed to create audio capture")?;
    capture.init().context("Failed to initialize audio capture")?;
    capture.start().context("Failed to start audio capture")?;
    let capture_stats = capture.stats();
    info!("Capturing at {} Hz", capture.actual_sample_rate());

    let detection = &config.detection;
    info!(
        "Threshold {:.1} dBFS (release {:.1} dBFS), minimum {:.1}s, hold {:.1}s, smoothing {:.1}s",
        detection.trigger_threshold(),
        detection.release_threshold(),
        detection.min_duration_s,
        detection.stop_hold_s,
        detection.smooth_sec
    );
    info!(
        "Logging events to {}{}",
        config.output.events_path.display(),
        if config.output.write_levels {
            format!(", levels to {}", config.output.levels_path.display())
        } else {
            String::new()
        }
    );
    println!("Listening... Press Ctrl+C to stop");

    let write_levels = config.output.write_levels;
    let mut stats = SessionStats::new();
    let mut last_overflow_report = Instant::now();

    while running.load(Ordering::SeqCst) {
        match capture.next_block(RECEIVE_TIMEOUT) {
            NextBlock::Block(block) => {
                handle_block(&block, &mut pipeline, &worker, write_levels, &mut stats);
            }
            NextBlock::Timeout => {}
            NextBlock::Closed => {
                warn!("Audio stream ended, shutting down");
                break;
            }
        }

        if last_overflow_report.elapsed() >= OVERFLOW_REPORT_INTERVAL {
            let overflows = capture_stats.take_overflows();
            if overflows > 0 {
                warn!(
                    "Input overflows: {} blocks dropped (check buffer size and CPU load)",
                    overflows
                );
                stats.overflows += overflows;
            }
            last_overflow_report = Instant::now();
        }
    }

    capture.stop();

    // Blocks already captured still count toward the current event
    for block in capture.drain() {
        handle_block(&block, &mut pipeline, &worker, write_levels, &mut stats);
    }
    stats.overflows += capture_stats.take_overflows();

    if let Some(event) = pipeline.finish() {
        stats.events += 1;
        if !worker.submit_event(event) {
            stats.queue_drops += 1;
        }
    }

    let dropped = pipeline.detector().dropped_samples();
    if dropped > 0 {
        warn!("{} level samples dropped for out-of-order timestamps", dropped);
    }

    let worker_stats = worker.shutdown()?;
    if worker_stats.rows_failed > 0 {
        warn!("{} rows could not be written", worker_stats.rows_failed);
    }
    stats.log_summary();

    Ok(())
}

/// List available audio input devices
fn list_devices() -> Result<()> {
    let capture = AudioCapture::new(train_detector::AudioConfig::default())?;
    let devices = capture.list_devices()?;

    if devices.is_empty() {
        println!("No audio input devices found");
    } else {
        println!("Available audio input devices:");
        for (i, name) in devices.iter().enumerate() {
            println!("  {}. {}", i + 1, name);
        }
    }

    Ok(())
}

/// Validate and print the effective configuration
fn check_config(config: &Config) -> Result<()> {
    config.validate().context("Invalid configuration")?;
    let rendered = toml::to_string_pretty(config).context("Failed to render configuration")?;
    println!("{}", rendered);
    Ok(())
}
