//! CLI Entry Point for laser_loop
//!
//! Provides command-line interface for:
//! - Dry runs of the control loop against a simulated camera and device layer
//! - Checking and printing the effective configuration
//!
//! # Usage
//!
//! Run for 10 seconds with the PI controller, printing telemetry as JSON lines:
//! ```bash
//! laser_loop run --duration 10 --controller pi --json
//! ```
//!
//! Show the configuration after file and environment overrides:
//! ```bash
//! laser_loop check-config --config config/laser_loop.toml
//! ```

// Global allocator (Microsoft Rust Guidelines: M-MIMALLOC-APPS)
#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use laser_loop::analyzer::AnalyzerSpec;
use laser_loop::config::{ImagingMode, Settings, DEFAULT_CONFIG_PATH};
use laser_loop::controller::ControllerSpec;
use laser_loop::hardware::{MockCamera, MockPropertyBus, PropertyBus};
use laser_loop::laser::LaserFactory;
use laser_loop::telemetry::{TelemetryEvent, TelemetrySink};
use laser_loop::tracing_setup::{self, OutputFormat, TracingConfig};
use laser_loop::RunCoordinator;
use tokio::signal;

#[derive(Parser)]
#[command(name = "laser_loop")]
#[command(about = "Closed-loop laser illumination control", long_about = None)]
struct Cli {
    /// Configuration file (TOML); missing files fall back to defaults
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log output format: pretty, compact or json
    #[arg(long, global = true, default_value = "compact")]
    log_format: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the loop against the simulated camera
    Run {
        /// Run length in seconds (Ctrl-C stops early)
        #[arg(long, default_value_t = 10.0)]
        duration: f64,

        /// Analyzer strategy, overriding the configuration
        #[arg(long)]
        analyzer: Option<String>,

        /// Controller law, overriding the configuration
        #[arg(long)]
        controller: Option<String>,

        /// Imaging mode: continuous_grab, live_pipeline_tap or next_acquisition
        #[arg(long)]
        mode: Option<String>,

        /// Frames in the triggered sequence (next_acquisition mode)
        #[arg(long, default_value_t = 50)]
        sequence_frames: usize,

        /// Print telemetry as JSON lines on stdout
        #[arg(long)]
        json: bool,
    },

    /// Validate and print the effective configuration
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            duration,
            analyzer,
            controller,
            mode,
            sequence_frames,
            json,
        } => {
            let mut settings = Settings::load_from(&cli.config)
                .with_context(|| format!("loading {}", cli.config.display()))?;
            if let Some(name) = analyzer {
                settings.analyzer = AnalyzerSpec::from_name(&name)?;
            }
            if let Some(name) = controller {
                settings.controller = ControllerSpec::from_name(&name)?;
            }
            if let Some(mode) = mode {
                settings.run.imaging_mode = mode.parse()?;
            }
            settings.validate()?;

            let format: OutputFormat = cli.log_format.parse()?;
            tracing_setup::init(TracingConfig::from_settings(&settings)?.with_format(format))?;

            let duration = Duration::try_from_secs_f64(duration)
                .context("duration must be a non-negative number of seconds")?;
            run_dry(settings, duration, sequence_frames, json).await
        }
        Commands::CheckConfig => {
            let settings = Settings::load_from(&cli.config)
                .with_context(|| format!("loading {}", cli.config.display()))?;
            print!("{}", settings.to_toml()?);
            Ok(())
        }
    }
}

async fn run_dry(settings: Settings, duration: Duration, sequence_frames: usize, json: bool) -> Result<()> {
    let laser_target = settings.laser.clone();

    // Simulated device layer; the camera's spot density falls with laser power
    let bus = Arc::new(MockPropertyBus::new().with_value(
        &laser_target.device,
        &laser_target.property,
        laser_target.min_power,
    ));
    let camera = Arc::new(MockCamera::default().with_power_coupling(
        Arc::clone(&bus),
        &laser_target.device,
        &laser_target.property,
        settings.run.max_laser_power / 2.0,
    ));
    if settings.run.imaging_mode == ImagingMode::LivePipelineTap {
        camera.start_stream()?;
    }

    let (telemetry, mut events) = TelemetrySink::channel(settings.telemetry.capacity);
    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if json {
                match serde_json::to_string(&event) {
                    Ok(line) => println!("{}", line),
                    Err(e) => tracing::warn!(error = %e, "Cannot serialize telemetry"),
                }
                continue;
            }
            match event {
                TelemetryEvent::Tick(record) => tracing::info!(
                    tick = record.tick,
                    output = record.analyzer_output,
                    requested = record.requested_power,
                    applied = record.applied_power,
                    status = ?record.status,
                    "Tick"
                ),
                TelemetryEvent::Skipped { tick, .. } => tracing::debug!(tick, "Tick skipped"),
            }
        }
    });

    let device_bus: Arc<dyn PropertyBus> = bus.clone();
    let laser = LaserFactory::for_run(&settings.run, &laser_target, Some(device_bus))?;
    let mut coordinator = RunCoordinator::new(camera.clone(), telemetry);
    coordinator
        .start_run(
            settings.run.clone(),
            settings.analyzer.build()?,
            settings.controller.build()?,
            laser,
        )
        .await?;

    if settings.run.imaging_mode == ImagingMode::NextAcquisition {
        let served = camera.trigger_acquisition(sequence_frames);
        tracing::info!(frames = sequence_frames, served, "Triggered acquisition sequence");
    }

    tokio::select! {
        _ = tokio::time::sleep(duration) => {}
        _ = signal::ctrl_c() => tracing::info!("Interrupted"),
        reason = coordinator.stopped() => tracing::warn!(?reason, "Run stopped on its own"),
    }

    let report = coordinator.stop_run().await?;
    camera.stop_stream();
    drop(coordinator);
    let _ = printer.await;

    if json {
        eprintln!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", serde_json::to_string_pretty(&report)?);
    }
    Ok(())
}
