//! Configuration parsing for the tracking pipeline.
//!
//! This module owns translation of CLI arguments into a `TrackingConfig`
//! struct which downstream stages use without re-parsing flags.

use std::time::Duration;

use anyhow::{Result, bail};
use clap::Args;

/// Canonical configuration shared by every stage in the pipeline.
#[derive(Clone, Debug)]
pub struct TrackingConfig {
    /// Sensor frame width in pixels.
    pub width: usize,
    /// Sensor frame height in pixels.
    pub height: usize,
    /// Delivery rate of the synthetic sensor source.
    pub source_rate_hz: f64,
    /// Stop after this many frames; `None` runs until Ctrl-C.
    pub frames: Option<u64>,
    /// Handoff-queue occupancy at or below which a new frame is still
    /// accepted; anything beyond is dropped.
    pub pending_limit: usize,
    /// Retention window of the stability classifier.
    pub stability_window: Duration,
    /// Drift tolerance factor of the stability classifier.
    pub drift_factor: f32,
    /// Depth slab kept by the reference detector, millimeters.
    pub slab_mm: u16,
    /// Emit verbose logging (frame drops, per-frame detail).
    pub verbose: bool,
    /// Telemetry and instrumentation options.
    pub telemetry: TelemetryOptions,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            source_rate_hz: 30.0,
            frames: None,
            pending_limit: 1,
            stability_window: Duration::from_millis(500),
            drift_factor: 0.05,
            slab_mm: 150,
            verbose: false,
            telemetry: TelemetryOptions::default(),
        }
    }
}

/// Optional telemetry knobs.
#[derive(Clone, Debug, Default)]
pub struct TelemetryOptions {
    /// Tracing filter directives overriding `RUST_LOG`, e.g. `debug`.
    pub log_directives: Option<String>,
}

/// CLI arguments accepted by the `track` subcommand.
#[derive(Debug, Args)]
pub struct TrackingCliArgs {
    /// Sensor frame width in pixels.
    #[arg(long = "width", value_name = "PX", default_value_t = 640)]
    pub width: usize,
    /// Sensor frame height in pixels.
    #[arg(long = "height", value_name = "PX", default_value_t = 480)]
    pub height: usize,
    /// Sensor delivery rate in frames per second.
    #[arg(long = "rate", value_name = "FPS", default_value_t = 30.0)]
    pub rate: f64,
    /// Stop after this many frames instead of running until Ctrl-C.
    #[arg(long = "frames", value_name = "N")]
    pub frames: Option<u64>,
    /// Queue occupancy at or below which a frame is still handed to the
    /// tracking worker.
    #[arg(long = "pending-limit", value_name = "N", default_value_t = 1)]
    pub pending_limit: usize,
    /// Stability window in milliseconds.
    #[arg(long = "stability-window-ms", value_name = "MS", default_value_t = 500)]
    pub stability_window_ms: u64,
    /// Drift tolerance factor for the stability classifier.
    #[arg(long = "drift-factor", value_name = "K", default_value_t = 0.05)]
    pub drift_factor: f32,
    /// Depth slab kept by the reference detector, millimeters.
    #[arg(long = "slab-mm", value_name = "MM", default_value_t = 150)]
    pub slab_mm: u16,
    /// Emit verbose logging (frame drops, per-frame detail).
    #[arg(long = "verbose", action = clap::ArgAction::SetTrue)]
    pub verbose: bool,
    /// Tracing filter directives, e.g. `debug` or `hand_input=trace`.
    #[arg(long = "log", value_name = "DIRECTIVES")]
    pub log: Option<String>,
}

impl TryFrom<TrackingCliArgs> for TrackingConfig {
    type Error = anyhow::Error;

    fn try_from(args: TrackingCliArgs) -> Result<Self> {
        if args.width == 0 || args.height == 0 {
            bail!("--width and --height must be positive integers");
        }
        if args.rate <= 0.0 || !args.rate.is_finite() {
            bail!("--rate must be a positive number of frames per second");
        }
        if args.stability_window_ms == 0 {
            bail!("--stability-window-ms must be at least 1");
        }
        if args.drift_factor <= 0.0 || !args.drift_factor.is_finite() {
            bail!("--drift-factor must be a positive number");
        }
        if args.slab_mm == 0 {
            bail!("--slab-mm must be at least 1");
        }

        Ok(Self {
            width: args.width,
            height: args.height,
            source_rate_hz: args.rate,
            frames: args.frames,
            pending_limit: args.pending_limit,
            stability_window: Duration::from_millis(args.stability_window_ms),
            drift_factor: args.drift_factor,
            slab_mm: args.slab_mm,
            verbose: args.verbose,
            telemetry: TelemetryOptions {
                log_directives: args.log,
            },
        })
    }
}
