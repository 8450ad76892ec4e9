//! Frame sources for the hand tracking pipeline.
//!
//! A source models the sensor's per-frame delivery callback: it pushes one
//! synchronized [`SensorFrame`] (color, depth, skeletons) per physical frame
//! over a small bounded channel. The buffer is intentionally small to
//! backpressure the generator when downstream consumers fall behind; the
//! pipeline itself applies its own drop policy after this point.
//!
//! Two sources are provided: a synthetic generator producing a scripted
//! person (useful for demos and load tests), and a scripted source replaying
//! a pre-built frame sequence at a fixed cadence.

use std::{sync::Arc, thread, time::Duration};

use anyhow::{Result, bail};
use chrono::Utc;
use crossbeam_channel::{Receiver, Sender, bounded};
use nalgebra::Point3;

mod types;

pub use types::{IngestError, SensorFrame, SkeletonSnapshot, TrackingState, first_tracked};

/// Settings for the synthetic sensor source.
#[derive(Clone, Debug)]
pub struct SyntheticSourceConfig {
    pub width: usize,
    pub height: usize,
    pub rate_hz: f64,
    /// Stop after this many frames; `None` streams until the receiver is
    /// dropped.
    pub frames: Option<u64>,
    /// Report a device loss after this many frames instead of ending the
    /// stream cleanly. Used to exercise recovery paths.
    pub fail_after: Option<u64>,
    pub track_id: u32,
}

impl Default for SyntheticSourceConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            rate_hz: 30.0,
            frames: None,
            fail_after: None,
            track_id: 1,
        }
    }
}

/// Spawns a background thread that delivers synthetic frames at a steady
/// rate over the returned [`Receiver`].
///
/// The scripted person holds still for two seconds, then sweeps sideways for
/// one, so both stability classes show up downstream.
pub fn spawn_synthetic_source(
    config: SyntheticSourceConfig,
) -> Result<Receiver<Result<SensorFrame, IngestError>>> {
    if config.rate_hz <= 0.0 {
        bail!(
            "synthetic source rate must be positive, got {}",
            config.rate_hz
        );
    }
    if config.width == 0 || config.height == 0 {
        bail!(
            "synthetic source dimensions must be positive, got {}x{}",
            config.width,
            config.height
        );
    }

    let (tx, rx) = bounded(2);
    thread::spawn(move || synthetic_loop(config, tx));
    Ok(rx)
}

/// Replays a pre-built frame sequence at a fixed cadence, then ends the
/// stream by closing the channel. Useful for deterministic pipeline tests and
/// as the delivery half of a session replay.
pub fn spawn_scripted_source(
    frames: Vec<SensorFrame>,
    interval: Duration,
) -> Receiver<Result<SensorFrame, IngestError>> {
    let (tx, rx) = bounded(2);
    thread::spawn(move || {
        for frame in frames {
            if tx.send(Ok(frame)).is_err() {
                return;
            }
            thread::sleep(interval);
        }
    });
    rx
}

fn synthetic_loop(config: SyntheticSourceConfig, tx: Sender<Result<SensorFrame, IngestError>>) {
    let (color, depth) = synthetic_buffers(config.width, config.height);
    let interval = Duration::from_secs_f64(1.0 / config.rate_hz);
    let mut seq_no = 0u64;

    loop {
        if let Some(limit) = config.frames {
            if seq_no >= limit {
                break;
            }
        }
        if let Some(fail_at) = config.fail_after {
            if seq_no >= fail_at {
                let _ = tx.send(Err(IngestError::DeviceLost { frame: seq_no }));
                break;
            }
        }

        let timestamp_ms = Utc::now().timestamp_millis();
        let skeleton = SkeletonSnapshot {
            track_id: config.track_id,
            position: scripted_position(seq_no, config.rate_hz),
            state: TrackingState::Tracked,
            timestamp_ms,
        };
        let frame = SensorFrame {
            color: color.clone(),
            depth: depth.clone(),
            skeletons: vec![skeleton],
            seq_no,
            timestamp_ms,
        };

        if tx.send(Ok(frame)).is_err() {
            break;
        }
        seq_no += 1;
        thread::sleep(interval);
    }
}

/// Two seconds standing still at the sensor axis, one second of sideways
/// sweep, repeating.
fn scripted_position(seq_no: u64, rate_hz: f64) -> Point3<f32> {
    let t = seq_no as f64 / rate_hz;
    let cycle = t % 3.0;
    let x = if cycle < 2.0 {
        0.0
    } else {
        0.5 * ((cycle - 2.0) * std::f64::consts::TAU).sin()
    };
    Point3::new(x as f32, 0.0, 2.0)
}

/// Flat gray color image plus a depth plane at 3 m with a near blob at
/// 0.8 m in the center, enough for the reference detector to find something.
fn synthetic_buffers(width: usize, height: usize) -> (Arc<[u8]>, Arc<[u8]>) {
    let color = vec![96u8; width * height * 4];

    let mut depth = vec![0u8; width * height * 2];
    let center_x = width as f64 / 2.0;
    let center_y = height as f64 / 2.0;
    let radius = width.min(height) as f64 / 8.0;
    for y in 0..height {
        for x in 0..width {
            let dx = x as f64 - center_x;
            let dy = y as f64 - center_y;
            let mm: u16 = if dx * dx + dy * dy < radius * radius {
                800
            } else {
                3000
            };
            let offset = (y * width + x) * 2;
            depth[offset..offset + 2].copy_from_slice(&mm.to_le_bytes());
        }
    }

    (color.into(), depth.into())
}
