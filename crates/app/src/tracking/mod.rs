//! Frame-handoff and tracking-worker pipeline with per-person stability
//! classification.
//!
//! The module is split into focused submodules:
//! - `config`: CLI configuration parsing.
//! - `data`: shared structs passed between stages.
//! - `stability`: per-person motion stability classification.
//! - `rate`: worker throughput estimation.
//! - `handoff`: bounded drop-under-load handoff between delivery and worker.
//! - `session`: tracking session lifecycle and the detection worker loop.
//! - `pipeline`: controller façade and the supervisor run loop.
//! - `telemetry`: tracing and metrics installation.
//! - `watchdog`: liveness monitoring for pipeline stages.

/// Re-export pipeline settings so callers can configure runs without reaching
/// into submodules.
pub use config::{TrackingCliArgs, TrackingConfig};
/// Launch the tracking pipeline with a ready-made configuration.
pub use pipeline::run;

mod config;
mod data;
mod handoff;
mod pipeline;
mod rate;
mod session;
mod stability;
mod telemetry;
mod watchdog;
