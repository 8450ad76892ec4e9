use std::sync::Arc;

use nalgebra::Point3;
use thiserror::Error;

/// One synchronized multi-modal frame delivered by a depth sensor.
///
/// Pixel buffers are immutable and cheaply shareable; a frame carries zero or
/// more skeleton snapshots, one per person the sensor currently tracks.
#[derive(Clone)]
pub struct SensorFrame {
    /// RGBA color pixels, `width * height * 4` bytes.
    pub color: Arc<[u8]>,
    /// Little-endian u16 depth samples in millimeters, `width * height * 2`
    /// bytes. Zero means no reading for that pixel.
    pub depth: Arc<[u8]>,
    pub skeletons: Vec<SkeletonSnapshot>,
    pub seq_no: u64,
    pub timestamp_ms: i64,
}

/// Per-person skeletal pose summary for one frame.
#[derive(Clone, Debug, PartialEq)]
pub struct SkeletonSnapshot {
    pub track_id: u32,
    /// Torso position in sensor space, meters.
    pub position: Point3<f32>,
    pub state: TrackingState,
    pub timestamp_ms: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrackingState {
    Tracked,
    NotTracked,
    PositionOnly,
}

/// Select the skeleton fed to the tracking pipeline: the first fully tracked
/// person in sensor order, if any.
pub fn first_tracked(skeletons: &[SkeletonSnapshot]) -> Option<&SkeletonSnapshot> {
    skeletons
        .iter()
        .find(|skeleton| skeleton.state == TrackingState::Tracked)
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("sensor device lost after frame {frame}")]
    DeviceLost { frame: u64 },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
