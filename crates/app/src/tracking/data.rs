use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use depth_ingest::{SensorFrame, SkeletonSnapshot, first_tracked};
use saliency::HandDetection;
use serde::Serialize;

/// Unit of work handed from the delivery context to the tracking worker.
///
/// Built once per incoming frame, owned by exactly one side at a time
/// (producer, queue, then worker) and discarded after a single detection
/// pass. Buffers are shared immutably with the originating frame.
#[derive(Clone)]
pub(crate) struct FramePacket {
    pub(crate) color: Arc<[u8]>,
    pub(crate) depth: Arc<[u8]>,
    pub(crate) skeleton: Option<SkeletonSnapshot>,
    pub(crate) frame_number: u64,
}

impl FramePacket {
    pub(crate) fn from_frame(frame: &SensorFrame) -> Self {
        Self {
            color: frame.color.clone(),
            depth: frame.depth.clone(),
            skeleton: first_tracked(&frame.skeletons).cloned(),
            frame_number: frame.seq_no,
        }
    }
}

/// Motion classification for one tracked person.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub(crate) enum StabilityLabel {
    Stable,
    Unstable,
}

impl StabilityLabel {
    pub(crate) fn label(self) -> &'static str {
        match self {
            StabilityLabel::Stable => "stable",
            StabilityLabel::Unstable => "unstable",
        }
    }
}

/// Per-track-id stability classifications published once per delivered frame.
pub(crate) type SharedStabilities = Arc<Mutex<HashMap<u32, StabilityLabel>>>;

/// Most recent detection published by the tracking worker.
#[derive(Clone)]
pub(crate) struct LatestDetection {
    pub(crate) detection: HandDetection,
    pub(crate) frame_number: u64,
    pub(crate) generation: u64,
}

/// Single-slot publication point between the tracking worker and readers.
///
/// Each session start bumps the generation and clears the slot; a worker may
/// only publish while its own generation is still current, so a superseded
/// worker can never overwrite results from its replacement.
pub(crate) struct ResultBoard {
    inner: Mutex<BoardInner>,
}

struct BoardInner {
    generation: u64,
    latest: Option<LatestDetection>,
}

impl ResultBoard {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(BoardInner {
                generation: 0,
                latest: None,
            }),
        }
    }

    /// Open a fresh session generation, invalidating all previous writers.
    pub(crate) fn begin_generation(&self) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        inner.generation += 1;
        inner.latest = None;
        inner.generation
    }

    /// Publish a detection on behalf of `generation`. Returns `false` when
    /// that generation has been superseded and the result was discarded.
    pub(crate) fn publish(
        &self,
        generation: u64,
        detection: HandDetection,
        frame_number: u64,
    ) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if generation != inner.generation {
            return false;
        }
        inner.latest = Some(LatestDetection {
            detection,
            frame_number,
            generation,
        });
        true
    }

    pub(crate) fn snapshot(&self) -> Option<LatestDetection> {
        self.inner.lock().unwrap().latest.clone()
    }
}
