//! Saliency-based hand detection seam used by the tracking worker.
//!
//! The pipeline only depends on the [`HandDetector`] trait; the real
//! segmentation algorithm plugs in behind it. [`DepthWindowDetector`] is a
//! cheap reference implementation good enough for demos and tests.

pub use detector::{BoundingBox, DepthWindowDetector, DetectError, HandDetection, HandDetector};

mod detector;
