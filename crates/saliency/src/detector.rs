use depth_ingest::SkeletonSnapshot;
use thiserror::Error;

/// Axis-aligned pixel rectangle. Zero area means "no detection".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BoundingBox {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl BoundingBox {
    pub const EMPTY: Self = Self {
        x: 0,
        y: 0,
        width: 0,
        height: 0,
    };

    pub fn is_empty(&self) -> bool {
        self.width <= 0 || self.height <= 0
    }

    pub fn contains(&self, x: i32, y: i32) -> bool {
        x >= self.x && x < self.x + self.width && y >= self.y && y < self.y + self.height
    }
}

/// Result of one detection pass over a frame packet.
#[derive(Debug, Clone, Default)]
pub struct HandDetection {
    pub bounding_box: BoundingBox,
    /// Refined 8-bit depth view, row-major `width * height` bytes with
    /// brighter values nearer the sensor; empty when nothing was detected.
    pub smoothed_depth: Vec<u8>,
}

impl HandDetection {
    /// The "no detection this frame" value.
    pub fn empty() -> Self {
        Self::default()
    }
}

#[derive(Debug, Error)]
pub enum DetectError {
    #[error("depth buffer size mismatch: got {got} bytes, expected {expected}")]
    DepthBufferSize { got: usize, expected: usize },
    #[error("color buffer size mismatch: got {got} bytes, expected {expected}")]
    ColorBufferSize { got: usize, expected: usize },
}

/// Expensive, CPU-bound conversion of one frame packet into a hand bounding
/// box plus a refined depth map.
///
/// Implementations run on the tracking worker thread, never on the
/// frame-delivery thread, and may take arbitrary time per call.
pub trait HandDetector: Send {
    fn detect(
        &mut self,
        depth: &[u8],
        color: &[u8],
        skeleton: Option<&SkeletonSnapshot>,
    ) -> Result<HandDetection, DetectError>;
}

/// Reference detector: segments the depth slab nearest the sensor inside a
/// search window around the tracked person.
///
/// A raised hand leads the body toward the sensor, so the nearest connected
/// slab of depth readings is a workable stand-in for real hand segmentation.
pub struct DepthWindowDetector {
    width: usize,
    height: usize,
    slab_mm: u16,
    search_radius: usize,
}

impl DepthWindowDetector {
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            slab_mm: 150,
            search_radius: width / 4,
        }
    }

    /// Override the depth slab (millimeters past the nearest reading) kept by
    /// the segmentation.
    pub fn with_slab_mm(mut self, slab_mm: u16) -> Self {
        self.slab_mm = slab_mm;
        self
    }

    fn depth_at(&self, depth: &[u8], x: usize, y: usize) -> u16 {
        let offset = (y * self.width + x) * 2;
        u16::from_le_bytes([depth[offset], depth[offset + 1]])
    }

    /// Pixel search window centered on the skeleton's projected torso, or
    /// the whole frame when no skeleton is tracked.
    fn search_window(&self, skeleton: Option<&SkeletonSnapshot>) -> (usize, usize, usize, usize) {
        let Some(skeleton) = skeleton.filter(|s| s.position.z > 0.0) else {
            return (0, 0, self.width, self.height);
        };
        let u = (0.5 + skeleton.position.x / (2.0 * skeleton.position.z)) * self.width as f32;
        let v = (0.5 - skeleton.position.y / (2.0 * skeleton.position.z)) * self.height as f32;
        let center_x = (u.max(0.0) as usize).min(self.width - 1);
        let center_y = (v.max(0.0) as usize).min(self.height - 1);
        let min_x = center_x.saturating_sub(self.search_radius);
        let min_y = center_y.saturating_sub(self.search_radius);
        let max_x = (center_x + self.search_radius + 1).min(self.width);
        let max_y = (center_y + self.search_radius + 1).min(self.height);
        (min_x, min_y, max_x, max_y)
    }
}

impl HandDetector for DepthWindowDetector {
    fn detect(
        &mut self,
        depth: &[u8],
        color: &[u8],
        skeleton: Option<&SkeletonSnapshot>,
    ) -> Result<HandDetection, DetectError> {
        let expected_depth = self.width * self.height * 2;
        if depth.len() != expected_depth {
            return Err(DetectError::DepthBufferSize {
                got: depth.len(),
                expected: expected_depth,
            });
        }
        let expected_color = self.width * self.height * 4;
        if color.len() != expected_color {
            return Err(DetectError::ColorBufferSize {
                got: color.len(),
                expected: expected_color,
            });
        }

        let (min_x, min_y, max_x, max_y) = self.search_window(skeleton);

        let mut nearest = u16::MAX;
        for y in min_y..max_y {
            for x in min_x..max_x {
                let sample = self.depth_at(depth, x, y);
                if sample > 0 && sample < nearest {
                    nearest = sample;
                }
            }
        }
        if nearest == u16::MAX {
            return Ok(HandDetection::empty());
        }

        let ceiling = nearest.saturating_add(self.slab_mm);
        let mut intensity = vec![0u8; self.width * self.height];
        let (mut lo_x, mut lo_y, mut hi_x, mut hi_y) = (max_x, max_y, min_x, min_y);
        for y in min_y..max_y {
            for x in min_x..max_x {
                let sample = self.depth_at(depth, x, y);
                if sample == 0 || sample > ceiling {
                    continue;
                }
                let span = (ceiling - nearest).max(1) as u32;
                let depth_past = (sample - nearest) as u32;
                intensity[y * self.width + x] = (255 - depth_past * 200 / span) as u8;
                lo_x = lo_x.min(x);
                lo_y = lo_y.min(y);
                hi_x = hi_x.max(x);
                hi_y = hi_y.max(y);
            }
        }
        if lo_x > hi_x || lo_y > hi_y {
            return Ok(HandDetection::empty());
        }

        Ok(HandDetection {
            bounding_box: BoundingBox {
                x: lo_x as i32,
                y: lo_y as i32,
                width: (hi_x - lo_x + 1) as i32,
                height: (hi_y - lo_y + 1) as i32,
            },
            smoothed_depth: box_smooth(&intensity, self.width, self.height),
        })
    }
}

/// One 3x3 box-filter pass, enough to knock per-pixel sensor noise out of the
/// segmented slab.
fn box_smooth(intensity: &[u8], width: usize, height: usize) -> Vec<u8> {
    let mut out = vec![0u8; intensity.len()];
    for y in 0..height {
        for x in 0..width {
            let mut sum = 0u32;
            let mut count = 0u32;
            for dy in y.saturating_sub(1)..(y + 2).min(height) {
                for dx in x.saturating_sub(1)..(x + 2).min(width) {
                    sum += intensity[dy * width + dx] as u32;
                    count += 1;
                }
            }
            out[y * width + x] = (sum / count) as u8;
        }
    }
    out
}
