//! Frame handles shared across pipeline stages.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use image::RgbImage;

/// Reference-counted pixel buffer. Cloning never copies pixels.
#[derive(Clone)]
pub struct FrameHandle(Arc<RgbImage>);

impl FrameHandle {
    pub fn new(image: RgbImage) -> Self {
        Self(Arc::new(image))
    }

    pub fn image(&self) -> &RgbImage {
        &self.0
    }

    pub fn width(&self) -> u32 {
        self.0.width()
    }

    pub fn height(&self) -> u32 {
        self.0.height()
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.0.dimensions()
    }

    /// Whether both handles point at the same buffer.
    pub fn ptr_eq(&self, other: &FrameHandle) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl From<RgbImage> for FrameHandle {
    fn from(image: RgbImage) -> Self {
        Self::new(image)
    }
}

impl fmt::Debug for FrameHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FrameHandle({}x{})", self.width(), self.height())
    }
}

/// A raw frame as supplied by the ingest layer.
#[derive(Debug, Clone)]
pub struct Frame {
    pub camera_id: String,
    /// Monotonic capture time
    pub captured_at: Instant,
    /// Wall-clock receive time
    pub received_at: DateTime<Utc>,
    pub handle: FrameHandle,
}

impl Frame {
    pub fn new(camera_id: impl Into<String>, image: impl Into<FrameHandle>) -> Self {
        Self {
            camera_id: camera_id.into(),
            captured_at: Instant::now(),
            received_at: Utc::now(),
            handle: image.into(),
        }
    }

    /// Override the capture timestamp (sources that know the real capture time).
    pub fn with_captured_at(mut self, captured_at: Instant) -> Self {
        self.captured_at = captured_at;
        self
    }
}

/// Downsample a frame to a `cols x rows` luma grid.
///
/// Each cell averages the BT.601 luma of its pixel block. Cells cover the
/// frame evenly; trailing pixels fold into the last row/column.
pub(crate) fn luma_grid(image: &RgbImage, cols: u32, rows: u32) -> Vec<u8> {
    let (width, height) = image.dimensions();
    let cols = cols.clamp(1, width.max(1));
    let rows = rows.clamp(1, height.max(1));
    let mut sums = vec![0u64; (cols * rows) as usize];
    let mut counts = vec![0u32; (cols * rows) as usize];

    // Sample every other pixel on large frames; enough for a motion metric.
    let step = if width >= cols * 2 && height >= rows * 2 { 2 } else { 1 };
    for y in (0..height).step_by(step) {
        let gy = (y * rows / height.max(1)).min(rows - 1);
        for x in (0..width).step_by(step) {
            let gx = (x * cols / width.max(1)).min(cols - 1);
            let p = image.get_pixel(x, y);
            let luma = (299 * p[0] as u32 + 587 * p[1] as u32 + 114 * p[2] as u32) / 1000;
            let idx = (gy * cols + gx) as usize;
            sums[idx] += luma as u64;
            counts[idx] += 1;
        }
    }

    sums.iter()
        .zip(counts.iter())
        .map(|(&s, &c)| if c > 0 { (s / c as u64) as u8 } else { 0 })
        .collect()
}
