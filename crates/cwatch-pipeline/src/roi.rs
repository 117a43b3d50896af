//! Region-of-interest batching for the secondary models.
//!
//! Person boxes are cropped out of the shared frame buffer, resized to the
//! model's input size and stacked into a single `N x 3 x H x W` tensor so a
//! secondary model is invoked once per frame instead of once per person.
//!
//! Every crop carries a [`CropMapping`] that maps model outputs (crop
//! coordinates, in target-size pixels) back to frame coordinates:
//!
//! `x_frame = crop.x + x_crop * scale_x`

use std::sync::atomic::{AtomicU64, Ordering};

use cwatch_models::{BoundingBox, Keypoint};
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::{s, Array4};
use rayon::prelude::*;
use tracing::debug;

use crate::frame::FrameHandle;
use crate::metrics;

/// Affine mapping between one crop and the source frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CropMapping {
    /// Index of the source box in the extractor input
    pub source_index: usize,
    /// Crop rectangle in frame coordinates (integer-aligned, at least 1x1)
    pub crop: BoundingBox,
    /// Frame pixels per crop pixel along x
    pub scale_x: f64,
    /// Frame pixels per crop pixel along y
    pub scale_y: f64,
}

impl CropMapping {
    /// Map a point from crop space to frame space.
    #[inline]
    pub fn map_point(&self, x: f64, y: f64) -> (f64, f64) {
        (
            self.crop.x + x * self.scale_x,
            self.crop.y + y * self.scale_y,
        )
    }

    /// Map a point from frame space into crop space.
    #[inline]
    pub fn to_crop(&self, x: f64, y: f64) -> (f64, f64) {
        (
            (x - self.crop.x) / self.scale_x,
            (y - self.crop.y) / self.scale_y,
        )
    }

    /// Map a rectangle from crop space to frame space.
    pub fn map_rect(&self, rect: &BoundingBox) -> BoundingBox {
        let (x, y) = self.map_point(rect.x, rect.y);
        BoundingBox::new(x, y, rect.width * self.scale_x, rect.height * self.scale_y)
    }

    pub fn map_keypoint(&self, keypoint: &Keypoint) -> Keypoint {
        let (x, y) = self.map_point(keypoint.x, keypoint.y);
        Keypoint::new(x, y, keypoint.confidence)
    }
}

/// Batched crops plus their inverse mappings.
#[derive(Debug, Clone)]
pub struct RoiBatch {
    /// `N x 3 x H x W`, RGB, values in `0.0..=1.0`
    pub tensor: Array4<f32>,
    /// One mapping per crop, in input order
    pub mappings: Vec<CropMapping>,
    /// `(width, height)` of every crop
    pub target_size: (u32, u32),
}

impl RoiBatch {
    pub fn empty(target_size: (u32, u32)) -> Self {
        let (w, h) = target_size;
        Self {
            tensor: Array4::zeros((0, 3, h as usize, w as usize)),
            mappings: Vec::new(),
            target_size,
        }
    }

    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }
}

/// Crops and stacks person regions.
#[derive(Debug, Default)]
pub struct RoiBatchExtractor {
    batches: AtomicU64,
}

impl RoiBatchExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Crop `boxes` out of `frame`, resize each to `target_size` and stack.
    ///
    /// Boxes are clamped to the frame; a box entirely outside the frame
    /// collapses to a 1x1 crop at the nearest edge so indices stay aligned.
    /// Zero boxes yield an empty batch.
    pub fn extract(
        &self,
        frame: &FrameHandle,
        boxes: &[BoundingBox],
        target_size: (u32, u32),
    ) -> RoiBatch {
        self.extract_many(frame, boxes, &[target_size])
            .pop()
            .unwrap_or_else(|| RoiBatch::empty(target_size))
    }

    /// Like [`extract`](Self::extract), producing one batch per target size
    /// from a single cropping pass. Batches come back in `target_sizes` order.
    pub fn extract_many(
        &self,
        frame: &FrameHandle,
        boxes: &[BoundingBox],
        target_sizes: &[(u32, u32)],
    ) -> Vec<RoiBatch> {
        let targets: Vec<(u32, u32)> = target_sizes
            .iter()
            .map(|&(w, h)| (w.max(1), h.max(1)))
            .collect();
        self.batches.fetch_add(targets.len() as u64, Ordering::Relaxed);

        let image = frame.image();
        if boxes.is_empty() || image.width() == 0 || image.height() == 0 {
            return targets.into_iter().map(RoiBatch::empty).collect();
        }

        let regions: Vec<((u32, u32, u32, u32), RgbImage)> = boxes
            .par_iter()
            .map(|bbox| {
                let rect = crop_rect(bbox, image.width(), image.height());
                let (x0, y0, w, h) = rect;
                (rect, imageops::crop_imm(image, x0, y0, w, h).to_image())
            })
            .collect();

        targets
            .into_iter()
            .map(|target_size| stack(&regions, target_size))
            .collect()
    }

    /// Number of batches produced so far.
    pub fn batches_extracted(&self) -> u64 {
        self.batches.load(Ordering::Relaxed)
    }
}

/// Resize every region to `target_size` and stack them into one batch.
fn stack(regions: &[((u32, u32, u32, u32), RgbImage)], target_size: (u32, u32)) -> RoiBatch {
    let (target_w, target_h) = target_size;
    let crops: Vec<(CropMapping, RgbImage)> = regions
        .par_iter()
        .enumerate()
        .map(|(idx, (rect, region))| {
            let (x0, y0, w, h) = *rect;
            let resized = imageops::resize(region, target_w, target_h, FilterType::Triangle);
            let mapping = CropMapping {
                source_index: idx,
                crop: BoundingBox::new(x0 as f64, y0 as f64, w as f64, h as f64),
                scale_x: w as f64 / target_w as f64,
                scale_y: h as f64 / target_h as f64,
            };
            (mapping, resized)
        })
        .collect();

    let mut tensor =
        Array4::<f32>::zeros((crops.len(), 3, target_h as usize, target_w as usize));
    for (n, (_, crop)) in crops.iter().enumerate() {
        let mut slot = tensor.slice_mut(s![n, .., .., ..]);
        for (x, y, pixel) in crop.enumerate_pixels() {
            for c in 0..3 {
                slot[[c, y as usize, x as usize]] = pixel[c] as f32 / 255.0;
            }
        }
    }

    metrics::record_roi_batch(crops.len());
    debug!(crops = crops.len(), target_w, target_h, "ROI batch extracted");

    RoiBatch {
        tensor,
        mappings: crops.into_iter().map(|(m, _)| m).collect(),
        target_size,
    }
}

/// Integer crop rectangle clamped to the frame, at least 1x1.
fn crop_rect(bbox: &BoundingBox, frame_w: u32, frame_h: u32) -> (u32, u32, u32, u32) {
    let max_x = frame_w.saturating_sub(1) as f64;
    let max_y = frame_h.saturating_sub(1) as f64;
    let x0 = bbox.x.floor().clamp(0.0, max_x) as u32;
    let y0 = bbox.y.floor().clamp(0.0, max_y) as u32;
    let x1 = (bbox.x2().ceil().clamp(0.0, frame_w as f64) as u32).max(x0 + 1);
    let y1 = (bbox.y2().ceil().clamp(0.0, frame_h as f64) as u32).max(y0 + 1);
    (x0, y0, x1 - x0, y1 - y0)
}
