//! Motion-aware frame gating.
//!
//! Decides per frame whether the full detection pipeline runs.
//!
//! # Strategy
//! - The first frame of a stream is always processed
//! - Every `skip_interval`-th frame since the last processed one is processed
//! - In between, a mean absolute luma difference against the last
//!   *processed* frame triggers early processing, rate capped by
//!   `min_detection_interval`
//! - A change in frame dimensions forces processing
//!
//! Skipped frames never reach a detection stage.

use std::time::{Duration, Instant};

use tracing::debug;

use crate::frame::{luma_grid, Frame};

/// Configuration for the frame-skip gate.
#[derive(Debug, Clone)]
pub struct FrameSkipConfig {
    /// Process every N-th frame since the last processed frame (default: 5)
    pub skip_interval: u32,
    /// Mean absolute luma difference (0-255) that triggers early processing
    pub motion_threshold: f64,
    /// Minimum time between motion-triggered detections
    pub min_detection_interval: Duration,
    /// Motion grid columns
    pub grid_cols: u32,
    /// Motion grid rows
    pub grid_rows: u32,
}

impl Default for FrameSkipConfig {
    fn default() -> Self {
        Self {
            skip_interval: 5,
            motion_threshold: 12.0,
            min_detection_interval: Duration::from_millis(200),
            grid_cols: 32,
            grid_rows: 18,
        }
    }
}

/// Why a frame was admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessTrigger {
    /// First frame of the stream
    FirstFrame,
    /// Forced interval reached
    Interval,
    /// Motion exceeded the threshold
    Motion,
    /// Frame dimensions changed
    ResolutionChange,
}

impl ProcessTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessTrigger::FirstFrame => "first_frame",
            ProcessTrigger::Interval => "interval",
            ProcessTrigger::Motion => "motion",
            ProcessTrigger::ResolutionChange => "resolution_change",
        }
    }
}

impl std::fmt::Display for ProcessTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Gate statistics.
#[derive(Debug, Clone, Default)]
pub struct FrameSkipStats {
    pub first_frame_count: u64,
    pub interval_count: u64,
    pub motion_count: u64,
    pub resolution_change_count: u64,
    pub skipped_count: u64,
    /// Motion above threshold but suppressed by the rate cap
    pub rate_limited_count: u64,
    pub last_motion_score: f64,
}

impl FrameSkipStats {
    pub fn processed_count(&self) -> u64 {
        self.first_frame_count
            + self.interval_count
            + self.motion_count
            + self.resolution_change_count
    }

    /// Fraction of frames skipped.
    pub fn skip_ratio(&self) -> f64 {
        let total = self.processed_count() + self.skipped_count;
        if total > 0 {
            self.skipped_count as f64 / total as f64
        } else {
            0.0
        }
    }
}

struct Retained {
    grid: Vec<u8>,
    dimensions: (u32, u32),
    captured_at: Instant,
}

/// Per-stream frame gate. Not shared across cameras.
pub struct FrameSkipDetector {
    config: FrameSkipConfig,
    /// Last processed frame
    retained: Option<Retained>,
    /// Frames seen since the last processed frame
    since_processed: u32,
    stats: FrameSkipStats,
}

impl FrameSkipDetector {
    pub fn new(config: FrameSkipConfig) -> Self {
        Self {
            config,
            retained: None,
            since_processed: 0,
            stats: FrameSkipStats::default(),
        }
    }

    /// Whether the frame should run through the detection stages.
    pub fn should_process(&mut self, frame: &Frame) -> bool {
        self.evaluate(frame).is_some()
    }

    /// Gate a frame, reporting why it was admitted.
    pub fn evaluate(&mut self, frame: &Frame) -> Option<ProcessTrigger> {
        let image = frame.handle.image();
        let dimensions = image.dimensions();
        let grid = luma_grid(image, self.config.grid_cols, self.config.grid_rows);

        let trigger = match &self.retained {
            None => Some(ProcessTrigger::FirstFrame),
            Some(retained) if retained.dimensions != dimensions => {
                Some(ProcessTrigger::ResolutionChange)
            }
            Some(retained) => {
                self.since_processed += 1;
                if self.since_processed >= self.config.skip_interval.max(1) {
                    Some(ProcessTrigger::Interval)
                } else {
                    let score = mean_abs_diff(&retained.grid, &grid);
                    self.stats.last_motion_score = score;
                    if score > self.config.motion_threshold {
                        let elapsed = frame
                            .captured_at
                            .saturating_duration_since(retained.captured_at);
                        if elapsed >= self.config.min_detection_interval {
                            Some(ProcessTrigger::Motion)
                        } else {
                            self.stats.rate_limited_count += 1;
                            None
                        }
                    } else {
                        None
                    }
                }
            }
        };

        match trigger {
            Some(trigger) => {
                match trigger {
                    ProcessTrigger::FirstFrame => self.stats.first_frame_count += 1,
                    ProcessTrigger::Interval => self.stats.interval_count += 1,
                    ProcessTrigger::Motion => self.stats.motion_count += 1,
                    ProcessTrigger::ResolutionChange => self.stats.resolution_change_count += 1,
                }
                debug!(
                    camera_id = %frame.camera_id,
                    trigger = %trigger,
                    motion_score = self.stats.last_motion_score,
                    "Frame admitted"
                );
                self.retained = Some(Retained {
                    grid,
                    dimensions,
                    captured_at: frame.captured_at,
                });
                self.since_processed = 0;
            }
            None => self.stats.skipped_count += 1,
        }

        trigger
    }

    pub fn stats(&self) -> &FrameSkipStats {
        &self.stats
    }

    /// Forget the retained frame; the next frame is treated as the first.
    pub fn reset(&mut self) {
        self.retained = None;
        self.since_processed = 0;
    }
}

fn mean_abs_diff(a: &[u8], b: &[u8]) -> f64 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let total: u64 = a
        .iter()
        .zip(b)
        .map(|(&x, &y)| (x as i16 - y as i16).unsigned_abs() as u64)
        .sum();
    total as f64 / a.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn solid(value: u8, at: Instant) -> Frame {
        Frame::new("cam", RgbImage::from_pixel(64, 36, Rgb([value; 3]))).with_captured_at(at)
    }

    #[test]
    fn test_static_scene_processes_every_interval() {
        let mut gate = FrameSkipDetector::new(FrameSkipConfig::default());
        let start = Instant::now();
        let decisions: Vec<bool> = (0..11)
            .map(|i| gate.should_process(&solid(50, start + Duration::from_millis(33 * i))))
            .collect();

        // frames 0, 5, 10
        let processed: Vec<usize> = decisions
            .iter()
            .enumerate()
            .filter(|(_, &p)| p)
            .map(|(i, _)| i)
            .collect();
        assert_eq!(processed, vec![0, 5, 10]);
        assert_eq!(gate.stats().skipped_count, 8);
    }

    #[test]
    fn test_motion_triggers_early_processing() {
        let mut gate = FrameSkipDetector::new(FrameSkipConfig::default());
        let start = Instant::now();
        assert_eq!(gate.evaluate(&solid(10, start)), Some(ProcessTrigger::FirstFrame));
        assert_eq!(
            gate.evaluate(&solid(200, start + Duration::from_millis(300))),
            Some(ProcessTrigger::Motion)
        );
    }

    #[test]
    fn test_motion_rate_capped() {
        let mut gate = FrameSkipDetector::new(FrameSkipConfig::default());
        let start = Instant::now();
        gate.evaluate(&solid(10, start));
        assert_eq!(gate.evaluate(&solid(200, start + Duration::from_millis(50))), None);
        assert_eq!(gate.stats().rate_limited_count, 1);
        assert!(gate.stats().last_motion_score > 100.0);
    }

    #[test]
    fn test_compares_against_retained_frame() {
        let config = FrameSkipConfig {
            skip_interval: 100,
            motion_threshold: 20.0,
            min_detection_interval: Duration::ZERO,
            ..Default::default()
        };
        let mut gate = FrameSkipDetector::new(config);
        let start = Instant::now();
        gate.evaluate(&solid(0, start));
        // gradual drift: each step below threshold, cumulative above it
        assert_eq!(gate.evaluate(&solid(15, start)), None);
        assert_eq!(gate.evaluate(&solid(30, start)), Some(ProcessTrigger::Motion));
    }

    #[test]
    fn test_resolution_change_forces_processing() {
        let mut gate = FrameSkipDetector::new(FrameSkipConfig::default());
        let start = Instant::now();
        gate.evaluate(&solid(10, start));
        let resized = Frame::new("cam", RgbImage::from_pixel(32, 18, Rgb([10; 3])));
        assert_eq!(
            gate.evaluate(&resized),
            Some(ProcessTrigger::ResolutionChange)
        );
    }
}
