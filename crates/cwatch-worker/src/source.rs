//! Frame sources feeding the per-camera ingest loops.
//!
//! The pipeline treats frames as opaque handles; decoding and frame
//! lifetime stay on this side of the boundary.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use cwatch_pipeline::Frame;
use image::RgbImage;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::error::{WorkerError, WorkerResult};

/// Extensions picked up by [`DirectorySource`].
const IMAGE_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "bmp"];

/// Ordered stream of frames from one camera.
#[async_trait]
pub trait FrameSource: Send {
    /// Next frame, an error for a frame that could not be read, or `None`
    /// once the source is exhausted.
    async fn next_frame(&mut self) -> Option<WorkerResult<Frame>>;

    fn camera_id(&self) -> &str;
}

/// Producer side of a [`ChannelSource`].
#[derive(Clone)]
pub struct IngestHandle {
    camera_id: String,
    tx: mpsc::Sender<(RgbImage, Instant)>,
    dropped: Arc<AtomicU64>,
}

impl IngestHandle {
    /// Queue a frame without waiting. A full buffer drops the frame and
    /// returns `false`, so a slow pipeline never stalls the camera.
    pub fn try_push(&self, image: RgbImage) -> bool {
        match self.tx.try_send((image, Instant::now())) {
            Ok(()) => true,
            Err(_) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                debug!(camera_id = %self.camera_id, dropped, "Ingest buffer full, frame dropped");
                false
            }
        }
    }

    /// Queue a frame, waiting for buffer space.
    pub async fn push(&self, image: RgbImage) -> WorkerResult<()> {
        self.tx
            .send((image, Instant::now()))
            .await
            .map_err(|_| WorkerError::source_failed(format!("stream {} closed", self.camera_id)))
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn camera_id(&self) -> &str {
        &self.camera_id
    }
}

/// Source fed by an in-process producer (capture thread, decoder).
///
/// The source ends when every [`IngestHandle`] has been dropped.
pub struct ChannelSource {
    camera_id: String,
    rx: mpsc::Receiver<(RgbImage, Instant)>,
}

impl ChannelSource {
    pub fn new(camera_id: impl Into<String>, capacity: usize) -> (Self, IngestHandle) {
        let camera_id = camera_id.into();
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = IngestHandle {
            camera_id: camera_id.clone(),
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        };
        (Self { camera_id, rx }, handle)
    }
}

#[async_trait]
impl FrameSource for ChannelSource {
    async fn next_frame(&mut self) -> Option<WorkerResult<Frame>> {
        let (image, captured_at) = self.rx.recv().await?;
        Some(Ok(Frame::new(self.camera_id.clone(), image).with_captured_at(captured_at)))
    }

    fn camera_id(&self) -> &str {
        &self.camera_id
    }
}

/// Replays image files from a directory in file-name order.
pub struct DirectorySource {
    camera_id: String,
    files: VecDeque<PathBuf>,
}

impl DirectorySource {
    pub fn new(camera_id: impl Into<String>, dir: impl AsRef<Path>) -> WorkerResult<Self> {
        let dir = dir.as_ref();
        let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_file() && has_image_extension(path))
            .collect();
        files.sort();

        let camera_id = camera_id.into();
        info!(
            camera_id = %camera_id,
            dir = %dir.display(),
            frames = files.len(),
            "Directory source opened"
        );
        Ok(Self {
            camera_id,
            files: files.into(),
        })
    }

    /// Files not yet replayed.
    pub fn remaining(&self) -> usize {
        self.files.len()
    }
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
        .unwrap_or(false)
}

#[async_trait]
impl FrameSource for DirectorySource {
    async fn next_frame(&mut self) -> Option<WorkerResult<Frame>> {
        let path = self.files.pop_front()?;
        let decoded =
            tokio::task::spawn_blocking(move || image::open(&path).map(|img| img.to_rgb8())).await;

        Some(match decoded {
            Ok(Ok(image)) => Ok(Frame::new(self.camera_id.clone(), image)),
            Ok(Err(e)) => Err(WorkerError::Image(e)),
            Err(e) => Err(WorkerError::source_failed(format!("decode task failed: {e}"))),
        })
    }

    fn camera_id(&self) -> &str {
        &self.camera_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[tokio::test]
    async fn test_channel_source_drops_when_full() {
        let (mut source, handle) = ChannelSource::new("cam-1", 2);
        assert!(handle.try_push(RgbImage::new(4, 4)));
        assert!(handle.try_push(RgbImage::new(4, 4)));
        assert!(!handle.try_push(RgbImage::new(4, 4)));
        assert_eq!(handle.dropped(), 1);

        let frame = source.next_frame().await.unwrap().unwrap();
        assert_eq!(frame.camera_id, "cam-1");
        drop(handle);
        assert!(source.next_frame().await.unwrap().is_ok());
        assert!(source.next_frame().await.is_none());
    }

    #[tokio::test]
    async fn test_directory_source_replays_in_order() {
        let dir = tempfile::tempdir().unwrap();
        for (name, level) in [("b.png", 20u8), ("a.png", 10), ("c.png", 30)] {
            RgbImage::from_pixel(8, 6, Rgb([level, level, level]))
                .save(dir.path().join(name))
                .unwrap();
        }
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let mut source = DirectorySource::new("replay", dir.path()).unwrap();
        assert_eq!(source.remaining(), 3);

        let mut levels = Vec::new();
        while let Some(frame) = source.next_frame().await {
            let frame = frame.unwrap();
            levels.push(frame.handle.image().get_pixel(0, 0)[0]);
        }
        assert_eq!(levels, vec![10, 20, 30]);
    }

    #[tokio::test]
    async fn test_directory_source_reports_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("broken.png"), b"not a png").unwrap();

        let mut source = DirectorySource::new("replay", dir.path()).unwrap();
        assert!(source.next_frame().await.unwrap().is_err());
        assert!(source.next_frame().await.is_none());
    }
}
