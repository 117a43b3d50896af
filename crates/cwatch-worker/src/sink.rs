//! Output sinks receiving processed frames, events and previews.

use async_trait::async_trait;
use cwatch_models::{ComplianceEvent, FrameRecord};
use cwatch_pipeline::FrameHandle;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::error::{WorkerError, WorkerResult};

/// Consumer of everything a stream produces.
#[async_trait]
pub trait OutputSink: Send + Sync {
    /// Processed or cache-replayed frame, after metadata hand-off.
    async fn on_frame(&self, record: FrameRecord) -> WorkerResult<()>;

    /// Confirmed or ended compliance event.
    async fn on_event(&self, event: ComplianceEvent) -> WorkerResult<()>;

    /// Frame dropped by the skip gate, forwarded unannotated.
    async fn on_preview(&self, _camera_id: &str, _frame: FrameHandle) -> WorkerResult<()> {
        Ok(())
    }

    fn name(&self) -> &'static str;
}

/// Message delivered by [`ChannelSink`].
#[derive(Debug, Clone)]
pub enum SinkMessage {
    Frame(FrameRecord),
    Event(ComplianceEvent),
    Preview { camera_id: String, frame: FrameHandle },
}

/// Forwards everything into an mpsc channel.
pub struct ChannelSink {
    tx: mpsc::Sender<SinkMessage>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<SinkMessage>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    async fn send(&self, message: SinkMessage) -> WorkerResult<()> {
        self.tx
            .send(message)
            .await
            .map_err(|_| WorkerError::sink_failed("receiver dropped"))
    }
}

#[async_trait]
impl OutputSink for ChannelSink {
    async fn on_frame(&self, record: FrameRecord) -> WorkerResult<()> {
        self.send(SinkMessage::Frame(record)).await
    }

    async fn on_event(&self, event: ComplianceEvent) -> WorkerResult<()> {
        self.send(SinkMessage::Event(event)).await
    }

    async fn on_preview(&self, camera_id: &str, frame: FrameHandle) -> WorkerResult<()> {
        self.send(SinkMessage::Preview {
            camera_id: camera_id.to_string(),
            frame,
        })
        .await
    }

    fn name(&self) -> &'static str {
        "channel"
    }
}

/// Writes events at info level and frame records as JSON at debug level.
#[derive(Debug, Default)]
pub struct LogSink;

#[async_trait]
impl OutputSink for LogSink {
    async fn on_frame(&self, record: FrameRecord) -> WorkerResult<()> {
        let json = record
            .to_json()
            .map_err(|e| WorkerError::sink_failed(format!("record serialization failed: {e}")))?;
        debug!(
            camera_id = %record.camera_id,
            frame_id = record.frame_id,
            record = %json,
            "Frame record"
        );
        Ok(())
    }

    async fn on_event(&self, event: ComplianceEvent) -> WorkerResult<()> {
        let json = serde_json::to_string(&event)
            .map_err(|e| WorkerError::sink_failed(format!("event serialization failed: {e}")))?;
        info!(camera_id = %event.camera_id, event = %json, "Compliance event");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "log"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cwatch_models::Condition;

    #[tokio::test]
    async fn test_channel_sink_forwards_and_reports_closed() {
        let (sink, mut rx) = ChannelSink::new(4);
        let condition = Condition::Action("hand_washing".into());
        let event = ComplianceEvent::confirmed("cam-1", 3, condition, 10);
        sink.on_event(event.clone()).await.unwrap();

        match rx.recv().await.unwrap() {
            SinkMessage::Event(received) => assert_eq!(received.event_id, event.event_id),
            other => panic!("unexpected message {other:?}"),
        }

        drop(rx);
        assert!(matches!(
            sink.on_event(event).await,
            Err(WorkerError::SinkFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_log_sink_accepts_events() {
        let event = ComplianceEvent::ended(
            "cam-1",
            3,
            Condition::MissingObject("hairnet".into()),
            10,
            14,
        );
        assert!(LogSink.on_event(event).await.is_ok());
    }
}
