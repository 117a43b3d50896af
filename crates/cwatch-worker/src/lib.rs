//! Runtime around the detection pipeline.
//!
//! This crate provides:
//! - Frame sources (in-process channels, image directories)
//! - Output sinks for frame records, events and previews
//! - A supervisor running one ingest task per camera with graceful shutdown
//! - Environment configuration, tracing setup and the Prometheus exporter

pub mod config;
pub mod error;
pub mod logging;
pub mod sink;
pub mod source;
pub mod supervisor;
pub mod telemetry;

pub use config::WorkerConfig;
pub use error::{WorkerError, WorkerResult};
pub use logging::{init_tracing, LogFormat, StreamLogger};
pub use sink::{ChannelSink, LogSink, OutputSink, SinkMessage};
pub use source::{ChannelSource, DirectorySource, FrameSource, IngestHandle};
pub use supervisor::{StopReason, StreamSummary, StreamSupervisor};
pub use telemetry::install_prometheus;
