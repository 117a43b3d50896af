//! Tracing setup and structured per-stream logging.

use std::str::FromStr;

use cwatch_models::ComplianceEvent;
use tracing::{error, info, warn, Span};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::error::{WorkerError, WorkerResult};

/// Log output format, selected by `LOG_FORMAT`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Colored human-readable output
    #[default]
    Pretty,
    /// One JSON object per line
    Json,
}

impl FromStr for LogFormat {
    type Err = WorkerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" | "text" | "" => Ok(Self::Pretty),
            other => Err(WorkerError::config_error(format!("unknown log format: {other}"))),
        }
    }
}

/// Install the global tracing subscriber.
///
/// `RUST_LOG` overrides the default `cwatch=info` filter. Fails if a
/// subscriber is already installed.
pub fn init_tracing(format: LogFormat) -> WorkerResult<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("cwatch=info"));

    let result = match format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(env_filter)
            .try_init(),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_ansi(true)
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            )
            .with(env_filter)
            .try_init(),
    };
    result.map_err(|e| WorkerError::config_error(format!("tracing init failed: {e}")))
}

/// Stream logger for structured logging with consistent fields.
///
/// Every line carries the camera id and the operation, so one camera's
/// lifecycle can be filtered out of a multi-stream log.
#[derive(Debug, Clone)]
pub struct StreamLogger {
    camera_id: String,
    operation: String,
}

impl StreamLogger {
    pub fn new(camera_id: &str, operation: &str) -> Self {
        Self {
            camera_id: camera_id.to_string(),
            operation: operation.to_string(),
        }
    }

    pub fn log_start(&self, message: &str) {
        info!(
            camera_id = %self.camera_id,
            operation = %self.operation,
            "Stream started: {}", message
        );
    }

    pub fn log_warning(&self, message: &str) {
        warn!(
            camera_id = %self.camera_id,
            operation = %self.operation,
            "Stream warning: {}", message
        );
    }

    pub fn log_error(&self, message: &str) {
        error!(
            camera_id = %self.camera_id,
            operation = %self.operation,
            "Stream error: {}", message
        );
    }

    pub fn log_event(&self, event: &ComplianceEvent) {
        info!(
            camera_id = %self.camera_id,
            operation = %self.operation,
            event_id = %event.event_id,
            track_id = event.track_id,
            condition = %event.condition,
            event_type = event.event_type.as_str(),
            "Compliance event forwarded"
        );
    }

    pub fn log_completion(&self, message: &str) {
        info!(
            camera_id = %self.camera_id,
            operation = %self.operation,
            "Stream stopped: {}", message
        );
    }

    pub fn camera_id(&self) -> &str {
        &self.camera_id
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    /// Span wrapping everything a stream task does.
    pub fn create_span(&self) -> Span {
        tracing::info_span!(
            "stream",
            camera_id = %self.camera_id,
            operation = %self.operation
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_parsing() {
        assert_eq!("json".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("pretty".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn test_second_init_fails() {
        let _ = init_tracing(LogFormat::Pretty);
        assert!(init_tracing(LogFormat::Json).is_err());
    }

    #[test]
    fn test_stream_logger_fields() {
        let logger = StreamLogger::new("cam-3", "ingest");
        assert_eq!(logger.camera_id(), "cam-3");
        assert_eq!(logger.operation(), "ingest");
    }
}
