//! Worker configuration.

use std::net::SocketAddr;
use std::time::Duration;

use cwatch_pipeline::PipelineConfig;
use tracing::warn;

use crate::error::{WorkerError, WorkerResult};
use crate::logging::LogFormat;

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Detection pipeline settings
    pub pipeline: PipelineConfig,
    /// Frames buffered per camera before `try_push` starts dropping
    pub ingest_capacity: usize,
    /// How often expired metadata and cache entries are swept
    pub sweep_interval: Duration,
    /// Graceful shutdown timeout
    pub shutdown_timeout: Duration,
    /// Source errors in a row after which a stream stops
    pub max_consecutive_source_errors: u32,
    /// Forward gated-out frames to the sink for live preview
    pub forward_preview: bool,
    pub log_format: LogFormat,
    /// Prometheus scrape address; no exporter when unset
    pub metrics_addr: Option<SocketAddr>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            pipeline: PipelineConfig::default(),
            ingest_capacity: 32,
            sweep_interval: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(10),
            max_consecutive_source_errors: 5,
            forward_preview: true,
            log_format: LogFormat::Pretty,
            metrics_addr: None,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

impl WorkerConfig {
    /// Create config from `.env` and environment variables.
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        let d = Self::default();

        let log_format = match std::env::var("LOG_FORMAT") {
            Ok(raw) => raw.parse().unwrap_or_else(|e| {
                warn!("{}, falling back to pretty output", e);
                LogFormat::Pretty
            }),
            Err(_) => d.log_format,
        };

        Self {
            pipeline: PipelineConfig::from_env(),
            ingest_capacity: env_parse("CWATCH_INGEST_CAPACITY").unwrap_or(d.ingest_capacity),
            sweep_interval: env_parse("CWATCH_SWEEP_INTERVAL_MS")
                .map(Duration::from_millis)
                .unwrap_or(d.sweep_interval),
            shutdown_timeout: env_parse("CWATCH_SHUTDOWN_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(d.shutdown_timeout),
            max_consecutive_source_errors: env_parse("CWATCH_MAX_SOURCE_ERRORS")
                .unwrap_or(d.max_consecutive_source_errors),
            forward_preview: env_parse("CWATCH_FORWARD_PREVIEW").unwrap_or(d.forward_preview),
            log_format,
            metrics_addr: env_parse("CWATCH_METRICS_ADDR"),
        }
    }

    pub fn validate(&self) -> WorkerResult<()> {
        self.pipeline.validate()?;
        if self.ingest_capacity == 0 {
            return Err(WorkerError::config_error(
                "ingest_capacity must be at least 1",
            ));
        }
        if self.sweep_interval.is_zero() {
            return Err(WorkerError::config_error(
                "sweep_interval must be positive",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_defaults_valid() {
        let config = WorkerConfig::default();
        assert_ok!(config.validate());
        assert_eq!(config.ingest_capacity, 32);
        assert!(config.metrics_addr.is_none());
    }

    #[test]
    fn test_from_env() {
        std::env::set_var("CWATCH_INGEST_CAPACITY", "8");
        std::env::set_var("CWATCH_METRICS_ADDR", "127.0.0.1:9100");
        std::env::set_var("CWATCH_SWEEP_INTERVAL_MS", "250");
        let config = WorkerConfig::from_env();
        std::env::remove_var("CWATCH_INGEST_CAPACITY");
        std::env::remove_var("CWATCH_METRICS_ADDR");
        std::env::remove_var("CWATCH_SWEEP_INTERVAL_MS");

        assert_eq!(config.ingest_capacity, 8);
        assert_eq!(config.sweep_interval, Duration::from_millis(250));
        assert_eq!(config.metrics_addr, Some("127.0.0.1:9100".parse().unwrap()));
    }

    #[test]
    fn test_invalid_pipeline_config_rejected() {
        let mut config = WorkerConfig::default();
        config.pipeline.workers.max_concurrency = 0;
        assert_err!(config.validate());
    }
}
