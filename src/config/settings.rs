//! # Configuration Settings
//!
//! Process-level settings for the gateplane control plane: where the xDS server
//! listens, how the rebuild pipeline debounces, and how logs are emitted.

use crate::errors::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use validator::Validate;

/// Main process configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate, Default)]
pub struct ControlPlaneConfig {
    /// xDS server configuration
    #[validate(nested)]
    pub xds: XdsServerConfig,

    /// Rebuild pipeline configuration
    #[validate(nested)]
    pub pipeline: PipelineConfig,

    /// Observability configuration
    #[validate(nested)]
    pub observability: ObservabilityConfig,
}

impl ControlPlaneConfig {
    /// Validate the entire configuration
    pub fn validate(&self) -> Result<()> {
        Validate::validate(self).map_err(Error::from)?;

        if self.pipeline.holdoff_max_delay_ms < self.pipeline.holdoff_delay_ms {
            return Err(Error::validation_field(
                "holdoff max delay must not be shorter than the holdoff delay",
                "pipeline.holdoff_max_delay_ms",
            ));
        }

        Ok(())
    }
}

/// xDS gRPC server configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct XdsServerConfig {
    /// Bind address for the xDS server
    #[validate(length(min = 1, message = "xDS bind address cannot be empty"))]
    pub bind_address: String,

    /// xDS server port
    #[validate(range(min = 1, max = 65535, message = "xDS port must be between 1 and 65535"))]
    pub port: u16,

    /// Buffer of responses queued per stream before the stream applies backpressure
    #[validate(range(min = 1, max = 10000, message = "Stream buffer must be between 1 and 10000"))]
    pub stream_buffer: usize,
}

impl Default for XdsServerConfig {
    fn default() -> Self {
        Self { bind_address: "0.0.0.0".to_string(), port: 8001, stream_buffer: 100 }
    }
}

impl XdsServerConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }
}

/// Rebuild pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct PipelineConfig {
    /// Quiet period after a change before a rebuild starts
    #[validate(range(max = 60000, message = "Holdoff delay must be at most 60s"))]
    pub holdoff_delay_ms: u64,

    /// Longest a rebuild may be postponed while changes keep arriving
    #[validate(range(max = 300000, message = "Holdoff max delay must be at most 300s"))]
    pub holdoff_max_delay_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self { holdoff_delay_ms: 100, holdoff_max_delay_ms: 500 }
    }
}

impl PipelineConfig {
    pub fn holdoff_delay(&self) -> Duration {
        Duration::from_millis(self.holdoff_delay_ms)
    }

    pub fn holdoff_max_delay(&self) -> Duration {
        Duration::from_millis(self.holdoff_max_delay_ms)
    }
}

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ObservabilityConfig {
    /// Service name for log records
    #[validate(length(min = 1, message = "Service name cannot be empty"))]
    pub service_name: String,

    /// Log level filter used when `RUST_LOG` is unset
    #[validate(length(min = 1, message = "Log level cannot be empty"))]
    pub log_level: String,

    /// Emit JSON formatted logs
    pub json_logging: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            service_name: "gateplane".to_string(),
            log_level: "info".to_string(),
            json_logging: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = ControlPlaneConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.xds.bind_address(), "0.0.0.0:8001");
    }

    #[test]
    fn test_zero_port_is_rejected() {
        let mut config = ControlPlaneConfig::default();
        config.xds.port = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_holdoff_ordering_is_enforced() {
        let mut config = ControlPlaneConfig::default();
        config.pipeline.holdoff_delay_ms = 1000;
        config.pipeline.holdoff_max_delay_ms = 200;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("holdoff max delay"));
    }
}
