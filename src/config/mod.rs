//! # Configuration Management
//!
//! Two layers of configuration:
//!
//! - [`ControlPlaneConfig`]: process settings read from `GATEPLANE_*` environment variables.
//! - [`Parameters`]: the controller configuration file (YAML) that shapes the
//!   generated Envoy configuration.

pub mod parameters;
pub mod settings;

pub use parameters::{
    AbsentHeaderPolicy, ClusterDnsFamily, HeadersPolicy, HttpVersion, NamespacedName, Parameters,
    TimeoutParameters, TlsParameters, DEFAULT_TLS_CIPHERS,
};
pub use settings::{ControlPlaneConfig, ObservabilityConfig, PipelineConfig, XdsServerConfig};

use crate::{Error, Result};

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(value) => value
            .parse()
            .map_err(|e| Error::config(format!("Invalid value for {}: {}", key, e))),
        Err(_) => Ok(default),
    }
}

impl ControlPlaneConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let config = Self {
            xds: XdsServerConfig {
                bind_address: env_or("GATEPLANE_XDS_BIND_ADDRESS", defaults.xds.bind_address)?,
                port: env_or("GATEPLANE_XDS_PORT", defaults.xds.port)?,
                stream_buffer: env_or("GATEPLANE_XDS_STREAM_BUFFER", defaults.xds.stream_buffer)?,
            },
            pipeline: PipelineConfig {
                holdoff_delay_ms: env_or(
                    "GATEPLANE_HOLDOFF_DELAY_MS",
                    defaults.pipeline.holdoff_delay_ms,
                )?,
                holdoff_max_delay_ms: env_or(
                    "GATEPLANE_HOLDOFF_MAX_DELAY_MS",
                    defaults.pipeline.holdoff_max_delay_ms,
                )?,
            },
            observability: ObservabilityConfig {
                service_name: env_or("GATEPLANE_SERVICE_NAME", defaults.observability.service_name)?,
                log_level: env_or("GATEPLANE_LOG_LEVEL", defaults.observability.log_level)?,
                json_logging: env_or("GATEPLANE_JSON_LOGGING", defaults.observability.json_logging)?,
            },
        };

        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    // Environment variables are process wide, so every env case lives in one test.
    #[test]
    fn test_config_from_env() {
        env::remove_var("GATEPLANE_XDS_PORT");
        env::remove_var("GATEPLANE_XDS_BIND_ADDRESS");
        env::remove_var("GATEPLANE_JSON_LOGGING");

        let config = ControlPlaneConfig::from_env().unwrap();
        assert_eq!(config.xds.port, 8001);
        assert_eq!(config.xds.bind_address, "0.0.0.0");

        env::set_var("GATEPLANE_XDS_PORT", "18000");
        env::set_var("GATEPLANE_XDS_BIND_ADDRESS", "127.0.0.1");
        env::set_var("GATEPLANE_JSON_LOGGING", "true");

        let config = ControlPlaneConfig::from_env().unwrap();
        assert_eq!(config.xds.port, 18000);
        assert_eq!(config.xds.bind_address, "127.0.0.1");
        assert!(config.observability.json_logging);

        env::set_var("GATEPLANE_XDS_PORT", "not-a-port");
        let err = ControlPlaneConfig::from_env().unwrap_err();
        assert!(err.to_string().contains("GATEPLANE_XDS_PORT"));

        env::remove_var("GATEPLANE_XDS_PORT");
        env::remove_var("GATEPLANE_XDS_BIND_ADDRESS");
        env::remove_var("GATEPLANE_JSON_LOGGING");
    }
}
