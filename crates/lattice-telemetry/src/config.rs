//! Telemetry configuration from environment variables.

use std::env;

/// Configuration for logging and metrics.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name for logs
    pub service_name: String,

    /// Log level filter (trace, debug, info, warn, error)
    pub log_level: String,

    /// Whether to enable console output (for development)
    pub console_output: bool,

    /// Whether to enable JSON formatted logs
    pub json_logs: bool,

    /// Prometheus metrics port
    pub metrics_port: u16,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "lattice".to_string(),
            log_level: "info".to_string(),
            console_output: true,
            json_logs: false,
            metrics_port: 9100,
        }
    }
}

impl TelemetryConfig {
    /// Create configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `LATTICE_SERVICE_NAME`: Service name (default: lattice)
    /// - `LATTICE_LOG_LEVEL` or `RUST_LOG`: Log level (default: info)
    /// - `LATTICE_CONSOLE_OUTPUT`: Enable console output (default: true)
    /// - `LATTICE_JSON_LOGS`: JSON logs (default: false in dev, true in containers)
    /// - `LATTICE_METRICS_PORT`: Prometheus metrics port (default: 9100)
    #[must_use]
    pub fn from_env() -> Self {
        let is_container =
            env::var("KUBERNETES_SERVICE_HOST").is_ok() || env::var("DOCKER_CONTAINER").is_ok();

        Self {
            service_name: env::var("LATTICE_SERVICE_NAME").unwrap_or_else(|_| "lattice".to_string()),

            log_level: env::var("LATTICE_LOG_LEVEL")
                .or_else(|_| env::var("RUST_LOG"))
                .unwrap_or_else(|_| "info".to_string()),

            console_output: env::var("LATTICE_CONSOLE_OUTPUT")
                .map(|v| v.to_lowercase() != "false" && v != "0")
                .unwrap_or(true),

            json_logs: env::var("LATTICE_JSON_LOGS")
                .map(|v| v.to_lowercase() == "true" || v == "1")
                .unwrap_or(is_container),

            metrics_port: env::var("LATTICE_METRICS_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(9100),
        }
    }

    /// Create configuration for a named module.
    #[must_use]
    pub fn for_module(module_name: &str) -> Self {
        let mut config = Self::from_env();
        config.service_name = format!("lattice-{module_name}");
        config
    }
}
