//! Application configuration.

use crate::error::{AppError, AppResult};
use exg_core::GatewayConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Gateway risk and pipeline parameters.
    #[serde(default)]
    pub gateway: GatewayConfig,
    /// Symbol allowlist; empty admits every symbol.
    #[serde(default)]
    pub symbols: Vec<String>,
    /// Persistence settings.
    #[serde(default)]
    pub persistence: PersistenceConfig,
    /// Telemetry settings.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// Persistence configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// Audit log path; `None` keeps the log in memory (tests, dry runs).
    pub audit_path: Option<String>,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            audit_path: Some("./data/audit/decisions.jsonl".to_string()),
        }
    }
}

/// Telemetry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Default tracing filter when RUST_LOG is unset.
    pub log_filter: String,
    /// Prometheus metrics port.
    pub metrics_port: u16,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_filter: "info,exg=debug".to_string(),
            metrics_port: 9184,
        }
    }
}

impl AppConfig {
    /// Load configuration from the `EXG_CONFIG` path, falling back to
    /// `config/default.toml`, then to built-in defaults.
    pub fn load() -> AppResult<Self> {
        let config_path =
            std::env::var("EXG_CONFIG").unwrap_or_else(|_| "config/default.toml".to_string());

        if Path::new(&config_path).exists() {
            Self::from_file(&config_path)
        } else {
            tracing::warn!(path = %config_path, "config file not found, using defaults");
            Ok(Self::default())
        }
    }

    /// Load from a specific file.
    pub fn from_file(path: &str) -> AppResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| AppError::Config(format!("failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| AppError::Config(format!("failed to parse config: {e}")))?;
        config.gateway.validate()?;
        Ok(config)
    }

    /// In-memory configuration for tests.
    pub fn for_tests(gateway: GatewayConfig) -> Self {
        Self {
            gateway,
            symbols: Vec::new(),
            persistence: PersistenceConfig { audit_path: None },
            telemetry: TelemetryConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert!(config.symbols.is_empty());
        assert!(config.persistence.audit_path.is_some());
    }

    #[test]
    fn test_parse_toml_with_overrides() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
symbols = ["EURUSD", "XAUUSD"]

[gateway]
max_positions = 4
kelly_scale = 0.2

[persistence]
audit_path = "/tmp/audit.jsonl"
"#
        )
        .unwrap();

        let config = AppConfig::from_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.gateway.max_positions, 4);
        assert_eq!(config.symbols.len(), 2);
        assert_eq!(
            config.persistence.audit_path.as_deref(),
            Some("/tmp/audit.jsonl")
        );
    }

    #[test]
    fn test_invalid_gateway_config_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[gateway]
dd_reduce_threshold = 0.5
"#
        )
        .unwrap();
        assert!(AppConfig::from_file(file.path().to_str().unwrap()).is_err());
    }
}
