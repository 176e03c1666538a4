//! gattlink CLI configuration
//!
//! Loaded from a TOML file passed with `--config`; every section and field
//! is optional and falls back to the defaults below.
//!
//! ```toml
//! [connection]
//! mode = "auto"
//! operation_timeout_secs = 10
//!
//! [notifications]
//! setup_mode = "compat"
//! ```

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use gattlink_core::config::{
    DEFAULT_CONNECT_TIMEOUT, DEFAULT_DISCONNECT_TIMEOUT, DEFAULT_OPERATION_TIMEOUT,
};
use gattlink_core::{ConnectMode, ConnectionSetup, NotificationSetupMode};

use crate::error::{CliError, Result};

// ----------------------------------------------------------------------------
// Configuration Sections
// ----------------------------------------------------------------------------

/// Complete configuration for the CLI
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    pub connection: ConnectionConfig,
    pub notifications: NotificationConfig,
    pub scan: ScanConfig,
    pub long_write: LongWriteConfig,
}

/// Options for every connection the CLI opens
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub mode: ConnectMode,
    pub operation_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub disconnect_timeout_secs: u64,
    /// Log property mismatches instead of rejecting the operation
    pub suppress_illegal_operation_check: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    /// btleplug writes the descriptor itself, so `compat` is the default
    pub setup_mode: NotificationSetupMode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    pub duration_secs: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LongWriteConfig {
    /// Batch size override; the MTU decides when unset
    pub max_batch_size: Option<usize>,
    pub retry_attempts: u32,
    /// Pause between batches; each batch waits for its response when unset
    pub ack_delay_ms: Option<u64>,
}

// ----------------------------------------------------------------------------
// Default Implementations
// ----------------------------------------------------------------------------

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            mode: ConnectMode::Direct,
            operation_timeout_secs: DEFAULT_OPERATION_TIMEOUT.as_secs(),
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT.as_secs(),
            disconnect_timeout_secs: DEFAULT_DISCONNECT_TIMEOUT.as_secs(),
            suppress_illegal_operation_check: false,
        }
    }
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            setup_mode: NotificationSetupMode::Compat,
        }
    }
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self { duration_secs: 5 }
    }
}

// ----------------------------------------------------------------------------
// Loading and Conversion
// ----------------------------------------------------------------------------

impl CliConfig {
    /// Load and validate a TOML configuration file
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let connection = &self.connection;
        if connection.operation_timeout_secs == 0
            || connection.connect_timeout_secs == 0
            || connection.disconnect_timeout_secs == 0
        {
            return Err(CliError::Config("timeouts must be greater than zero".into()));
        }
        if self.long_write.max_batch_size == Some(0) {
            return Err(CliError::Config("long_write.max_batch_size must be greater than zero".into()));
        }
        Ok(())
    }

    /// Setup applied to every connection attempt
    pub fn connection_setup(&self) -> ConnectionSetup {
        let connection = &self.connection;
        ConnectionSetup {
            mode: connection.mode,
            operation_timeout: Duration::from_secs(connection.operation_timeout_secs),
            connect_timeout: Duration::from_secs(connection.connect_timeout_secs),
            disconnect_timeout: Duration::from_secs(connection.disconnect_timeout_secs),
            suppress_illegal_operation_check: connection.suppress_illegal_operation_check,
        }
    }

    pub fn scan_duration(&self) -> Duration {
        Duration::from_secs(self.scan.duration_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_core() {
        let config = CliConfig::default();
        assert_eq!(config.connection_setup(), ConnectionSetup::default());
        assert_eq!(config.notifications.setup_mode, NotificationSetupMode::Compat);
        assert_eq!(config.scan_duration(), Duration::from_secs(5));
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = CliConfig::from_toml(
            r#"
            [connection]
            mode = "auto"
            operation_timeout_secs = 10

            [notifications]
            setup_mode = "quick_setup"
            "#,
        )
        .unwrap();

        let setup = config.connection_setup();
        assert_eq!(setup.mode, ConnectMode::Auto);
        assert_eq!(setup.operation_timeout, Duration::from_secs(10));
        assert_eq!(setup.connect_timeout, DEFAULT_CONNECT_TIMEOUT);
        assert_eq!(config.notifications.setup_mode, NotificationSetupMode::QuickSetup);
        assert_eq!(config.long_write, LongWriteConfig::default());
    }

    #[test]
    fn test_zero_timeout_is_rejected() {
        let result = CliConfig::from_toml("[connection]\nconnect_timeout_secs = 0\n");
        assert!(matches!(result, Err(CliError::Config(_))));
    }

    #[test]
    fn test_zero_batch_size_is_rejected() {
        let result = CliConfig::from_toml("[long_write]\nmax_batch_size = 0\n");
        assert!(matches!(result, Err(CliError::Config(_))));
    }

    #[test]
    fn test_unknown_mode_is_a_parse_error() {
        let result = CliConfig::from_toml("[connection]\nmode = \"eventually\"\n");
        assert!(matches!(result, Err(CliError::TomlParsing(_))));
    }

    #[test]
    fn test_missing_file_is_a_config_error() {
        let result = CliConfig::load_from_file("/nonexistent/gattlink.toml");
        assert!(matches!(result, Err(CliError::Config(message)) if message.contains("reading")));
    }
}
