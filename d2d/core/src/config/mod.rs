//! TOML Configuration File Support
//!
//! Layered loading of the connection configuration, with a TOML file at
//! `~/.config/d2d/d2d.toml`.
//!
//! # Configuration Priority
//!
//! Configuration values are loaded with the following priority (highest first):
//! 1. CLI arguments (via [`ConfigOverrides`])
//! 2. Environment variables (`D2D_*`)
//! 3. TOML configuration file
//! 4. Default values
//!
//! # XDG Base Directory Compliance
//!
//! - `$XDG_CONFIG_HOME/d2d/d2d.toml` (typically `~/.config/d2d/d2d.toml`)
//!
//! # Example Configuration
//!
//! ```toml
//! [connection]
//! kind = "socket"
//! host = "192.168.1.20"
//! port = 5001
//! sec_key = "paired-secret"
//! secured = true
//! watchdog_interval_ms = 1000
//! chunk_size = 16384
//!
//! [tls]
//! trust = "pinned_certificate"
//! certificate = "peer.pem"
//! ```
//!
//! A relative `certificate` path is resolved against the file's directory.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::transport::{ConnectionConfig, ConnectionKind, TlsTrust};

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Tracks where a configuration value came from
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from command-line argument
    Cli,
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    #[default]
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// Connection section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionToml {
    /// "socket" or "samba"
    pub kind: Option<ConnectionKind>,

    /// Remote host
    pub host: Option<String>,

    /// Remote port
    pub port: Option<u16>,

    /// Shared secret
    pub sec_key: Option<String>,

    /// Whether to negotiate TLS
    pub secured: Option<bool>,

    /// Connect watchdog interval in milliseconds
    pub watchdog_interval_ms: Option<u64>,

    /// Read/write chunk size in bytes
    pub chunk_size: Option<usize>,

    /// Largest accepted header in bytes
    pub max_header_size: Option<usize>,

    /// Largest accepted body in bytes
    pub max_body_size: Option<usize>,
}

/// TLS section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsToml {
    /// "trust_on_first_use" or "pinned_certificate"
    pub trust: Option<TlsTrust>,

    /// Bundled certificate path
    pub certificate: Option<PathBuf>,
}

/// Top-level TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct D2dToml {
    /// Connection configuration section
    pub connection: ConnectionToml,

    /// TLS configuration section
    pub tls: TlsToml,
}

// =============================================================================
// Main Configuration Struct
// =============================================================================

/// Configuration loaded from all sources
#[derive(Clone, Debug, Default)]
pub struct D2dConfigFile {
    /// Connection configuration
    pub connection: ConnectionConfig,

    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,

    /// Source of configuration values
    source: ConfigSource,
}

impl D2dConfigFile {
    /// Get the primary source of this configuration
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Check the values are usable
    ///
    /// Run after CLI overrides, since an override may supply a missing value.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` naming the first bad value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let connection = &self.connection;
        if connection.host.trim().is_empty() {
            return Err(ConfigError::ValidationError("host must not be empty".into()));
        }
        if connection.port == 0 {
            return Err(ConfigError::ValidationError("port must not be 0".into()));
        }
        if connection.chunk_size == 0 {
            return Err(ConfigError::ValidationError(
                "chunk_size must be greater than 0".into(),
            ));
        }
        if connection.watchdog_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "watchdog_interval_ms must be greater than 0".into(),
            ));
        }
        if connection.secured
            && connection.tls.trust == TlsTrust::PinnedCertificate
            && connection.tls.certificate.is_none()
        {
            return Err(ConfigError::ValidationError(
                "pinned_certificate trust requires tls.certificate".into(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/d2d/d2d.toml` or `~/.config/d2d/d2d.toml` if
/// `XDG_CONFIG_HOME` is not set.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("d2d").join("d2d.toml"))
}

/// Load configuration from all sources with proper priority
///
/// CLI arguments are not handled here; apply [`ConfigOverrides`] after.
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed.
/// A missing config file is not an error (defaults are used).
pub fn load_config() -> Result<D2dConfigFile, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read or parsed.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<D2dConfigFile, ConfigError> {
    let mut config = D2dConfigFile::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: D2dToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config.connection, &toml_config, config_path.parent());
            config.config_file_path = Some(config_path.clone());
            config.source = ConfigSource::File;

            tracing::info!(
                path = %config_path.display(),
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    if config.connection.apply_env() {
        config.source = ConfigSource::Env;
    }

    Ok(config)
}

/// Apply TOML configuration values to the connection config
fn apply_toml_config(config: &mut ConnectionConfig, toml: &D2dToml, base_dir: Option<&Path>) {
    let connection = &toml.connection;
    if let Some(kind) = connection.kind {
        config.kind = kind;
    }
    if let Some(ref host) = connection.host {
        config.host = host.clone();
    }
    if let Some(port) = connection.port {
        config.port = port;
    }
    if let Some(ref key) = connection.sec_key {
        config.sec_key = key.clone();
    }
    if let Some(secured) = connection.secured {
        config.secured = secured;
    }
    if let Some(ms) = connection.watchdog_interval_ms {
        config.watchdog_interval_ms = ms;
    }
    if let Some(size) = connection.chunk_size {
        config.chunk_size = size;
    }
    if let Some(size) = connection.max_header_size {
        config.max_header_size = size;
    }
    if let Some(size) = connection.max_body_size {
        config.max_body_size = size;
    }

    if let Some(trust) = toml.tls.trust {
        config.tls.trust = trust;
    }
    if let Some(ref cert) = toml.tls.certificate {
        let resolved = match base_dir {
            Some(dir) if cert.is_relative() => dir.join(cert),
            _ => cert.clone(),
        };
        config.tls.certificate = Some(resolved);
    }
}

// =============================================================================
// CLI Override Support
// =============================================================================

/// Builder for applying CLI overrides to configuration
///
/// Use this after [`load_config`] to apply command-line argument overrides.
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Host override
    pub host: Option<String>,

    /// Port override
    pub port: Option<u16>,

    /// Shared secret override
    pub sec_key: Option<String>,

    /// Secured flag override
    pub secured: Option<bool>,

    /// Certificate path override
    pub certificate: Option<PathBuf>,

    /// TLS trust override
    pub trust: Option<TlsTrust>,
}

impl ConfigOverrides {
    /// Create a new empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set host override
    #[must_use]
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Set port override
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Set shared secret override
    #[must_use]
    pub fn with_sec_key(mut self, key: impl Into<String>) -> Self {
        self.sec_key = Some(key.into());
        self
    }

    /// Set secured override
    #[must_use]
    pub fn with_secured(mut self, secured: bool) -> Self {
        self.secured = Some(secured);
        self
    }

    /// Set certificate override
    #[must_use]
    pub fn with_certificate(mut self, path: PathBuf) -> Self {
        self.certificate = Some(path);
        self
    }

    /// Set TLS trust override
    #[must_use]
    pub fn with_trust(mut self, trust: TlsTrust) -> Self {
        self.trust = Some(trust);
        self
    }

    /// Check if any override is set
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.host.is_none()
            && self.port.is_none()
            && self.sec_key.is_none()
            && self.secured.is_none()
            && self.certificate.is_none()
            && self.trust.is_none()
    }

    /// Apply overrides to a configuration
    pub fn apply(&self, config: &mut D2dConfigFile) {
        if self.is_empty() {
            return;
        }
        let connection = &mut config.connection;

        if let Some(ref host) = self.host {
            connection.host = host.clone();
        }
        if let Some(port) = self.port {
            connection.port = port;
        }
        if let Some(ref key) = self.sec_key {
            connection.sec_key = key.clone();
        }
        if let Some(secured) = self.secured {
            connection.secured = secured;
        }
        if let Some(ref cert) = self.certificate {
            connection.tls.certificate = Some(cert.clone());
        }
        if let Some(trust) = self.trust {
            connection.tls.trust = trust;
        }

        config.source = ConfigSource::Cli;
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    // =========================================================================
    // Default Configuration Tests
    // =========================================================================

    #[test]
    fn test_default_config() {
        let config = D2dConfigFile::default();
        assert_eq!(config.connection.kind, ConnectionKind::Socket);
        assert!(!config.connection.secured);
        assert_eq!(config.source(), ConfigSource::Default);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_config_path() {
        if let Some(p) = default_config_path() {
            assert!(p.ends_with("d2d/d2d.toml"));
        }
    }

    // =========================================================================
    // TOML Parsing Tests
    // =========================================================================

    #[test]
    fn test_parse_valid_toml() {
        let file = write_config(
            r#"
[connection]
kind = "samba"
host = "10.1.2.3"
port = 5001
secured = true
chunk_size = 4096
max_body_size = 1048576

[tls]
certificate = "/etc/d2d/peer.pem"
"#,
        );

        let config = load_config_from_path(Some(file.path().to_path_buf())).unwrap();
        let connection = &config.connection;

        assert_eq!(connection.kind, ConnectionKind::Samba);
        assert_eq!(connection.port, 5001);
        assert!(connection.secured);
        assert_eq!(connection.chunk_size, 4096);
        assert_eq!(connection.max_body_size, 1_048_576);
        assert_eq!(
            connection.tls.certificate.as_deref(),
            Some(Path::new("/etc/d2d/peer.pem"))
        );
        assert_eq!(config.config_file_path.as_deref(), Some(file.path()));
    }

    #[test]
    fn test_relative_certificate_resolves_against_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("d2d.toml");
        std::fs::write(&path, "[tls]\ncertificate = \"peer.pem\"\n").unwrap();

        let config = load_config_from_path(Some(path)).unwrap();
        assert_eq!(
            config.connection.tls.certificate,
            Some(dir.path().join("peer.pem"))
        );
    }

    #[test]
    fn test_parse_partial_toml() {
        let file = write_config("[connection]\nchunk_size = 512\n");

        let config = load_config_from_path(Some(file.path().to_path_buf())).unwrap();

        assert_eq!(config.connection.chunk_size, 512);
        assert_eq!(config.connection.max_header_size, 1024 * 1024);
    }

    #[test]
    fn test_malformed_toml_error() {
        let file = write_config("[connection\nport = ");

        let result = load_config_from_path(Some(file.path().to_path_buf()));
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let file = write_config("[connection]\nkind = \"ftp\"\n");

        let result = load_config_from_path(Some(file.path().to_path_buf()));
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    // =========================================================================
    // Missing File Handling Tests
    // =========================================================================

    #[test]
    fn test_missing_file_graceful() {
        let path = PathBuf::from("/nonexistent/path/d2d.toml");
        let config = load_config_from_path(Some(path)).unwrap();

        // Env vars may leak in from a parallel test; only the file is checked
        assert!(config.config_file_path.is_none());
        assert_ne!(config.source(), ConfigSource::File);
    }

    // =========================================================================
    // Priority Tests
    // =========================================================================

    #[test]
    fn test_env_overrides_file() {
        let file = write_config("[connection]\nwatchdog_interval_ms = 250\n");

        std::env::set_var("D2D_WATCHDOG_INTERVAL", "750");
        let config = load_config_from_path(Some(file.path().to_path_buf())).unwrap();
        std::env::remove_var("D2D_WATCHDOG_INTERVAL");

        assert_eq!(config.connection.watchdog_interval_ms, 750);
        assert_eq!(config.source(), ConfigSource::Env);
    }

    #[test]
    fn test_cli_overrides_everything() {
        let file = write_config("[connection]\nhost = \"10.0.0.1\"\nport = 7000\n");
        let mut config = load_config_from_path(Some(file.path().to_path_buf())).unwrap();

        ConfigOverrides::new()
            .with_host("10.0.0.9")
            .with_port(7001)
            .with_secured(true)
            .apply(&mut config);

        assert_eq!(config.connection.host, "10.0.0.9");
        assert_eq!(config.connection.port, 7001);
        assert!(config.connection.secured);
        assert_eq!(config.source(), ConfigSource::Cli);
    }

    #[test]
    fn test_config_overrides_empty_no_change() {
        let mut config = D2dConfigFile::default();
        let before = config.connection.clone();

        let overrides = ConfigOverrides::new();
        assert!(overrides.is_empty());
        overrides.apply(&mut config);

        assert_eq!(config.connection, before);
        assert_eq!(config.source(), ConfigSource::Default);
    }

    // =========================================================================
    // Validation Tests
    // =========================================================================

    #[test]
    fn test_validation_rejects_pinned_without_certificate() {
        let mut config = D2dConfigFile::default();
        ConfigOverrides::new()
            .with_secured(true)
            .with_trust(TlsTrust::PinnedCertificate)
            .apply(&mut config);

        match config.validate() {
            Err(ConfigError::ValidationError(msg)) => assert!(msg.contains("certificate")),
            other => panic!("Expected validation error, got: {other:?}"),
        }

        ConfigOverrides::new()
            .with_certificate(PathBuf::from("peer.pem"))
            .apply(&mut config);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_zero_port_and_chunk() {
        let mut config = D2dConfigFile::default();
        config.connection.port = 0;
        assert!(config.validate().is_err());

        config.connection.port = 5001;
        config.connection.chunk_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_source_display() {
        assert_eq!(ConfigSource::Cli.to_string(), "CLI");
        assert_eq!(ConfigSource::Env.to_string(), "environment");
        assert_eq!(ConfigSource::File.to_string(), "config file");
        assert_eq!(ConfigSource::Default.to_string(), "default");
    }
}
