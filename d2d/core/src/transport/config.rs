//! Connection Configuration
//!
//! Configuration types describing which peer to talk to and how.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::traits::Endpoint;
use crate::frame::FrameLimits;

/// Default interval of the connect watchdog
pub const DEFAULT_WATCHDOG_INTERVAL_MS: u64 = 1000;

/// Default chunk size for the read/write loops (16 KiB)
pub const DEFAULT_CHUNK_SIZE: usize = 16 * 1024;

/// Connection kind selection
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionKind {
    /// Direct TCP socket, optionally TLS-secured
    #[default]
    Socket,

    /// SMB-style file sharing
    ///
    /// Accepted for compatibility with paired devices that advertise it, but
    /// not implemented: falls back to the plain socket transport.
    Samba,
}

impl fmt::Display for ConnectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Socket => write!(f, "socket"),
            Self::Samba => write!(f, "samba"),
        }
    }
}

impl std::str::FromStr for ConnectionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "socket" | "tcp" => Ok(Self::Socket),
            "samba" | "smb" => Ok(Self::Samba),
            other => Err(format!("unknown connection kind: {other}")),
        }
    }
}

/// How the secured transport decides to trust the peer's certificate
///
/// Neither mode validates the certificate chain or the peer name. Paired
/// devices present self-signed certificates, so the choice is between
/// accepting whatever the peer presents and accepting only the bundled one.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TlsTrust {
    /// Accept any server certificate
    #[default]
    TrustOnFirstUse,

    /// Accept only a server certificate byte-identical to the bundled one
    PinnedCertificate,
}

impl fmt::Display for TlsTrust {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TrustOnFirstUse => write!(f, "trust-on-first-use"),
            Self::PinnedCertificate => write!(f, "pinned-certificate"),
        }
    }
}

impl std::str::FromStr for TlsTrust {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "trust-on-first-use" | "tofu" => Ok(Self::TrustOnFirstUse),
            "pinned-certificate" | "pinned" => Ok(Self::PinnedCertificate),
            other => Err(format!("unknown TLS trust mode: {other}")),
        }
    }
}

/// TLS settings for the secured transport
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsConfig {
    /// Trust decision for the server certificate
    pub trust: TlsTrust,

    /// Bundled certificate (PEM or DER)
    ///
    /// Required for [`TlsTrust::PinnedCertificate`].
    pub certificate: Option<PathBuf>,
}

/// Everything needed to reach one peer device
///
/// Owned by the [`D2dService`](crate::D2dService) for its whole lifetime.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Connection kind
    pub kind: ConnectionKind,

    /// Remote host name or IP address
    pub host: String,

    /// Remote port
    pub port: u16,

    /// Shared secret injected into every outgoing header as `secKey`
    pub sec_key: String,

    /// Whether to negotiate TLS
    pub secured: bool,

    /// TLS settings (used only when `secured` is set)
    pub tls: TlsConfig,

    /// Connect watchdog interval in milliseconds
    pub watchdog_interval_ms: u64,

    /// Read/write chunk size in bytes
    pub chunk_size: usize,

    /// Largest header a receiver accepts
    pub max_header_size: usize,

    /// Largest body a receiver accepts
    pub max_body_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        let limits = FrameLimits::default();
        Self {
            kind: ConnectionKind::default(),
            host: "127.0.0.1".to_string(),
            port: 8080,
            sec_key: String::new(),
            secured: false,
            tls: TlsConfig::default(),
            watchdog_interval_ms: DEFAULT_WATCHDOG_INTERVAL_MS,
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_header_size: limits.max_header_size,
            max_body_size: limits.max_body_size,
        }
    }
}

impl ConnectionConfig {
    /// Create a plain socket configuration
    pub fn socket(host: impl Into<String>, port: u16, sec_key: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            sec_key: sec_key.into(),
            ..Default::default()
        }
    }

    /// Enable or disable TLS
    #[must_use]
    pub fn with_secured(mut self, secured: bool) -> Self {
        self.secured = secured;
        self
    }

    /// Set the TLS settings
    #[must_use]
    pub fn with_tls(mut self, tls: TlsConfig) -> Self {
        self.tls = tls;
        self
    }

    /// Set the connection kind
    #[must_use]
    pub fn with_kind(mut self, kind: ConnectionKind) -> Self {
        self.kind = kind;
        self
    }

    /// Set the watchdog interval
    #[must_use]
    pub fn with_watchdog_interval(mut self, interval: Duration) -> Self {
        self.watchdog_interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `D2D_KIND`: "socket" or "samba"
    /// - `D2D_HOST`: Remote host
    /// - `D2D_PORT`: Remote port
    /// - `D2D_SEC_KEY`: Shared secret
    /// - `D2D_SECURED`: "1" or "true" to negotiate TLS
    /// - `D2D_CERT`: Bundled certificate path
    /// - `D2D_TLS_TRUST`: "trust-on-first-use" or "pinned-certificate"
    /// - `D2D_WATCHDOG_INTERVAL`: Watchdog interval in ms
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Overlay environment variables onto this configuration
    ///
    /// Returns true if any variable was applied.
    pub fn apply_env(&mut self) -> bool {
        let mut applied = false;

        if let Some(kind) = env_parse::<ConnectionKind>("D2D_KIND") {
            self.kind = kind;
            applied = true;
        }
        if let Ok(host) = std::env::var("D2D_HOST") {
            self.host = host;
            applied = true;
        }
        if let Some(port) = env_parse::<u16>("D2D_PORT") {
            self.port = port;
            applied = true;
        }
        if let Ok(key) = std::env::var("D2D_SEC_KEY") {
            self.sec_key = key;
            applied = true;
        }
        if let Ok(secured) = std::env::var("D2D_SECURED") {
            self.secured = secured == "1" || secured.to_lowercase() == "true";
            applied = true;
        }
        if let Ok(cert) = std::env::var("D2D_CERT") {
            self.tls.certificate = Some(PathBuf::from(cert));
            applied = true;
        }
        if let Some(trust) = env_parse::<TlsTrust>("D2D_TLS_TRUST") {
            self.tls.trust = trust;
            applied = true;
        }
        if let Some(ms) = env_parse::<u64>("D2D_WATCHDOG_INTERVAL") {
            self.watchdog_interval_ms = ms;
            applied = true;
        }

        applied
    }

    /// Remote endpoint
    #[must_use]
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.host.clone(), self.port)
    }

    /// Watchdog interval as a `Duration`
    #[must_use]
    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_millis(self.watchdog_interval_ms)
    }

    /// Receive-side framing limits
    #[must_use]
    pub fn frame_limits(&self) -> FrameLimits {
        FrameLimits {
            max_header_size: self.max_header_size,
            max_body_size: self.max_body_size,
        }
    }

    /// Check if this configuration negotiates TLS
    pub fn is_secured(&self) -> bool {
        self.secured
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}
