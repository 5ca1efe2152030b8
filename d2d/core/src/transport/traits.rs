//! Transport Traits
//!
//! Core trait definitions for the device-to-device messenger.
//!
//! - `Messenger`: the queued send/receive contract the service drives
//! - `Connector`: produces the duplex byte stream a messenger runs over

use std::fmt;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

use super::request::{ReceiveRequest, SendRequest};

/// Remote host and port
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Endpoint {
    /// Host name or IP address
    pub host: String,
    /// Port
    pub port: u16,
}

impl Endpoint {
    /// Create a new endpoint
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Errors that can occur during transport operations
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection to peer failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Connection was closed before the request completed
    #[error("Connection closed")]
    ConnectionClosed,

    /// Failed to write a request
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Failed to read a request
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// TLS setup or handshake failed
    #[error("TLS error: {0}")]
    Tls(String),

    /// Transport not in expected state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// IO error from underlying stream
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Direction of one half of the duplex stream
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Bytes arriving from the peer
    Input,
    /// Bytes going to the peer
    Output,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Input => write!(f, "input"),
            Self::Output => write!(f, "output"),
        }
    }
}

/// Observed status of one stream direction
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum StreamStatus {
    /// `open` has not been called
    NotOpen = 0,
    /// Connecting
    Opening = 1,
    /// Ready; queues drain only in this state
    Open = 2,
    /// Closed locally or by the peer
    Closed = 3,
    /// The stream reported an error
    Errored = 4,
}

impl StreamStatus {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::NotOpen,
            1 => Self::Opening,
            2 => Self::Open,
            3 => Self::Closed,
            _ => Self::Errored,
        }
    }

    /// True once the stream can no longer drain requests
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Errored)
    }
}

impl fmt::Display for StreamStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotOpen => write!(f, "not-open"),
            Self::Opening => write!(f, "opening"),
            Self::Open => write!(f, "open"),
            Self::Closed => write!(f, "closed"),
            Self::Errored => write!(f, "errored"),
        }
    }
}

/// Readiness and lifecycle events observed on one stream direction
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamEvent {
    /// The stream finished opening
    OpenCompleted,
    /// Bytes can be read without waiting
    HasBytesAvailable,
    /// Bytes can be written without waiting
    HasSpaceAvailable,
    /// The stream reported an error
    ErrorOccurred,
    /// The peer closed the stream
    EndEncountered,
}

/// Connection lifecycle notifications delivered to the application
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The connection reached the open state
    Opened,
    /// The peer closed the connection; every pending request was failed
    Closed,
    /// The connection did not open within the watchdog interval
    ConnectFailed,
}

/// A duplex byte stream a messenger can run over
pub trait DuplexStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> DuplexStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Boxed duplex stream returned by a [`Connector`]
pub type BoxedStream = Box<dyn DuplexStream>;

/// Establishes the byte stream to a peer
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect to the endpoint and complete any handshake
    async fn connect(&self, endpoint: &Endpoint) -> Result<BoxedStream, TransportError>;

    /// Short name used in logs ("plain", "tls", ...)
    fn name(&self) -> &'static str;
}

/// Queued, event-driven messenger over one duplex stream
///
/// `send` and `receive` never block: requests are queued and drained by
/// the messenger's own workers, one at a time per direction, in FIFO order.
pub trait Messenger: Send + Sync {
    /// Start connecting and arm the connect watchdog
    ///
    /// Returns immediately; the outcome is reported through
    /// [`ConnectionEvent`]s. Fails if already open.
    fn open(&self) -> Result<(), TransportError>;

    /// Queue a write request
    fn send(&self, request: SendRequest);

    /// Queue a read request
    fn receive(&self, request: ReceiveRequest);

    /// Close both streams and fail every queued request
    fn close(&self);

    /// Cancel the connect watchdog (no-op if already cancelled)
    fn invalidate_timer(&self);

    /// Current status of the input stream
    fn input_status(&self) -> StreamStatus;

    /// Current status of the output stream
    fn output_status(&self) -> StreamStatus;

    /// Check if both directions are open
    fn is_open(&self) -> bool {
        self.input_status() == StreamStatus::Open && self.output_status() == StreamStatus::Open
    }
}
