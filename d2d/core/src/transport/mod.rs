//! Transport Layer for device-to-device messaging
//!
//! Provides the queued byte transport the message service runs on:
//! - `SocketMessenger`: plain TCP, or any stream a `Connector` produces
//! - `TlsConnector`: TLS with relaxed validation for paired devices
//!
//! # Design Philosophy
//!
//! Callers never touch the stream. They queue `SendRequest`s and
//! `ReceiveRequest`s; one worker per direction drains them in order while
//! the connection is open. Lifecycle changes arrive as `ConnectionEvent`s.
//!
//! # Security
//!
//! - TLS never validates the certificate chain or peer name
//! - `TlsTrust::PinnedCertificate` restricts the peer to a bundled certificate

pub mod config;
pub mod factory;
pub mod queue;
pub mod request;
pub mod secure;
pub mod socket;
pub mod traits;
pub mod watchdog;

// Re-exports for convenience
pub use config::{ConnectionConfig, ConnectionKind, TlsConfig, TlsTrust};
pub use factory::SocketMessengerFactory;
pub use queue::ByteQueue;
pub use request::{MessageValue, ReceiveOutcome, ReceiveRequest, SendOutcome, SendRequest};
pub use secure::{load_certificate, TlsConnector};
pub use socket::{EventSender, MessengerOptions, SocketMessenger, TcpConnector};
pub use traits::{
    BoxedStream, ConnectionEvent, Connector, Direction, DuplexStream, Endpoint, Messenger,
    StreamEvent, StreamStatus, TransportError,
};
pub use watchdog::ConnectWatchdog;
