//! D2D Core - device-to-device framed message transport
//!
//! Point-to-point messaging between paired devices over a plain or
//! TLS-secured TCP stream.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         D2dService                           │
//! │     send(message) / receive() / receive_many(n)              │
//! │                             │                                │
//! │      [len: i32 BE][header: JSON][body: fileLength bytes]     │
//! └─────────────────────────────┼────────────────────────────────┘
//!                               │ SendRequest / ReceiveRequest
//! ┌─────────────────────────────┼────────────────────────────────┐
//! │                      SocketMessenger                         │
//! │  ┌────────────┐  ┌───────────────┐  ┌─────────────────────┐  │
//! │  │ ByteQueues │  │ reader/writer │  │  ConnectWatchdog    │  │
//! │  │ (FIFO)     │  │ worker tasks  │  │  (1 s ticks)        │  │
//! │  └────────────┘  └───────┬───────┘  └─────────────────────┘  │
//! │                  Connector (TCP | TLS)                       │
//! └──────────────────────────┼───────────────────────────────────┘
//!                            ▼
//!                          peer
//! ```
//!
//! # Quick Start
//!
//! ```ignore
//! use d2d_core::{ConnectionConfig, ConnectionEvent, D2dMessage, D2dService};
//!
//! let config = ConnectionConfig::socket("192.168.1.20", 5001, "paired-secret");
//! let (service, mut events) = D2dService::new(config)?;
//! service.open()?;
//!
//! if events.recv().await == Some(ConnectionEvent::Opened) {
//!     let mut message = D2dMessage::new(Default::default(), std::fs::read("a.jpg")?);
//!     message.add_header("fileName", "a.jpg");
//!     service.send(message).await?;
//! }
//! service.close();
//! ```
//!
//! # Module Overview
//!
//! - [`transport`]: queued messenger, connectors, watchdog, byte queue
//! - [`frame`]: wire format encoding and validation
//! - [`message`]: message and file header types
//! - [`service`]: message-level send and receive
//! - [`config`]: layered TOML/env configuration loading

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod frame;
pub mod message;
pub mod service;
pub mod transport;

// Re-exports for convenience
pub use config::{
    default_config_path, load_config, load_config_from_path, ConfigError, ConfigOverrides,
    ConfigSource, D2dConfigFile, D2dToml,
};
pub use frame::{FrameError, FrameLimits};
pub use message::{D2dMessage, FileHeader, Header};
pub use service::{D2dService, ServiceError, Stage};
pub use transport::{
    ConnectionConfig, ConnectionEvent, ConnectionKind, Messenger, SocketMessenger,
    SocketMessengerFactory, StreamStatus, TlsConfig, TlsTrust, TransportError,
};
