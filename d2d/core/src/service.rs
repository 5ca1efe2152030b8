//! Framed Message Service
//!
//! Message-level send and receive on top of a [`Messenger`]. A message goes
//! out as three queued writes (length prefix, header, body) and comes back
//! as three chained reads.
//!
//! Whole messages are serialized per direction: concurrent `send` calls
//! never interleave their parts on the wire, and concurrent `receive` calls
//! each take one complete frame in call order.

use std::fmt;

use bytes::Bytes;
use futures::future::try_join_all;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};

use crate::frame::{self, FrameError, FrameLimits, LENGTH_PREFIX_SIZE};
use crate::message::{D2dMessage, FileHeader};
use crate::transport::{
    ConnectionConfig, ConnectionEvent, Messenger, MessageValue, ReceiveRequest, SendRequest,
    SocketMessengerFactory, TransportError,
};

/// Part of a frame being transferred
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    /// Four-byte header length
    HeaderSize,
    /// JSON header
    Header,
    /// Body bytes
    Body,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HeaderSize => write!(f, "headerSize"),
            Self::Header => write!(f, "header"),
            Self::Body => write!(f, "body"),
        }
    }
}

/// Errors from message-level operations
#[derive(Debug, Error)]
pub enum ServiceError {
    /// A part of an outgoing message could not be written
    #[error("socket {stage} write failed")]
    Send {
        /// Failing part
        stage: Stage,
        /// Transport cause
        #[source]
        source: TransportError,
    },

    /// A part of an incoming message could not be read
    #[error("socket {stage} read failed")]
    Receive {
        /// Failing part
        stage: Stage,
        /// Transport cause
        #[source]
        source: TransportError,
    },

    /// The frame could not be built or parsed
    #[error("framing failed")]
    Frame(#[from] FrameError),

    /// A received message is not a valid file message
    #[error("invalid file message: {0}")]
    InvalidFile(String),

    /// Opening or creating the transport failed
    #[error("transport failed")]
    Transport(#[from] TransportError),
}

impl ServiceError {
    /// Innermost error of the cause chain
    pub fn root_cause(&self) -> &(dyn std::error::Error + 'static) {
        let mut current: &(dyn std::error::Error + 'static) = self;
        while let Some(source) = current.source() {
            current = source;
        }
        current
    }

    /// Failing frame part, if the failure happened on the wire
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Self::Send { stage, .. } | Self::Receive { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}

/// Sends and receives framed D2D messages for one peer
pub struct D2dService {
    messenger: Box<dyn Messenger>,
    config: ConnectionConfig,
    limits: FrameLimits,
    send_lock: Mutex<()>,
    receive_lock: Mutex<()>,
}

impl D2dService {
    /// Create a service and its transport
    ///
    /// Returns the receiving end of the connection event channel.
    pub fn new(
        config: ConnectionConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ConnectionEvent>), ServiceError> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let messenger = SocketMessengerFactory::create(&config, Some(events_tx))?;
        Ok((Self::with_messenger(config, messenger), events_rx))
    }

    /// Create a service over an existing messenger
    pub fn with_messenger(config: ConnectionConfig, messenger: Box<dyn Messenger>) -> Self {
        let limits = config.frame_limits();
        Self {
            messenger,
            config,
            limits,
            send_lock: Mutex::new(()),
            receive_lock: Mutex::new(()),
        }
    }

    /// Connection configuration
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Underlying messenger
    pub fn messenger(&self) -> &dyn Messenger {
        self.messenger.as_ref()
    }

    /// Check if the transport is open in both directions
    pub fn is_open(&self) -> bool {
        self.messenger.is_open()
    }

    /// Start connecting; completion arrives as [`ConnectionEvent::Opened`]
    pub fn open(&self) -> Result<(), ServiceError> {
        self.messenger.open()?;
        Ok(())
    }

    /// Send one message
    ///
    /// Injects `secKey` and fills in a missing or empty `fileLength`, then
    /// writes the three parts in order, each awaited before the next. The
    /// first failing part aborts the rest.
    ///
    /// Dropping the future before it completes closes the connection, since
    /// the peer would otherwise see a partial frame.
    pub async fn send(&self, message: D2dMessage) -> Result<(), ServiceError> {
        let _guard = self.send_lock.lock().await;
        let abandon = AbandonGuard::arm(self, "send");
        let result = self.send_frame(message).await;
        abandon.disarm();
        result
    }

    /// Receive one message
    ///
    /// Fails without delivering anything on an invalid length prefix, a
    /// malformed header, a missing or non-positive `fileLength`, or a frame
    /// cut short by the peer.
    ///
    /// Dropping the future before it completes closes the connection, since
    /// the rest of the frame could no longer be told apart from the next.
    pub async fn receive(&self) -> Result<D2dMessage, ServiceError> {
        let _guard = self.receive_lock.lock().await;
        let abandon = AbandonGuard::arm(self, "receive");
        let result = self.receive_frame().await;
        abandon.disarm();
        result
    }

    /// Receive `count` messages
    ///
    /// Completes when all arrive or on the first failure. A failure drops
    /// the receives still pending.
    pub async fn receive_many(&self, count: usize) -> Result<Vec<D2dMessage>, ServiceError> {
        try_join_all((0..count).map(|_| self.receive())).await
    }

    /// Receive `count` file messages and parse their [`FileHeader`]s
    pub async fn receive_files(
        &self,
        count: usize,
    ) -> Result<Vec<(FileHeader, Bytes)>, ServiceError> {
        self.receive_many(count)
            .await?
            .into_iter()
            .map(|message| {
                let (header, body) = message.into_parts();
                if body.is_empty() {
                    return Err(ServiceError::InvalidFile("empty body".into()));
                }
                let file = FileHeader::from_map(&header).map_err(ServiceError::InvalidFile)?;
                Ok((file, body))
            })
            .collect()
    }

    /// Close the transport and cancel the connect watchdog
    pub fn close(&self) {
        self.messenger.close();
        self.messenger.invalidate_timer();
    }

    async fn send_frame(&self, mut message: D2dMessage) -> Result<(), ServiceError> {
        message.prepare_for_send(&self.config.sec_key);
        let header = frame::encode_header(message.header())?;
        let prefix = frame::encode_length_prefix(header.len())?;

        tracing::debug!(
            file_name = message.header_value("fileName").unwrap_or_default(),
            header_bytes = header.len(),
            body_bytes = message.body_len(),
            "Sending message"
        );

        self.send_part(Stage::HeaderSize, prefix).await?;
        self.send_part(Stage::Header, header).await?;
        self.send_part(Stage::Body, message.body().clone()).await?;

        tracing::debug!(
            file_name = message.header_value("fileName").unwrap_or_default(),
            "Message sent"
        );
        Ok(())
    }

    async fn receive_frame(&self) -> Result<D2dMessage, ServiceError> {
        let prefix = self.receive_part(Stage::HeaderSize, LENGTH_PREFIX_SIZE).await?;
        let header_len = frame::decode_length_prefix(&prefix, &self.limits)?;

        let header_bytes = self.receive_part(Stage::Header, header_len).await?;
        if header_bytes.len() < header_len {
            return Err(FrameError::ShortHeader {
                expected: header_len,
                actual: header_bytes.len(),
            }
            .into());
        }
        let header = frame::decode_header(&header_bytes)?;
        let body_len = frame::file_length(&header, &self.limits)?;

        let body = self.receive_part(Stage::Body, body_len).await?;
        if body.len() < body_len {
            return Err(FrameError::ShortBody {
                expected: body_len,
                actual: body.len(),
            }
            .into());
        }

        tracing::debug!(
            file_name = header.get("fileName").map(String::as_str).unwrap_or_default(),
            body_bytes = body.len(),
            "Message received"
        );
        Ok(D2dMessage::new(header, body))
    }

    async fn send_part(&self, stage: Stage, value: impl MessageValue) -> Result<(), ServiceError> {
        let (request, done) = SendRequest::channel(value);
        self.messenger.send(request);

        let outcome = done.await.unwrap_or(Err(TransportError::ConnectionClosed));
        outcome.map_err(|source| {
            tracing::warn!(stage = %stage, error = %source, "Send failed");
            ServiceError::Send { stage, source }
        })
    }

    async fn receive_part(&self, stage: Stage, size: usize) -> Result<Bytes, ServiceError> {
        let (request, done) = ReceiveRequest::channel(size);
        self.messenger.receive(request);

        let outcome = done.await.unwrap_or(Err(TransportError::ConnectionClosed));
        outcome.map_err(|source| {
            tracing::warn!(stage = %stage, error = %source, "Receive failed");
            ServiceError::Receive { stage, source }
        })
    }
}

/// Closes the messenger if a message operation is dropped midway
struct AbandonGuard<'a> {
    service: &'a D2dService,
    operation: &'static str,
    armed: bool,
}

impl<'a> AbandonGuard<'a> {
    fn arm(service: &'a D2dService, operation: &'static str) -> Self {
        Self {
            service,
            operation,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for AbandonGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            tracing::warn!(
                operation = self.operation,
                "Message abandoned mid-frame, closing connection"
            );
            self.service.close();
        }
    }
}

impl fmt::Debug for D2dService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("D2dService")
            .field("host", &self.config.host)
            .field("port", &self.config.port)
            .field("secured", &self.config.secured)
            .finish_non_exhaustive()
    }
}

impl Drop for D2dService {
    fn drop(&mut self) {
        self.close();
    }
}
