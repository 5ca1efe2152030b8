//! Socket Messenger
//!
//! Queued, event-driven messenger over one duplex byte stream.
//!
//! # Architecture
//!
//! ```text
//! send()    ──push──▶ send queue    ──▶ writer task ──▶ WriteHalf
//! receive() ──push──▶ receive queue ──▶ reader task ◀── ReadHalf (+ read-ahead)
//!                                            │
//!                                  EOF / error / open events
//!                                            ▼
//!                                     ConnectionEvent channel
//! ```
//!
//! Each direction has one worker task owning its stream half. A worker
//! pops exactly one request, runs its chunked transfer to completion,
//! reports the outcome, then pops the next. The two directions run
//! independently.
//!
//! The connect watchdog is armed by `open` and cancelled when the input
//! side reports open-completed.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;

use super::config::{ConnectionConfig, DEFAULT_CHUNK_SIZE, DEFAULT_WATCHDOG_INTERVAL_MS};
use super::queue::ByteQueue;
use super::request::{ReceiveRequest, SendRequest};
use super::traits::{
    BoxedStream, ConnectionEvent, Connector, Direction, Endpoint, Messenger, StreamEvent,
    StreamStatus, TransportError,
};
use super::watchdog::ConnectWatchdog;

/// Most unrequested bytes buffered while no receive is pending
const MAX_READ_AHEAD: usize = 1024 * 1024;

/// Longest wait for a graceful write-side shutdown after close
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Sender half of the application's connection event channel
pub type EventSender = mpsc::UnboundedSender<ConnectionEvent>;

/// Tunables for a [`SocketMessenger`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MessengerOptions {
    /// Connect watchdog tick interval
    pub watchdog_interval: Duration,
    /// Largest single read or write
    pub chunk_size: usize,
}

impl Default for MessengerOptions {
    fn default() -> Self {
        Self {
            watchdog_interval: Duration::from_millis(DEFAULT_WATCHDOG_INTERVAL_MS),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl MessengerOptions {
    /// Take the tunables from a connection configuration
    #[must_use]
    pub fn from_config(config: &ConnectionConfig) -> Self {
        Self {
            watchdog_interval: config.watchdog_interval(),
            chunk_size: config.chunk_size.max(1),
        }
    }
}

/// Plain TCP connector
#[derive(Clone, Copy, Debug, Default)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, endpoint: &Endpoint) -> Result<BoxedStream, TransportError> {
        let stream = connect_tcp(endpoint).await?;
        Ok(Box::new(stream))
    }

    fn name(&self) -> &'static str {
        "plain"
    }
}

/// Resolve and connect a TCP stream with Nagle disabled
pub(crate) async fn connect_tcp(endpoint: &Endpoint) -> Result<TcpStream, TransportError> {
    let stream = TcpStream::connect((endpoint.host.as_str(), endpoint.port))
        .await
        .map_err(|e| TransportError::ConnectionFailed(format!("{endpoint}: {e}")))?;

    if let Err(err) = stream.set_nodelay(true) {
        tracing::debug!(endpoint = %endpoint, error = %err, "Failed to set TCP_NODELAY");
    }
    Ok(stream)
}

/// Atomic status of one stream direction
#[derive(Debug)]
struct StatusCell {
    direction: Direction,
    value: AtomicU8,
}

impl StatusCell {
    fn new(direction: Direction) -> Self {
        Self {
            direction,
            value: AtomicU8::new(StreamStatus::NotOpen as u8),
        }
    }

    fn get(&self) -> StreamStatus {
        StreamStatus::from_u8(self.value.load(Ordering::SeqCst))
    }

    /// Unconditional set; returns true on an actual transition
    fn set(&self, to: StreamStatus) -> bool {
        let from = StreamStatus::from_u8(self.value.swap(to as u8, Ordering::SeqCst));
        self.changed(from, to)
    }

    /// Set only if currently `from`
    fn transition(&self, from: StreamStatus, to: StreamStatus) -> bool {
        let swapped = self
            .value
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        swapped && self.changed(from, to)
    }

    /// Set unless already closed; returns true on an actual transition
    fn advance(&self, to: StreamStatus) -> bool {
        let mut current = self.value.load(Ordering::SeqCst);
        loop {
            let from = StreamStatus::from_u8(current);
            if from == to || from == StreamStatus::Closed {
                return false;
            }
            match self
                .value
                .compare_exchange(current, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return self.changed(from, to),
                Err(actual) => current = actual,
            }
        }
    }

    fn changed(&self, from: StreamStatus, to: StreamStatus) -> bool {
        if from == to {
            return false;
        }
        tracing::debug!(direction = %self.direction, from = %from, to = %to, "Stream status changed");
        true
    }
}

/// State shared between the messenger handle and its tasks
struct Shared {
    endpoint: Endpoint,
    connector: Arc<dyn Connector>,
    options: MessengerOptions,
    input: StatusCell,
    output: StatusCell,
    send_queue: ByteQueue<SendRequest>,
    receive_queue: ByteQueue<ReceiveRequest>,
    send_ready: Notify,
    receive_ready: Notify,
    watchdog: ConnectWatchdog,
    /// Shutdown token of the current connection attempt
    session: Mutex<Option<CancellationToken>>,
    events: Option<EventSender>,
}

impl Shared {
    fn status(&self, direction: Direction) -> &StatusCell {
        match direction {
            Direction::Input => &self.input,
            Direction::Output => &self.output,
        }
    }

    fn emit(&self, event: ConnectionEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }

    fn handle_event(&self, direction: Direction, event: StreamEvent) {
        let status = self.status(direction);
        match event {
            StreamEvent::OpenCompleted => {
                if status.transition(StreamStatus::Opening, StreamStatus::Open)
                    && direction == Direction::Input
                {
                    self.watchdog.cancel();
                    tracing::info!(endpoint = %self.endpoint, "Connection opened");
                    self.emit(ConnectionEvent::Opened);
                }
            }
            StreamEvent::HasBytesAvailable => {
                tracing::trace!(endpoint = %self.endpoint, "Bytes available");
            }
            StreamEvent::HasSpaceAvailable => self.send_ready.notify_one(),
            StreamEvent::ErrorOccurred => {
                tracing::warn!(endpoint = %self.endpoint, direction = %direction, "Stream error");
                status.advance(StreamStatus::Errored);
            }
            StreamEvent::EndEncountered => {
                if status.advance(StreamStatus::Closed) && direction == Direction::Output {
                    tracing::info!(endpoint = %self.endpoint, "Peer closed the connection");
                    if let Some(session) = self.session.lock().as_ref() {
                        session.cancel();
                    }
                    self.emit(ConnectionEvent::Closed);
                    self.dispose();
                }
            }
        }
    }

    /// Peer sent EOF while unread bytes are still buffered
    ///
    /// Ends the output side only; the input side stays readable until the
    /// buffered bytes are consumed.
    fn peer_finished(&self) {
        if !self.output.advance(StreamStatus::Closed) {
            return;
        }
        tracing::info!(endpoint = %self.endpoint, "Peer closed the connection");
        self.emit(ConnectionEvent::Closed);
        for request in self.send_queue.pop_all() {
            request.complete(Err(TransportError::ConnectionClosed));
        }
        self.send_ready.notify_one();
    }

    /// Fail every queued request, oldest first
    fn dispose(&self) {
        let sends = self.send_queue.pop_all();
        let receives = self.receive_queue.pop_all();
        if !sends.is_empty() || !receives.is_empty() {
            tracing::debug!(
                sends = sends.len(),
                receives = receives.len(),
                "Failing pending requests"
            );
        }
        for request in sends {
            request.complete(Err(TransportError::ConnectionClosed));
        }
        for request in receives {
            request.complete(Err(TransportError::ConnectionClosed));
        }
    }

    fn close(&self) {
        let session = self.session.lock().take();
        let was_open = session.is_some();
        if let Some(token) = session {
            token.cancel();
        }
        self.watchdog.cancel();
        self.input.set(StreamStatus::Closed);
        self.output.set(StreamStatus::Closed);
        self.dispose();

        if was_open {
            tracing::info!(endpoint = %self.endpoint, "Connection closed");
        }
    }
}

/// Messenger over a TCP (or any [`Connector`]-provided) byte stream
///
/// Dropping the messenger closes it.
pub struct SocketMessenger {
    shared: Arc<Shared>,
}

impl SocketMessenger {
    /// Create a plain TCP messenger
    pub fn new(endpoint: Endpoint, events: Option<EventSender>) -> Self {
        Self::with_connector(
            endpoint,
            Arc::new(TcpConnector),
            MessengerOptions::default(),
            events,
        )
    }

    /// Create a messenger over a custom connector
    pub fn with_connector(
        endpoint: Endpoint,
        connector: Arc<dyn Connector>,
        options: MessengerOptions,
        events: Option<EventSender>,
    ) -> Self {
        let options = MessengerOptions {
            chunk_size: options.chunk_size.max(1),
            ..options
        };
        Self {
            shared: Arc::new(Shared {
                endpoint,
                connector,
                options,
                input: StatusCell::new(Direction::Input),
                output: StatusCell::new(Direction::Output),
                send_queue: ByteQueue::new(),
                receive_queue: ByteQueue::new(),
                send_ready: Notify::new(),
                receive_ready: Notify::new(),
                watchdog: ConnectWatchdog::new(options.watchdog_interval),
                session: Mutex::new(None),
                events,
            }),
        }
    }

    /// Remote endpoint
    pub fn endpoint(&self) -> &Endpoint {
        &self.shared.endpoint
    }

    /// Name of the connector in use
    pub fn connector_name(&self) -> &'static str {
        self.shared.connector.name()
    }

    /// Send requests waiting to be written
    pub fn pending_sends(&self) -> usize {
        self.shared.send_queue.len()
    }

    /// Receive requests waiting to be read
    pub fn pending_receives(&self) -> usize {
        self.shared.receive_queue.len()
    }
}

impl std::fmt::Debug for SocketMessenger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketMessenger")
            .field("endpoint", &self.shared.endpoint)
            .field("connector", &self.shared.connector.name())
            .field("input", &self.shared.input.get())
            .field("output", &self.shared.output.get())
            .finish()
    }
}

impl Messenger for SocketMessenger {
    fn open(&self) -> Result<(), TransportError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| TransportError::InvalidState("open requires a tokio runtime".into()))?;

        let shutdown = {
            let mut session = self.shared.session.lock();
            if session.is_some() {
                return Err(TransportError::InvalidState("already open".into()));
            }
            let token = CancellationToken::new();
            *session = Some(token.clone());
            token
        };

        tracing::info!(
            endpoint = %self.shared.endpoint,
            connector = self.shared.connector.name(),
            "Opening connection"
        );
        self.shared.input.set(StreamStatus::Opening);
        self.shared.output.set(StreamStatus::Opening);

        let probe = Arc::downgrade(&self.shared);
        let target = Weak::clone(&probe);
        self.shared.watchdog.start(
            move || {
                probe.upgrade().map_or(true, |shared| {
                    shared.input.get() == StreamStatus::Open
                        && shared.output.get() == StreamStatus::Open
                })
            },
            move || {
                if let Some(shared) = target.upgrade() {
                    shared.emit(ConnectionEvent::ConnectFailed);
                    shared.close();
                }
            },
        );

        runtime.spawn(run_connection(Arc::clone(&self.shared), shutdown));
        Ok(())
    }

    fn send(&self, request: SendRequest) {
        let shared = &self.shared;
        if shared.output.get().is_terminal() {
            request.complete(Err(TransportError::ConnectionClosed));
            return;
        }
        shared.send_queue.push(request);
        shared.send_ready.notify_one();

        // A close may have drained the queue between the check and the push
        if shared.output.get().is_terminal() {
            shared.dispose();
        }
    }

    fn receive(&self, request: ReceiveRequest) {
        let shared = &self.shared;
        if shared.input.get().is_terminal() {
            request.complete(Err(TransportError::ConnectionClosed));
            return;
        }
        shared.receive_queue.push(request);
        shared.receive_ready.notify_one();

        if shared.input.get().is_terminal() {
            shared.dispose();
        }
    }

    fn close(&self) {
        self.shared.close();
    }

    fn invalidate_timer(&self) {
        self.shared.watchdog.cancel();
    }

    fn input_status(&self) -> StreamStatus {
        self.shared.input.get()
    }

    fn output_status(&self) -> StreamStatus {
        self.shared.output.get()
    }
}

impl Drop for SocketMessenger {
    fn drop(&mut self) {
        self.shared.close();
    }
}

// ============================================================================
// Worker tasks
// ============================================================================

async fn run_connection(shared: Arc<Shared>, shutdown: CancellationToken) {
    let connected = tokio::select! {
        _ = shutdown.cancelled() => return,
        result = shared.connector.connect(&shared.endpoint) => result,
    };

    let stream = match connected {
        Ok(stream) => stream,
        Err(err) => {
            tracing::warn!(endpoint = %shared.endpoint, error = %err, "Connect failed");
            shared.handle_event(Direction::Input, StreamEvent::ErrorOccurred);
            shared.handle_event(Direction::Output, StreamEvent::ErrorOccurred);
            return;
        }
    };
    if shutdown.is_cancelled() {
        return;
    }

    let (reader, writer) = tokio::io::split(stream);
    shared.handle_event(Direction::Output, StreamEvent::OpenCompleted);
    shared.handle_event(Direction::Input, StreamEvent::OpenCompleted);

    tokio::spawn(read_loop(Arc::clone(&shared), reader, shutdown.clone()));
    tokio::spawn(write_loop(shared, writer, shutdown));
}

fn end_of_stream(shared: &Shared) {
    shared.handle_event(Direction::Input, StreamEvent::EndEncountered);
    shared.handle_event(Direction::Output, StreamEvent::EndEncountered);
}

async fn read_loop(
    shared: Arc<Shared>,
    mut reader: ReadHalf<BoxedStream>,
    shutdown: CancellationToken,
) {
    // Bytes the peer sent before anyone asked for them
    let mut ahead = BytesMut::new();

    loop {
        if shared.input.get() != StreamStatus::Open {
            return;
        }

        if let Some(request) = shared.receive_queue.pop() {
            let eof = read_one(&shared, &mut reader, &mut ahead, request, &shutdown).await;
            if eof {
                end_of_stream(&shared);
                return;
            }
            continue;
        }

        // Idle: wait for a request while still watching for the peer going away
        if ahead.len() >= MAX_READ_AHEAD {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = shared.receive_ready.notified() => {}
            }
            continue;
        }

        let chunk = shared.options.chunk_size.min(MAX_READ_AHEAD - ahead.len());
        ahead.reserve(chunk);
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = shared.receive_ready.notified() => {}
            read = reader.read_buf(&mut ahead) => match read {
                Ok(0) if ahead.is_empty() => {
                    end_of_stream(&shared);
                    return;
                }
                Ok(0) => {
                    shared.peer_finished();
                    drain_read_ahead(&shared, &mut reader, &mut ahead, &shutdown).await;
                    end_of_stream(&shared);
                    shared.dispose();
                    return;
                }
                Ok(n) => {
                    tracing::trace!(bytes = n, buffered = ahead.len(), "Read ahead");
                    shared.handle_event(Direction::Input, StreamEvent::HasBytesAvailable);
                }
                Err(err) if ahead.is_empty() => {
                    tracing::warn!(error = %err, "Read readiness failed");
                    shared.handle_event(Direction::Input, StreamEvent::ErrorOccurred);
                    return;
                }
                Err(err) => {
                    tracing::warn!(
                        error = %err,
                        buffered = ahead.len(),
                        "Read failed with bytes buffered"
                    );
                    shared.peer_finished();
                    drain_read_ahead(&shared, &mut reader, &mut ahead, &shutdown).await;
                    shared.handle_event(Direction::Input, StreamEvent::ErrorOccurred);
                    shared.dispose();
                    return;
                }
            },
        }
    }
}

/// Serve buffered bytes after the peer finished sending
async fn drain_read_ahead(
    shared: &Shared,
    reader: &mut ReadHalf<BoxedStream>,
    ahead: &mut BytesMut,
    shutdown: &CancellationToken,
) {
    while !ahead.is_empty() && shared.input.get() == StreamStatus::Open {
        match shared.receive_queue.pop() {
            Some(request) => {
                if read_one(shared, reader, ahead, request, shutdown).await {
                    return;
                }
            }
            None => tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = shared.receive_ready.notified() => {}
            },
        }
    }
}

/// Run one receive request; returns true if the stream ended
async fn read_one(
    shared: &Shared,
    reader: &mut ReadHalf<BoxedStream>,
    ahead: &mut BytesMut,
    request: ReceiveRequest,
    shutdown: &CancellationToken,
) -> bool {
    let size = request.size();
    let chunk = shared.options.chunk_size;
    let mut buf = vec![0u8; size];
    let mut eof = false;

    let mut filled = ahead.len().min(size);
    buf[..filled].copy_from_slice(&ahead[..filled]);
    ahead.advance(filled);

    let outcome = loop {
        if filled == size {
            break Ok(());
        }
        if shared.input.get() != StreamStatus::Open {
            break Err(TransportError::ConnectionClosed);
        }

        let end = (filled + chunk).min(size);
        let read = tokio::select! {
            _ = shutdown.cancelled() => break Err(TransportError::ConnectionClosed),
            read = reader.read(&mut buf[filled..end]) => read,
        };
        match read {
            Ok(0) => {
                eof = true;
                break Ok(());
            }
            Ok(n) => {
                filled += n;
                tracing::trace!(bytes = n, filled, size, "Read chunk");
            }
            Err(err) => break Err(TransportError::ReceiveFailed(err.to_string())),
        }
    };

    match outcome {
        Ok(()) => {
            if filled < size {
                tracing::debug!(filled, size, "Stream ended before receive completed");
            }
            buf.truncate(filled);
            request.complete(Ok(Bytes::from(buf)));
        }
        Err(err) => {
            if matches!(err, TransportError::ReceiveFailed(_)) {
                shared.handle_event(Direction::Input, StreamEvent::ErrorOccurred);
            }
            request.complete(Err(err));
        }
    }
    eof
}

async fn write_loop(
    shared: Arc<Shared>,
    mut writer: WriteHalf<BoxedStream>,
    shutdown: CancellationToken,
) {
    shared.handle_event(Direction::Output, StreamEvent::HasSpaceAvailable);

    loop {
        if shared.output.get() != StreamStatus::Open {
            break;
        }

        match shared.send_queue.pop() {
            Some(request) => write_one(&shared, &mut writer, request, &shutdown).await,
            None => tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = shared.send_ready.notified() => {}
            },
        }
    }

    // TLS close_notify, then FIN
    match tokio::time::timeout(SHUTDOWN_GRACE, writer.shutdown()).await {
        Ok(Ok(())) => tracing::debug!(endpoint = %shared.endpoint, "Write side shut down"),
        Ok(Err(err)) => {
            tracing::debug!(endpoint = %shared.endpoint, error = %err, "Write shutdown failed");
        }
        Err(_) => tracing::debug!(endpoint = %shared.endpoint, "Write shutdown timed out"),
    }
}

async fn write_one(
    shared: &Shared,
    writer: &mut WriteHalf<BoxedStream>,
    request: SendRequest,
    shutdown: &CancellationToken,
) {
    let value = request.value().clone();
    let chunk = shared.options.chunk_size;

    let outcome: Result<(), TransportError> = async {
        let mut written = 0;
        while written < value.len() {
            if shared.output.get() != StreamStatus::Open {
                return Err(TransportError::ConnectionClosed);
            }
            let end = (written + chunk).min(value.len());
            let n = tokio::select! {
                _ = shutdown.cancelled() => return Err(TransportError::ConnectionClosed),
                n = writer.write(&value[written..end]) => n?,
            };
            if n == 0 {
                return Err(TransportError::SendFailed(format!(
                    "wrote 0 of {} remaining bytes",
                    value.len() - written
                )));
            }
            written += n;
            tracing::trace!(bytes = n, written, total = value.len(), "Wrote chunk");
        }
        tokio::select! {
            _ = shutdown.cancelled() => Err(TransportError::ConnectionClosed),
            flushed = writer.flush() => flushed.map_err(TransportError::from),
        }
    }
    .await;

    if let Err(err) = &outcome {
        if !matches!(err, TransportError::ConnectionClosed) {
            shared.handle_event(Direction::Output, StreamEvent::ErrorOccurred);
        }
    }
    request.complete(outcome);
}
