//! Send and receive requests queued on a messenger.
//!
//! Each request carries its completion. A request is dequeued exactly once
//! and its completion runs exactly once, either from the worker that
//! drained it or from the teardown path that failed it.

use std::fmt;

use bytes::Bytes;
use tokio::sync::oneshot;

use super::traits::TransportError;

/// Outcome of a send request
pub type SendOutcome = Result<(), TransportError>;

/// Outcome of a receive request
///
/// `Ok` may carry fewer bytes than requested if the peer closed the stream
/// mid-read; callers must validate the length.
pub type ReceiveOutcome = Result<Bytes, TransportError>;

type Completion<T> = Box<dyn FnOnce(T) + Send + 'static>;

/// A value that can be written to the wire
pub trait MessageValue {
    /// Convert into the bytes that go on the wire
    fn into_buffer(self) -> Bytes;
}

impl MessageValue for Bytes {
    fn into_buffer(self) -> Bytes {
        self
    }
}

impl MessageValue for Vec<u8> {
    fn into_buffer(self) -> Bytes {
        Bytes::from(self)
    }
}

impl MessageValue for &[u8] {
    fn into_buffer(self) -> Bytes {
        Bytes::copy_from_slice(self)
    }
}

impl MessageValue for String {
    fn into_buffer(self) -> Bytes {
        Bytes::from(self)
    }
}

impl MessageValue for &str {
    fn into_buffer(self) -> Bytes {
        Bytes::copy_from_slice(self.as_bytes())
    }
}

/// Network byte order
impl MessageValue for i32 {
    fn into_buffer(self) -> Bytes {
        Bytes::copy_from_slice(&self.to_be_bytes())
    }
}

/// A queued write of one value
pub struct SendRequest {
    value: Bytes,
    completion: Option<Completion<SendOutcome>>,
}

impl SendRequest {
    /// Create a request without a completion
    pub fn new(value: impl MessageValue) -> Self {
        Self {
            value: value.into_buffer(),
            completion: None,
        }
    }

    /// Create a request whose completion runs a callback
    pub fn with_completion<F>(value: impl MessageValue, completion: F) -> Self
    where
        F: FnOnce(SendOutcome) + Send + 'static,
    {
        Self {
            value: value.into_buffer(),
            completion: Some(Box::new(completion)),
        }
    }

    /// Create a request whose outcome is delivered on a oneshot channel
    pub fn channel(value: impl MessageValue) -> (Self, oneshot::Receiver<SendOutcome>) {
        let (tx, rx) = oneshot::channel();
        let request = Self::with_completion(value, move |outcome| {
            let _ = tx.send(outcome);
        });
        (request, rx)
    }

    /// Bytes to write
    #[must_use]
    pub fn value(&self) -> &Bytes {
        &self.value
    }

    /// Number of bytes to write
    #[must_use]
    pub fn len(&self) -> usize {
        self.value.len()
    }

    /// Check if there is nothing to write
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }

    pub(crate) fn complete(self, outcome: SendOutcome) {
        if let Some(completion) = self.completion {
            completion(outcome);
        }
    }
}

impl fmt::Debug for SendRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SendRequest")
            .field("len", &self.value.len())
            .field("has_completion", &self.completion.is_some())
            .finish()
    }
}

/// A queued read of a fixed number of bytes
pub struct ReceiveRequest {
    size: usize,
    completion: Completion<ReceiveOutcome>,
}

impl ReceiveRequest {
    /// Create a request whose completion runs a callback
    pub fn new<F>(size: usize, completion: F) -> Self
    where
        F: FnOnce(ReceiveOutcome) + Send + 'static,
    {
        Self {
            size,
            completion: Box::new(completion),
        }
    }

    /// Create a request whose outcome is delivered on a oneshot channel
    pub fn channel(size: usize) -> (Self, oneshot::Receiver<ReceiveOutcome>) {
        let (tx, rx) = oneshot::channel();
        let request = Self::new(size, move |outcome| {
            let _ = tx.send(outcome);
        });
        (request, rx)
    }

    /// Number of bytes requested
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    pub(crate) fn complete(self, outcome: ReceiveOutcome) {
        (self.completion)(outcome);
    }
}

impl fmt::Debug for ReceiveRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReceiveRequest")
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}
