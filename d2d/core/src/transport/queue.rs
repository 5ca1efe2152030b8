//! Byte Queue
//!
//! Thread-safe FIFO of pending send or receive requests. Every operation
//! runs under one exclusive lock, so no caller observes a partial
//! mutation. Order is guaranteed within one queue only.

use std::collections::VecDeque;

use parking_lot::Mutex;

/// Mutex-guarded FIFO queue
#[derive(Debug)]
pub struct ByteQueue<T> {
    elements: Mutex<VecDeque<T>>,
}

impl<T> Default for ByteQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ByteQueue<T> {
    /// Create an empty queue
    #[must_use]
    pub fn new() -> Self {
        Self {
            elements: Mutex::new(VecDeque::new()),
        }
    }

    /// Append to the tail
    pub fn push(&self, element: T) {
        self.elements.lock().push_back(element);
    }

    /// Remove and return the head, or `None` if empty
    pub fn pop(&self) -> Option<T> {
        self.elements.lock().pop_front()
    }

    /// Atomically remove everything, head first
    pub fn pop_all(&self) -> Vec<T> {
        self.elements.lock().drain(..).collect()
    }

    /// Number of queued elements
    pub fn len(&self) -> usize {
        self.elements.lock().len()
    }

    /// Check if the queue is empty
    pub fn is_empty(&self) -> bool {
        self.elements.lock().is_empty()
    }
}
