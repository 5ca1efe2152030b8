//! Connect Watchdog
//!
//! A repeating timer armed by `open`. On each tick, if the connection has
//! not reached the open state, the watchdog fires once: it reports the
//! failure and force-closes the transport. Observing the open state
//! cancels it.
//!
//! # Usage
//!
//! ```ignore
//! let watchdog = ConnectWatchdog::new(Duration::from_secs(1));
//! watchdog.start(move || is_open(), move || {
//!     notify_connect_failed();
//!     close();
//! });
//!
//! // When the input stream reports open-completed
//! watchdog.cancel();
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Timer that fails a connection attempt that never opens
#[derive(Debug)]
pub struct ConnectWatchdog {
    interval: Duration,
    /// True while a started watchdog may still fire
    armed: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectWatchdog {
    /// Create a watchdog with the given tick interval
    #[must_use]
    pub fn new(interval: Duration) -> Self {
        Self {
            interval: interval.max(Duration::from_millis(1)),
            armed: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
        }
    }

    /// Tick interval
    #[must_use]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Arm the watchdog
    ///
    /// `is_open` is polled on every tick; `on_timeout` runs at most once.
    /// Restarting replaces any previous timer. Must be called from within
    /// a tokio runtime.
    pub fn start<P, F>(&self, is_open: P, on_timeout: F)
    where
        P: Fn() -> bool + Send + 'static,
        F: FnOnce() + Send + 'static,
    {
        self.cancel();
        self.armed.store(true, Ordering::SeqCst);

        let armed = Arc::clone(&self.armed);
        let period = self.interval;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;

                if !armed.load(Ordering::SeqCst) {
                    return;
                }
                if is_open() {
                    continue;
                }
                if armed.swap(false, Ordering::SeqCst) {
                    tracing::warn!(
                        interval_ms = period.as_millis(),
                        "Connection did not open before the watchdog fired"
                    );
                    on_timeout();
                }
                return;
            }
        });

        *self.handle.lock() = Some(task);
    }

    /// Disarm the watchdog
    ///
    /// Returns true if this call disarmed a running watchdog; cancelling an
    /// already-cancelled or already-fired watchdog is a no-op.
    pub fn cancel(&self) -> bool {
        let was_armed = self.armed.swap(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.lock().take() {
            handle.abort();
        }
        if was_armed {
            tracing::debug!("Connect watchdog cancelled");
        }
        was_armed
    }

    /// Check if the watchdog may still fire
    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::SeqCst)
    }
}

impl Drop for ConnectWatchdog {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.get_mut().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter() -> (Arc<AtomicUsize>, impl FnOnce() + Send + 'static) {
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = Arc::clone(&fired);
        (fired, move || {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_once_when_never_open() {
        let watchdog = ConnectWatchdog::new(Duration::from_secs(1));
        let (fired, on_timeout) = counter();

        watchdog.start(|| false, on_timeout);
        assert!(watchdog.is_armed());

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!watchdog.is_armed());

        // Cancelling after firing is a no-op
        assert!(!watchdog.cancel());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_before_tick() {
        let watchdog = ConnectWatchdog::new(Duration::from_secs(1));
        let (fired, on_timeout) = counter();

        watchdog.start(|| false, on_timeout);
        assert!(watchdog.cancel());
        assert!(!watchdog.cancel());

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_connection_never_fires() {
        let watchdog = ConnectWatchdog::new(Duration::from_secs(1));
        let (fired, on_timeout) = counter();

        watchdog.start(|| true, on_timeout);
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(watchdog.is_armed());
        assert!(watchdog.cancel());
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_replaces_previous_timer() {
        let watchdog = ConnectWatchdog::new(Duration::from_secs(1));
        let (first, first_timeout) = counter();
        let (second, second_timeout) = counter();

        watchdog.start(|| false, first_timeout);
        watchdog.start(|| false, second_timeout);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }
}
