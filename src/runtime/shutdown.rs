//! Process-wide stop signal.
//!
//! Async tasks wait on a watch channel; mio workers register a waker so a
//! blocked `poll` returns promptly when the signal fires.

use crate::runtime::pool::lock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::debug;

/// Coordinator for graceful shutdown.
///
/// Cloning is cheap; every clone observes the same signal.
#[derive(Clone)]
pub struct StopSignal {
    inner: Arc<Inner>,
}

struct Inner {
    stopped: AtomicBool,
    tx: watch::Sender<bool>,
    wakers: Mutex<Vec<Arc<mio::Waker>>>,
}

impl StopSignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                stopped: AtomicBool::new(false),
                tx,
                wakers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Fire the signal. Only the first call has any effect.
    pub fn trigger(&self) {
        if self.inner.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("Stop signal triggered");
        self.inner.tx.send_replace(true);
        for waker in lock(&self.inner.wakers).iter() {
            let _ = waker.wake();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }

    /// Wake `waker` when the signal fires.
    ///
    /// If the signal already fired the waker is woken immediately.
    pub fn register_waker(&self, waker: Arc<mio::Waker>) {
        lock(&self.inner.wakers).push(Arc::clone(&waker));
        if self.is_stopped() {
            let _ = waker.wake();
        }
    }

    /// Resolve once the signal has fired.
    pub async fn wait(&self) {
        let mut rx = self.inner.tx.subscribe();
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio_test::{assert_pending, assert_ready, task};

    #[test]
    fn test_wait_resolves_on_trigger() {
        let signal = StopSignal::new();
        let mut waiting = task::spawn(signal.wait());
        assert_pending!(waiting.poll());

        signal.trigger();
        assert!(signal.is_stopped());
        assert_ready!(waiting.poll());
    }

    #[test]
    fn test_late_waiter_sees_signal() {
        let signal = StopSignal::new();
        signal.trigger();
        signal.trigger();

        let mut waiting = task::spawn(signal.wait());
        assert_ready!(waiting.poll());
    }

    #[test]
    fn test_waker_unblocks_poll() {
        let signal = StopSignal::new();
        let mut poll = mio::Poll::new().unwrap();
        let token = mio::Token(42);
        let waker = Arc::new(mio::Waker::new(poll.registry(), token).unwrap());
        signal.register_waker(waker);

        let remote = signal.clone();
        let handle = std::thread::spawn(move || remote.trigger());

        let mut events = mio::Events::with_capacity(4);
        poll.poll(&mut events, Some(Duration::from_secs(5))).unwrap();
        assert!(events.iter().any(|event| event.token() == token));
        handle.join().unwrap();
    }
}
