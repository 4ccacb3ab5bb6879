//! Broker link state shared by publishers and consumer loops.

use std::sync::atomic::{AtomicU8, AtomicU32, Ordering};

use tokio::sync::Notify;

use crate::metrics;

/// Phase of the broker link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkPhase {
    Disconnected,
    Connecting,
    Connected,
}

impl LinkPhase {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => LinkPhase::Connecting,
            2 => LinkPhase::Connected,
            _ => LinkPhase::Disconnected,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            LinkPhase::Disconnected => 0,
            LinkPhase::Connecting => 1,
            LinkPhase::Connected => 2,
        }
    }
}

/// Tracks whether the broker link is up and serializes (re)connection.
///
/// Only one task may hold the `Connecting` phase. Everyone else waits on
/// [`LinkState::wait_settled`] and inspects the outcome afterwards.
///
/// All atomics use `SeqCst`.
#[derive(Debug)]
pub struct LinkState {
    phase: AtomicU8,
    /// Consecutive failed connection attempts since the last success
    attempts: AtomicU32,
    settled: Notify,
}

impl LinkState {
    pub fn new() -> Self {
        Self {
            phase: AtomicU8::new(LinkPhase::Disconnected.as_u8()),
            attempts: AtomicU32::new(0),
            settled: Notify::new(),
        }
    }

    pub fn phase(&self) -> LinkPhase {
        LinkPhase::from_u8(self.phase.load(Ordering::SeqCst))
    }

    pub fn is_connected(&self) -> bool {
        self.phase() == LinkPhase::Connected
    }

    /// Claim the right to connect. Returns `None` when another task already
    /// holds it or the link is up.
    ///
    /// A link that is `Connected` can be claimed only after
    /// [`LinkState::mark_disconnected`].
    pub fn begin_connecting(&self) -> Option<ConnectingGuard<'_>> {
        self.phase
            .compare_exchange(
                LinkPhase::Disconnected.as_u8(),
                LinkPhase::Connecting.as_u8(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .ok()
            .map(|_| ConnectingGuard {
                state: self,
                settled: false,
            })
    }

    /// Record that the current connection is unusable.
    pub fn mark_disconnected(&self) {
        if self
            .phase
            .compare_exchange(
                LinkPhase::Connected.as_u8(),
                LinkPhase::Disconnected.as_u8(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
        {
            metrics::set_connection_status(false);
        }
    }

    /// Wait until no connection attempt is in progress.
    ///
    /// Returns immediately when nobody is connecting.
    pub async fn wait_settled(&self) {
        // Register before checking the phase so a concurrent settle is not missed
        let notified = self.settled.notified();
        if self.phase() == LinkPhase::Connecting {
            notified.await;
        }
    }

    pub fn next_attempt(&self) -> u32 {
        self.attempts.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    fn settle(&self, connected: bool) {
        let phase = if connected {
            self.attempts.store(0, Ordering::SeqCst);
            LinkPhase::Connected
        } else {
            LinkPhase::Disconnected
        };
        self.phase.store(phase.as_u8(), Ordering::SeqCst);
        metrics::set_connection_status(connected);
        self.settled.notify_waiters();
    }
}

impl Default for LinkState {
    fn default() -> Self {
        Self::new()
    }
}

/// Exclusive right to connect, released on [`ConnectingGuard::succeeded`]
/// or on drop (which counts as a failure, e.g. when the connecting future is
/// cancelled).
#[derive(Debug)]
pub struct ConnectingGuard<'a> {
    state: &'a LinkState,
    settled: bool,
}

impl ConnectingGuard<'_> {
    pub fn succeeded(mut self) {
        self.settled = true;
        self.state.settle(true);
    }
}

impl Drop for ConnectingGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.state.settle(false);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_initial_state() {
        let state = LinkState::new();
        assert_eq!(state.phase(), LinkPhase::Disconnected);
        assert!(!state.is_connected());
        assert_eq!(state.attempts(), 0);
    }

    #[test]
    fn test_only_one_connector() {
        let state = LinkState::new();
        let guard = state.begin_connecting().expect("first claim");
        assert_eq!(state.phase(), LinkPhase::Connecting);
        assert!(state.begin_connecting().is_none());

        guard.succeeded();
        assert!(state.is_connected());
        // Connected links cannot be claimed until marked down
        assert!(state.begin_connecting().is_none());

        state.mark_disconnected();
        assert!(state.begin_connecting().is_some());
    }

    #[test]
    fn test_dropped_guard_settles_disconnected() {
        let state = LinkState::new();
        {
            let _guard = state.begin_connecting().unwrap();
        }
        assert_eq!(state.phase(), LinkPhase::Disconnected);
    }

    #[test]
    fn test_success_resets_attempts() {
        let state = LinkState::new();
        assert_eq!(state.next_attempt(), 1);
        assert_eq!(state.next_attempt(), 2);

        state.begin_connecting().unwrap().succeeded();
        assert_eq!(state.attempts(), 0);
    }

    #[tokio::test]
    async fn test_wait_settled_returns_when_idle() {
        let state = LinkState::new();
        tokio::time::timeout(Duration::from_millis(100), state.wait_settled())
            .await
            .expect("should not block when nobody is connecting");
    }

    #[tokio::test]
    async fn test_waiters_wake_on_settle() {
        let state = Arc::new(LinkState::new());
        let mut handles = Vec::new();

        // Guard must live on this task while the waiters park
        let guard = state.begin_connecting().unwrap();
        for _ in 0..5 {
            let state = state.clone();
            handles.push(tokio::spawn(async move {
                state.wait_settled().await;
                state.is_connected()
            }));
        }

        tokio::time::sleep(Duration::from_millis(20)).await;
        guard.succeeded();

        for handle in handles {
            let connected = tokio::time::timeout(Duration::from_millis(500), handle)
                .await
                .expect("waiter timed out")
                .expect("waiter panicked");
            assert!(connected);
        }
    }
}
