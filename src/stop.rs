//! Shared set-once stop signal.
//!
//! [`StopSignal`] is the only cancellation primitive of a transfer. It is
//! handed to the relay, the reader, the writer and the driver at construction.
//! The first party to set it records *why* the run is ending; every later
//! `set` is a no-op. Pollers read a single atomic, async waiters are woken
//! through a [`Notify`].

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

/// Why a transfer stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The reader ran out of source bytes.
    Exhausted,
    /// The relay's wall-clock ceiling elapsed.
    Ceiling,
    /// Someone asked for shutdown (Ctrl-C, relay teardown).
    Shutdown,
    /// The relay could not accept or forward.
    RelayFailed,
}

impl StopReason {
    fn to_raw(self) -> u8 {
        match self {
            Self::Exhausted => 1,
            Self::Ceiling => 2,
            Self::Shutdown => 3,
            Self::RelayFailed => 4,
        }
    }

    fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(Self::Exhausted),
            2 => Some(Self::Ceiling),
            3 => Some(Self::Shutdown),
            4 => Some(Self::RelayFailed),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Exhausted => "exhausted",
            Self::Ceiling => "ceiling",
            Self::Shutdown => "shutdown",
            Self::RelayFailed => "relay_failed",
        }
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

struct StopState {
    /// 0 while unset, otherwise the raw [`StopReason`] of the first setter.
    reason: AtomicU8,
    notify: Notify,
}

/// Cloneable handle to a shared set-once stop flag.
#[derive(Clone)]
pub struct StopSignal {
    inner: Arc<StopState>,
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl StopSignal {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(StopState {
                reason: AtomicU8::new(0),
                notify: Notify::new(),
            }),
        }
    }

    /// Set the flag. Returns `true` only for the call that actually set it.
    pub fn set(&self, reason: StopReason) -> bool {
        let won = self
            .inner
            .reason
            .compare_exchange(0, reason.to_raw(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if won {
            self.inner.notify.notify_waiters();
        }
        won
    }

    pub fn is_set(&self) -> bool {
        self.inner.reason.load(Ordering::Acquire) != 0
    }

    /// Reason recorded by the first setter, if any.
    pub fn reason(&self) -> Option<StopReason> {
        StopReason::from_raw(self.inner.reason.load(Ordering::Acquire))
    }

    /// Wait until the flag is set. Returns immediately if it already is.
    pub async fn stopped(&self) -> StopReason {
        loop {
            // Registered on creation, so a `set` between the check and the
            // await still wakes us.
            let notified = self.inner.notify.notified();
            if let Some(reason) = self.reason() {
                return reason;
            }
            notified.await;
        }
    }
}

impl fmt::Debug for StopSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StopSignal")
            .field("reason", &self.reason())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_unset_by_default() {
        let stop = StopSignal::new();
        assert!(!stop.is_set());
        assert_eq!(stop.reason(), None);
    }

    #[test]
    fn test_first_setter_wins() {
        let stop = StopSignal::new();
        assert!(stop.set(StopReason::Ceiling));
        assert!(!stop.set(StopReason::Exhausted));
        assert!(stop.is_set());
        assert_eq!(stop.reason(), Some(StopReason::Ceiling));
    }

    #[test]
    fn test_clones_share_state() {
        let stop = StopSignal::new();
        let other = stop.clone();
        other.set(StopReason::Shutdown);
        assert_eq!(stop.reason(), Some(StopReason::Shutdown));
    }

    #[tokio::test]
    async fn test_stopped_wakes_waiter() {
        let stop = StopSignal::new();
        let waiter = {
            let stop = stop.clone();
            tokio::spawn(async move { stop.stopped().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        stop.set(StopReason::Exhausted);
        let reason = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .expect("waiter not woken")
            .unwrap();
        assert_eq!(reason, StopReason::Exhausted);
    }

    #[tokio::test]
    async fn test_stopped_returns_when_already_set() {
        let stop = StopSignal::new();
        stop.set(StopReason::RelayFailed);
        assert_eq!(stop.stopped().await, StopReason::RelayFailed);
    }
}
