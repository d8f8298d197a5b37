//! Session Signals
//!
//! The recovery session keeps a single event value that every external
//! source (stop requests, channel observer, membership changes, the
//! end-of-transfer notification) updates. Events are ranked: a higher
//! ranked event is never overwritten by a lower one, so an abort always
//! wins and a finished transfer is never turned back into a failover.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Pending event of a recovery session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// Nothing pending
    None,
    /// The selected donor left the group
    DonorFailover,
    /// A recovery channel thread stopped unexpectedly
    ChannelError,
    /// The joiner has received all the data it needs
    TransferFinished,
    /// The session was aborted
    Abort,
}

impl SessionEvent {
    fn rank(self) -> u8 {
        match self {
            SessionEvent::None => 0,
            SessionEvent::DonorFailover | SessionEvent::ChannelError => 1,
            SessionEvent::TransferFinished => 2,
            SessionEvent::Abort => 3,
        }
    }

    /// Check if the event asks for a new donor connection
    pub fn is_failover(self) -> bool {
        matches!(self, SessionEvent::DonorFailover | SessionEvent::ChannelError)
    }
}

/// Shared signal state of one recovery session
#[derive(Debug, Clone)]
pub struct SessionSignals {
    events: Arc<watch::Sender<SessionEvent>>,
    cancel: CancellationToken,
}

impl Default for SessionSignals {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionSignals {
    /// Create signals for a new session
    pub fn new() -> Self {
        let (events, _) = watch::channel(SessionEvent::None);
        Self {
            events: Arc::new(events),
            cancel: CancellationToken::new(),
        }
    }

    /// Raise an event, returns false if a higher or equal ranked event is pending
    pub fn raise(&self, event: SessionEvent) -> bool {
        self.events.send_if_modified(|current| {
            if event.rank() > current.rank() {
                *current = event;
                true
            } else {
                false
            }
        })
    }

    /// Abort the session and wake every waiter
    pub fn abort(&self) {
        self.cancel.cancel();
        self.raise(SessionEvent::Abort);
    }

    /// Check if the session was aborted
    pub fn is_aborted(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Check if the transfer-finished signal fired
    pub fn is_finished(&self) -> bool {
        *self.events.borrow() == SessionEvent::TransferFinished
    }

    /// Currently pending event
    pub fn current(&self) -> SessionEvent {
        *self.events.borrow()
    }

    /// Token cancelled when the session aborts
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Consume a pending failover event
    pub fn take_failover(&self) -> Option<SessionEvent> {
        let mut taken = None;
        self.events.send_if_modified(|current| {
            if current.is_failover() {
                taken = Some(*current);
                *current = SessionEvent::None;
            }
            false
        });
        taken
    }

    /// Wait until an event is pending and return it without consuming it
    pub async fn wait(&self) -> SessionEvent {
        let mut rx = self.events.subscribe();
        loop {
            let event = *rx.borrow_and_update();
            if event != SessionEvent::None {
                return event;
            }
            if rx.changed().await.is_err() {
                return SessionEvent::Abort;
            }
        }
    }

    /// Sleep unless aborted first, returns false when aborted
    pub async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_abort_wins_over_everything() {
        let signals = SessionSignals::new();
        assert!(signals.raise(SessionEvent::TransferFinished));
        signals.abort();
        assert!(!signals.raise(SessionEvent::ChannelError));
        assert!(!signals.raise(SessionEvent::TransferFinished));
        assert_eq!(signals.current(), SessionEvent::Abort);
        assert!(signals.is_aborted());
    }

    #[test]
    fn test_finished_ignores_failover() {
        let signals = SessionSignals::new();
        signals.raise(SessionEvent::TransferFinished);
        assert!(!signals.raise(SessionEvent::DonorFailover));
        assert_eq!(signals.take_failover(), None);
        assert!(signals.is_finished());
    }

    #[test]
    fn test_take_failover_resets() {
        let signals = SessionSignals::new();
        signals.raise(SessionEvent::ChannelError);
        assert_eq!(signals.take_failover(), Some(SessionEvent::ChannelError));
        assert_eq!(signals.current(), SessionEvent::None);
    }

    #[tokio::test]
    async fn test_wait_wakes_on_raise() {
        let signals = SessionSignals::new();
        let waiter = {
            let signals = signals.clone();
            tokio::spawn(async move { signals.wait().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        signals.raise(SessionEvent::DonorFailover);
        assert_eq!(waiter.await.unwrap(), SessionEvent::DonorFailover);
    }

    #[tokio::test]
    async fn test_sleep_interrupted_by_abort() {
        let signals = SessionSignals::new();
        let sleeper = {
            let signals = signals.clone();
            tokio::spawn(async move { signals.sleep(Duration::from_secs(30)).await })
        };
        signals.abort();
        assert!(!sleeper.await.unwrap());
    }
}
