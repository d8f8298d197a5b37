//! Recovery Channel Observer
//!
//! Turns channel thread notifications into session events.

use std::sync::Arc;

use super::{ChannelObserver, ChannelThreadId, ReplicationChannel, UntilCondition};
use crate::recovery::{SessionEvent, SessionSignals};

/// Observer registered on the recovery channel for one donor connection
pub struct RecoveryChannelObserver {
    channel: Arc<dyn ReplicationChannel>,
    signals: SessionSignals,
    until: UntilCondition,
}

impl RecoveryChannelObserver {
    pub fn new(channel: Arc<dyn ReplicationChannel>, signals: SessionSignals, until: UntilCondition) -> Self {
        Self { channel, signals, until }
    }

    fn transfer_pending(&self) -> bool {
        !self.signals.is_finished() && !self.signals.is_aborted()
    }
}

impl ChannelObserver for RecoveryChannelObserver {
    fn on_thread_start(&self, _thread: ChannelThreadId) {}

    fn on_receiver_stop(&self, thread: ChannelThreadId) {
        if self.transfer_pending() && self.channel.owns_thread(thread) {
            tracing::warn!("Recovery receiver {} stopped before state transfer finished", thread);
            self.signals.raise(SessionEvent::ChannelError);
        }
    }

    fn on_applier_stop(&self, thread: ChannelThreadId, aborted: bool) {
        if !self.transfer_pending() || !self.channel.owns_thread(thread) {
            return;
        }

        // The applier also stops when it reaches the until condition
        if let Some(target) = self.until.positions() {
            if self.channel.applied_positions_cover(target) {
                tracing::info!("Recovery applier {} reached the target positions", thread);
                self.signals.raise(SessionEvent::TransferFinished);
                return;
            }
        }

        tracing::warn!(
            "Recovery applier {} stopped before state transfer finished (aborted: {})",
            thread,
            aborted
        );
        self.signals.raise(SessionEvent::ChannelError);
    }

    fn on_reset(&self) {}
}
