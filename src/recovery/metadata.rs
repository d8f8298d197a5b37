//! Recovery Metadata
//!
//! When recovery completes on a position set rather than a view, the group
//! sends the joiner an out-of-band payload with the certification state and
//! the watermark to reach. The coordinator waits for it, in short slices so
//! an abort is seen promptly, before starting the state transfer.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::position::PositionSet;

/// Longest single sleep while waiting for metadata
const POLL_SLICE: Duration = Duration::from_secs(1);

/// Payload delivered to the joiner before state transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryMetadata {
    /// View the metadata was generated for
    pub view_id: String,
    /// Serialized certification state
    pub certification_info: Bytes,
    /// Positions the joiner must have applied before going online
    pub watermark: PositionSet,
}

#[derive(Debug)]
enum Delivery {
    Pending,
    Delivered(Arc<RecoveryMetadata>),
    Failed(String),
}

/// Bounded wait for the recovery metadata of one session
#[derive(Debug)]
pub struct RecoveryMetadataWaiter {
    slot: watch::Sender<Delivery>,
    cancel: CancellationToken,
}

impl RecoveryMetadataWaiter {
    /// Create a waiter tied to the session cancellation token
    pub fn new(cancel: CancellationToken) -> Self {
        let (slot, _) = watch::channel(Delivery::Pending);
        Self { slot, cancel }
    }

    /// Deliver the metadata, or the reason it could not be produced.
    /// Only the first delivery of a session is kept.
    pub fn deliver(&self, delivery: std::result::Result<RecoveryMetadata, String>) -> bool {
        let accepted = self.slot.send_if_modified(|slot| {
            if !matches!(slot, Delivery::Pending) {
                return false;
            }
            *slot = match delivery {
                Ok(metadata) => Delivery::Delivered(Arc::new(metadata)),
                Err(reason) => Delivery::Failed(reason),
            };
            true
        });

        if !accepted {
            tracing::warn!("Ignoring duplicate recovery metadata delivery");
        }
        accepted
    }

    /// Wait up to `max_wait` for the metadata
    pub async fn wait(&self, max_wait: Duration) -> Result<Arc<RecoveryMetadata>> {
        let deadline = Instant::now() + max_wait;
        let mut rx = self.slot.subscribe();

        loop {
            match &*rx.borrow_and_update() {
                Delivery::Delivered(metadata) => return Ok(Arc::clone(metadata)),
                Delivery::Failed(reason) => return Err(Error::MetadataDelivery(reason.clone())),
                Delivery::Pending => {}
            }

            if self.cancel.is_cancelled() {
                return Err(Error::Aborted);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::MetadataTimeout {
                    timeout_ms: max_wait.as_millis() as u64,
                });
            }

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(Error::Aborted),
                _ = rx.changed() => {}
                _ = tokio::time::sleep(remaining.min(POLL_SLICE)) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn sample_metadata() -> RecoveryMetadata {
        let mut watermark = PositionSet::new();
        watermark.add_interval(Uuid::from_u128(7), 1, 42);
        RecoveryMetadata {
            view_id: "1700000000:4".into(),
            certification_info: Bytes::from_static(b"\x00\x01cert-state\xff"),
            watermark,
        }
    }

    #[tokio::test]
    async fn test_delivery_before_wait() {
        let waiter = RecoveryMetadataWaiter::new(CancellationToken::new());
        assert!(waiter.deliver(Ok(sample_metadata())));

        let started = Instant::now();
        let metadata = waiter.wait(Duration::from_secs(30)).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(*metadata, sample_metadata());
    }

    #[tokio::test]
    async fn test_delivery_wakes_waiter() {
        let waiter = Arc::new(RecoveryMetadataWaiter::new(CancellationToken::new()));
        let handle = {
            let waiter = Arc::clone(&waiter);
            tokio::spawn(async move { waiter.wait(Duration::from_secs(30)).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        waiter.deliver(Ok(sample_metadata()));

        let metadata = handle.await.unwrap().unwrap();
        assert_eq!(metadata.certification_info, sample_metadata().certification_info);
        assert_eq!(metadata.watermark, sample_metadata().watermark);
    }

    #[tokio::test]
    async fn test_delivery_error() {
        let waiter = RecoveryMetadataWaiter::new(CancellationToken::new());
        waiter.deliver(Err("donor crashed".into()));
        assert!(!waiter.deliver(Ok(sample_metadata())));

        match waiter.wait(Duration::from_secs(5)).await {
            Err(Error::MetadataDelivery(reason)) => assert_eq!(reason, "donor crashed"),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_timeout() {
        let waiter = RecoveryMetadataWaiter::new(CancellationToken::new());
        match waiter.wait(Duration::from_millis(50)).await {
            Err(Error::MetadataTimeout { timeout_ms }) => assert_eq!(timeout_ms, 50),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_abort_interrupts_wait() {
        let cancel = CancellationToken::new();
        let waiter = Arc::new(RecoveryMetadataWaiter::new(cancel.clone()));
        let handle = {
            let waiter = Arc::clone(&waiter);
            tokio::spawn(async move { waiter.wait(Duration::from_secs(60)).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
        assert!(matches!(result, Err(Error::Aborted)));
    }
}
