//! Simulated group applier and certification module

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::Notify;

use super::lock;
use crate::applier::{ApplierControl, ApplierStatus, SuspendOutcome};
use crate::certifier::CertificationSink;
use crate::error::{Error, Result};
use crate::position::PositionSet;
use crate::recovery::RecoveryMetadata;

struct ApplierState {
    status: Mutex<ApplierStatus>,
    queued: AtomicUsize,
    applied: AtomicU64,
    suspended: AtomicBool,
    executed: AtomicBool,
    /// Suspension blocks until interrupted
    hold_suspension: AtomicBool,
    interrupted: AtomicBool,
    wakeup: Notify,
    drain_step: Duration,
}

/// Group applier with an in-memory queue
pub struct SimApplier {
    state: Arc<ApplierState>,
}

impl SimApplier {
    /// Create an applier that consumes one queued transaction per `drain_step`
    pub fn new(drain_step: Duration) -> Self {
        Self {
            state: Arc::new(ApplierState {
                status: Mutex::new(ApplierStatus::Running),
                queued: AtomicUsize::new(0),
                applied: AtomicU64::new(0),
                suspended: AtomicBool::new(false),
                executed: AtomicBool::new(true),
                hold_suspension: AtomicBool::new(false),
                interrupted: AtomicBool::new(false),
                wakeup: Notify::new(),
                drain_step,
            }),
        }
    }

    /// Queue transactions delivered by the group
    pub fn enqueue(&self, count: usize) {
        self.state.queued.fetch_add(count, Ordering::SeqCst);
    }

    /// Set the applier health
    pub fn set_status(&self, status: ApplierStatus) {
        *lock(&self.state.status) = status;
    }

    /// Keep `suspend` waiting until the wait is interrupted
    pub fn hold_suspension(&self, hold: bool) {
        self.state.hold_suspension.store(hold, Ordering::SeqCst);
        if !hold {
            self.state.wakeup.notify_waiters();
        }
    }

    /// Set whether every consumed transaction has also been executed
    pub fn set_executed(&self, executed: bool) {
        self.state.executed.store(executed, Ordering::SeqCst);
    }

    /// Check if the applier is suspended
    pub fn is_suspended(&self) -> bool {
        self.state.suspended.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl ApplierControl for SimApplier {
    async fn suspend(&self) -> Result<SuspendOutcome> {
        self.state.interrupted.store(false, Ordering::SeqCst);

        loop {
            let woken = self.state.wakeup.notified();
            if self.state.interrupted.swap(false, Ordering::SeqCst) {
                return Ok(SuspendOutcome::Interrupted);
            }
            if *lock(&self.state.status) == ApplierStatus::Error {
                return Err(Error::Applier("applier is in error state".into()));
            }
            if !self.state.hold_suspension.load(Ordering::SeqCst) {
                self.state.suspended.store(true, Ordering::SeqCst);
                tracing::debug!("Simulated applier suspended");
                return Ok(SuspendOutcome::Suspended);
            }
            woken.await;
        }
    }

    async fn resume(&self) -> Result<()> {
        if !self.state.suspended.swap(false, Ordering::SeqCst) {
            return Err(Error::Applier("applier is not suspended".into()));
        }

        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            while !state.suspended.load(Ordering::SeqCst) {
                let taken = state
                    .queued
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |q| q.checked_sub(1))
                    .is_ok();
                if !taken {
                    break;
                }
                tokio::time::sleep(state.drain_step).await;
                state.applied.fetch_add(1, Ordering::SeqCst);
            }
        });
        Ok(())
    }

    fn queue_depth(&self) -> usize {
        self.state.queued.load(Ordering::SeqCst)
    }

    fn applied_count(&self) -> u64 {
        self.state.applied.load(Ordering::SeqCst)
    }

    fn status(&self) -> ApplierStatus {
        *lock(&self.state.status)
    }

    fn interrupt_suspension_wait(&self) {
        self.state.interrupted.store(true, Ordering::SeqCst);
        self.state.wakeup.notify_waiters();
    }

    async fn wait_for_execution(&self, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.state.executed.load(Ordering::SeqCst) {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

/// Certification module recording what recovery hands it
#[derive(Default)]
pub struct SimCertifier {
    metadata: Mutex<Vec<RecoveryMetadata>>,
    watermark: Mutex<Option<PositionSet>>,
    failure: Mutex<Option<String>>,
}

impl SimCertifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make installing metadata fail with `reason`
    pub fn fail_with(&self, reason: impl Into<String>) {
        *lock(&self.failure) = Some(reason.into());
    }

    /// Metadata installed so far
    pub fn applied_metadata(&self) -> Vec<RecoveryMetadata> {
        lock(&self.metadata).clone()
    }

    /// Watermark the certifier was reinitialized from
    pub fn watermark(&self) -> Option<PositionSet> {
        lock(&self.watermark).clone()
    }
}

#[async_trait::async_trait]
impl CertificationSink for SimCertifier {
    async fn apply_recovery_metadata(&self, metadata: &RecoveryMetadata) -> Result<()> {
        if let Some(reason) = lock(&self.failure).clone() {
            return Err(Error::Certification(reason));
        }
        lock(&self.metadata).push(metadata.clone());
        Ok(())
    }

    async fn reinitialize_from_watermark(&self, positions: &PositionSet) -> Result<()> {
        *lock(&self.watermark) = Some(positions.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resume_drains_queue() {
        let applier = SimApplier::new(Duration::from_millis(1));
        applier.enqueue(5);

        assert_eq!(applier.suspend().await.unwrap(), SuspendOutcome::Suspended);
        assert!(applier.is_suspended());
        applier.resume().await.unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while applier.queue_depth() > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(applier.queue_depth(), 0);
        assert_eq!(applier.applied_count(), 5);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_interrupt_held_suspension() {
        let applier = Arc::new(SimApplier::new(Duration::from_millis(1)));
        applier.hold_suspension(true);

        let waiter = {
            let applier = Arc::clone(&applier);
            tokio::spawn(async move { applier.suspend().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        applier.interrupt_suspension_wait();

        let outcome = tokio::time::timeout(Duration::from_secs(2), waiter).await.unwrap().unwrap();
        assert_eq!(outcome.unwrap(), SuspendOutcome::Interrupted);
        assert!(!applier.is_suspended());
    }

    #[tokio::test]
    async fn test_wait_for_execution() {
        let applier = SimApplier::new(Duration::from_millis(1));
        applier.set_executed(false);
        assert!(!applier.wait_for_execution(Duration::from_millis(20)).await.unwrap());
        applier.set_executed(true);
        assert!(applier.wait_for_execution(Duration::from_millis(20)).await.unwrap());
    }

    #[tokio::test]
    async fn test_certifier_failure() {
        let certifier = SimCertifier::new();
        let metadata = RecoveryMetadata {
            view_id: "1:1".into(),
            certification_info: bytes::Bytes::from_static(b"cert"),
            watermark: PositionSet::new(),
        };

        certifier.apply_recovery_metadata(&metadata).await.unwrap();
        certifier.fail_with("corrupt");
        assert!(certifier.apply_recovery_metadata(&metadata).await.is_err());
        assert_eq!(certifier.applied_metadata().len(), 1);
    }
}
