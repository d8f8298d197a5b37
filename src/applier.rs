//! Applier Control
//!
//! The group applier queues and applies transactions delivered by the group.
//! Recovery suspends it while the state transfer runs and resumes it once
//! the joiner has caught up.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Health of the group applier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApplierStatus {
    Running,
    Error,
}

impl fmt::Display for ApplierStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApplierStatus::Running => write!(f, "RUNNING"),
            ApplierStatus::Error => write!(f, "ERROR"),
        }
    }
}

/// Result of a suspension request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuspendOutcome {
    /// The applier is fully suspended
    Suspended,
    /// The wait was interrupted before suspension completed
    Interrupted,
}

/// Control surface of the group applier
#[async_trait::async_trait]
pub trait ApplierControl: Send + Sync {
    /// Suspend the applier and wait until it is fully suspended
    async fn suspend(&self) -> Result<SuspendOutcome>;

    /// Resume a suspended applier
    async fn resume(&self) -> Result<()>;

    /// Number of transactions waiting in the applier queue
    fn queue_depth(&self) -> usize;

    /// Number of transactions taken off the queue since the applier started
    fn applied_count(&self) -> u64;

    /// Current applier health
    fn status(&self) -> ApplierStatus;

    /// Wake a pending `suspend` call
    fn interrupt_suspension_wait(&self);

    /// Wait up to `timeout` for every queued transaction to be executed,
    /// returns false on timeout
    async fn wait_for_execution(&self, timeout: Duration) -> Result<bool>;
}
