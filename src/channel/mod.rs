//! Recovery Channel
//!
//! The replication channel streams missing data from a donor: a receiver
//! thread pulls events from the donor and an applier thread applies them
//! locally. Recovery drives the channel through [`ReplicationChannel`] and
//! learns about thread stops through a registered [`ChannelObserver`].

mod observer;

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::{AuthConfig, SslConfig};
use crate::error::Result;
use crate::position::PositionSet;

pub use observer::RecoveryChannelObserver;

/// Identity of a channel thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelThreadId(pub u64);

impl fmt::Display for ChannelThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "thread-{}", self.0)
    }
}

/// Donor endpoint the channel connects to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub donor: Uuid,
    pub host: String,
    pub port: u16,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Transport options applied when the channel is initialized
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransportOptions {
    /// TLS options, `None` when TLS is disabled
    pub ssl: Option<SslConfig>,
    /// Credentials
    pub auth: AuthConfig,
    /// Allowed compression algorithms
    pub compression_algorithms: Vec<String>,
    /// zstd compression level
    pub zstd_level: u8,
}

/// Condition at which the channel applier stops on its own
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UntilCondition {
    /// Run until the view change with this id has been applied
    ViewChange { view_id: String },
    /// Run until every position of the set has been applied
    Positions(PositionSet),
}

impl UntilCondition {
    /// Target position set, when the condition is position based
    pub fn positions(&self) -> Option<&PositionSet> {
        match self {
            UntilCondition::Positions(set) => Some(set),
            UntilCondition::ViewChange { .. } => None,
        }
    }
}

impl fmt::Display for UntilCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UntilCondition::ViewChange { view_id } => write!(f, "view {}", view_id),
            UntilCondition::Positions(set) => write!(f, "positions [{}]", set),
        }
    }
}

/// Control surface of the recovery replication channel
#[async_trait::async_trait]
pub trait ReplicationChannel: Send + Sync {
    /// Point the channel at a donor
    async fn initialize(&self, endpoint: &Endpoint, options: &TransportOptions) -> Result<()>;

    /// Start the receiver and applier threads
    async fn start_threads(&self, until: &UntilCondition) -> Result<()>;

    /// Stop the receiver and applier threads
    async fn stop_threads(&self) -> Result<()>;

    /// Remove relay logs and channel metadata
    async fn purge_logs(&self) -> Result<()>;

    /// Check if the receiver thread is running
    fn is_receiver_running(&self) -> bool;

    /// Check if the applier thread is running
    fn is_applier_running(&self) -> bool;

    /// Check if a thread belongs to this channel
    fn owns_thread(&self, thread: ChannelThreadId) -> bool;

    /// Check if the locally applied positions include every position of `target`
    fn applied_positions_cover(&self, target: &PositionSet) -> bool;

    /// Register the observer notified about channel thread events
    fn register_observer(&self, observer: Arc<dyn ChannelObserver>);

    /// Remove the registered observer
    fn unregister_observer(&self);
}

/// Notifications delivered by the channel threads
pub trait ChannelObserver: Send + Sync {
    /// A channel thread started
    fn on_thread_start(&self, thread: ChannelThreadId);

    /// The receiver thread stopped
    fn on_receiver_stop(&self, thread: ChannelThreadId);

    /// The applier thread stopped, `aborted` when it stopped on an error
    fn on_applier_stop(&self, thread: ChannelThreadId, aborted: bool);

    /// The channel was reset
    fn on_reset(&self);
}
