//! WolfRecovery - Distributed Recovery Coordinator
//!
//! Brings a member joining a replication group up to date before it is
//! declared ONLINE. While the group keeps accepting writes, the joiner
//! buffers incoming transactions, streams the data it is missing from a
//! donor member, applies its buffered backlog and finally announces itself
//! to the group.
//!
//! # Architecture
//!
//! The [`recovery::RecoveryModule`] runs one background task per session and
//! talks to the rest of the server only through collaborator traits: group
//! membership and messaging, the group applier, the certification module and
//! the recovery replication channel. Donor failures are absorbed by donor
//! failover; only unrecoverable failures end the session, in which case the
//! member asks to leave the group.
//!
//! # Features
//!
//! - Randomized donor selection with version compatibility rules
//! - Donor failover on disconnects, channel errors and membership changes
//! - Bounded retries with a reconnect interval between donor list rebuilds
//! - Completion on a view change or on a transaction position set
//! - Cancellable waits with bounded shutdown
//! - In-process simulated collaborators for testing and demos

pub mod config;
pub mod error;
pub mod position;
pub mod group;
pub mod channel;
pub mod applier;
pub mod certifier;
pub mod recovery;
pub mod sim;

pub use config::RecoveryConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{CompletionPolicy, RecoveryConfig};
    pub use crate::error::{Error, Result};
    pub use crate::position::PositionSet;
    pub use crate::group::{GroupMembership, GroupMessenger, MemberInfo, MemberVersion};
    pub use crate::channel::{ChannelObserver, ReplicationChannel, UntilCondition};
    pub use crate::applier::ApplierControl;
    pub use crate::certifier::CertificationSink;
    pub use crate::recovery::{
        CompletionCondition, RecoveryMetadata, RecoveryModule, RecoveryOutcome, RecoveryServices,
        RecoveryState,
    };
}
