//! Certification Sink

use crate::error::Result;
use crate::position::PositionSet;
use crate::recovery::RecoveryMetadata;

/// Certification collaborator fed by recovery
#[async_trait::async_trait]
pub trait CertificationSink: Send + Sync {
    /// Install the certification state carried by recovery metadata.
    /// Must complete before state transfer starts.
    async fn apply_recovery_metadata(&self, metadata: &RecoveryMetadata) -> Result<()>;

    /// Reset the set of already applied transactions to the watermark
    async fn reinitialize_from_watermark(&self, positions: &PositionSet) -> Result<()>;
}
