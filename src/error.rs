//! WolfRecovery Error Types

use thiserror::Error;

/// Result type alias for WolfRecovery operations
pub type Result<T> = std::result::Result<T, Error>;

/// WolfRecovery error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Failed to serialize configuration: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),

    // Data model errors
    #[error("Invalid position set '{input}': {reason}")]
    InvalidPositionSet { input: String, reason: String },

    #[error("Invalid member version: {0}")]
    InvalidVersion(String),

    // Channel errors
    #[error("Recovery channel error: {0}")]
    Channel(String),

    #[error("Connection to donor {donor} at {address} failed: {reason}")]
    ConnectionFailed {
        donor: String,
        address: String,
        reason: String,
    },

    #[error("Recovery channel threads are still running")]
    ChannelThreadsRunning,

    // Donor errors
    #[error("No donor available after {attempts} attempts (last donor: {})", last_donor.as_deref().unwrap_or("none"))]
    NoAvailableDonor {
        attempts: u32,
        last_donor: Option<String>,
    },

    // Recovery metadata errors
    #[error("Timed out after {timeout_ms}ms waiting for recovery metadata")]
    MetadataTimeout { timeout_ms: u64 },

    #[error("Recovery metadata delivery failed: {0}")]
    MetadataDelivery(String),

    // Collaborator errors
    #[error("Certification error: {0}")]
    Certification(String),

    #[error("Applier error: {0}")]
    Applier(String),

    #[error("Group communication error: {0}")]
    Group(String),

    // Lifecycle errors
    #[error("Recovery is already running")]
    AlreadyRunning,

    #[error("Recovery is not running")]
    NotRunning,

    #[error("Recovery task still running after {waited_ms}ms")]
    StillRunning { waited_ms: u64 },

    #[error("Recovery aborted")]
    Aborted,

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Check if this error is handled by donor failover rather than
    /// ending the recovery session
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ConnectionFailed { .. } | Error::Channel(_)
        )
    }

    /// Check if this error should make the local member leave the group
    pub fn requires_leave(&self) -> bool {
        !matches!(
            self,
            Error::Aborted | Error::AlreadyRunning | Error::NotRunning | Error::StillRunning { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        let err = Error::ConnectionFailed {
            donor: "a".into(),
            address: "10.0.0.1:3306".into(),
            reason: "refused".into(),
        };
        assert!(err.is_retryable());
        assert!(!Error::NoAvailableDonor { attempts: 3, last_donor: None }.is_retryable());
        assert!(!Error::MetadataTimeout { timeout_ms: 10 }.is_retryable());
    }

    #[test]
    fn test_no_donor_message_includes_context() {
        let err = Error::NoAvailableDonor {
            attempts: 10,
            last_donor: Some("donor-2".into()),
        };
        let msg = err.to_string();
        assert!(msg.contains("10 attempts"));
        assert!(msg.contains("donor-2"));
        assert!(!Error::Aborted.requires_leave());
        assert!(Error::MetadataDelivery("lost".into()).requires_leave());
    }
}
