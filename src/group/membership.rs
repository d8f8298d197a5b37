//! Group Membership
//!
//! Member descriptors and the read-only membership queries the recovery
//! coordinator depends on. The membership service refreshes its view
//! concurrently, so callers always receive owned copies.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Recovery status of a member as seen by the group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberStatus {
    /// Member is serving traffic
    Online,
    /// Member is catching up
    Recovering,
    /// Member left or is unreachable
    Offline,
    /// Member hit an unrecoverable error
    Error,
    /// Member is known but unreachable from this node
    Unreachable,
}

impl fmt::Display for MemberStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemberStatus::Online => write!(f, "ONLINE"),
            MemberStatus::Recovering => write!(f, "RECOVERING"),
            MemberStatus::Offline => write!(f, "OFFLINE"),
            MemberStatus::Error => write!(f, "ERROR"),
            MemberStatus::Unreachable => write!(f, "UNREACHABLE"),
        }
    }
}

/// Server version of a member
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MemberVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl MemberVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self { major, minor, patch }
    }

    /// Long-term-support series: 8.4, and x.7 from 9 onwards
    pub fn is_lts_series(&self) -> bool {
        (self.major == 8 && self.minor == 4) || (self.major >= 9 && self.minor == 7)
    }

    /// Check if both versions belong to the same LTS series
    pub fn same_lts_series(&self, other: &MemberVersion) -> bool {
        self.is_lts_series() && self.major == other.major && self.minor == other.minor
    }

    /// Check if a donor running `donor` may serve a joiner running `self`
    pub fn accepts_donor(&self, donor: &MemberVersion, allow_lower_local: bool) -> bool {
        donor <= self || self.same_lts_series(donor) || allow_lower_local
    }
}

impl fmt::Display for MemberVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for MemberVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.trim().split('.').map(|p| p.parse::<u32>());
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(Ok(major)), Some(Ok(minor)), Some(Ok(patch)), None) => {
                Ok(Self::new(major, minor, patch))
            }
            _ => Err(Error::InvalidVersion(s.to_string())),
        }
    }
}

/// Descriptor of a group member
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberInfo {
    /// Member uuid
    pub uuid: Uuid,
    /// Host the recovery channel connects to
    pub host: String,
    /// Port the recovery channel connects to
    pub port: u16,
    /// Server version
    pub version: MemberVersion,
    /// Recovery status
    pub status: MemberStatus,
}

impl MemberInfo {
    /// Create a new member descriptor
    pub fn new(uuid: Uuid, host: impl Into<String>, port: u16, version: MemberVersion) -> Self {
        Self {
            uuid,
            host: host.into(),
            port,
            version,
            status: MemberStatus::Online,
        }
    }

    /// Set the status, builder style
    pub fn with_status(mut self, status: MemberStatus) -> Self {
        self.status = status;
        self
    }

    /// `host:port` of the member
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Check if the member can serve state transfer
    pub fn is_online(&self) -> bool {
        self.status == MemberStatus::Online
    }
}

/// Read-only membership queries
#[async_trait::async_trait]
pub trait GroupMembership: Send + Sync {
    /// Snapshot of every member, including the local one
    async fn list_members(&self) -> Vec<MemberInfo>;

    /// Number of members in the current view
    async fn member_count(&self) -> usize;

    /// Check if a member is part of the current view
    async fn is_present(&self, uuid: &Uuid) -> bool;
}
