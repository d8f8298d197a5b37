//! Group Messaging
//!
//! Outbound group notifications used at the end of a recovery session:
//! announcing that the local member is online, or asking to leave the group
//! after an unrecoverable failure.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;

/// Messages broadcast to the group by the recovery coordinator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum GroupMessage {
    /// The member finished recovery and is now ONLINE
    RecoveryEnd { member: Uuid, view_id: String },
}

impl GroupMessage {
    /// Get message type name for logging
    pub fn type_name(&self) -> &'static str {
        match self {
            GroupMessage::RecoveryEnd { .. } => "RecoveryEnd",
        }
    }
}

/// Group announcement and leave requests
#[async_trait::async_trait]
pub trait GroupMessenger: Send + Sync {
    /// Broadcast a message to the group
    async fn broadcast(&self, message: GroupMessage) -> Result<()>;

    /// Ask the group layer to remove the local member
    async fn request_leave(&self, reason: &str);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_serialization() {
        let msg = GroupMessage::RecoveryEnd {
            member: Uuid::nil(),
            view_id: "1700000000:3".into(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"RecoveryEnd\""));
        let back: GroupMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
        assert_eq!(back.type_name(), "RecoveryEnd");
    }
}
