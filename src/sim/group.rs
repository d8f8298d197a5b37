//! Simulated group membership and messaging

use std::collections::BTreeMap;
use std::sync::Mutex;

use tokio::sync::RwLock;
use uuid::Uuid;

use super::lock;
use crate::error::{Error, Result};
use crate::group::{GroupMembership, GroupMessage, GroupMessenger, MemberInfo};

/// Group view held in memory
pub struct SimGroup {
    /// Local member uuid
    local: Uuid,
    /// All members (including self)
    members: RwLock<BTreeMap<Uuid, MemberInfo>>,
    /// Messages broadcast so far
    broadcasts: Mutex<Vec<GroupMessage>>,
    /// Reasons of every leave request
    leave_requests: Mutex<Vec<String>>,
    /// Fail broadcasts when set
    broadcast_error: Mutex<Option<String>>,
}

impl SimGroup {
    /// Create a group containing only the local member
    pub fn new(local: MemberInfo) -> Self {
        let uuid = local.uuid;
        let mut members = BTreeMap::new();
        members.insert(uuid, local);

        Self {
            local: uuid,
            members: RwLock::new(members),
            broadcasts: Mutex::new(Vec::new()),
            leave_requests: Mutex::new(Vec::new()),
            broadcast_error: Mutex::new(None),
        }
    }

    /// Add or replace a member
    pub async fn add_member(&self, member: MemberInfo) {
        tracing::debug!("Member {} joined the simulated group", member.uuid);
        self.members.write().await.insert(member.uuid, member);
    }

    /// Remove a member
    pub async fn remove_member(&self, uuid: &Uuid) -> Option<MemberInfo> {
        let removed = self.members.write().await.remove(uuid);
        if removed.is_some() {
            tracing::debug!("Member {} left the simulated group", uuid);
        }
        removed
    }

    /// Modify a member in place
    pub async fn update_member(&self, uuid: &Uuid, f: impl FnOnce(&mut MemberInfo)) -> bool {
        match self.members.write().await.get_mut(uuid) {
            Some(member) => {
                f(member);
                true
            }
            None => false,
        }
    }

    /// Make every following broadcast fail with `reason`
    pub fn fail_broadcasts(&self, reason: impl Into<String>) {
        *lock(&self.broadcast_error) = Some(reason.into());
    }

    /// Messages broadcast so far
    pub fn broadcasts(&self) -> Vec<GroupMessage> {
        lock(&self.broadcasts).clone()
    }

    /// Leave requests issued so far
    pub fn leave_requests(&self) -> Vec<String> {
        lock(&self.leave_requests).clone()
    }
}

#[async_trait::async_trait]
impl GroupMembership for SimGroup {
    async fn list_members(&self) -> Vec<MemberInfo> {
        self.members.read().await.values().cloned().collect()
    }

    async fn member_count(&self) -> usize {
        self.members.read().await.len()
    }

    async fn is_present(&self, uuid: &Uuid) -> bool {
        self.members.read().await.contains_key(uuid)
    }
}

#[async_trait::async_trait]
impl GroupMessenger for SimGroup {
    async fn broadcast(&self, message: GroupMessage) -> Result<()> {
        if let Some(reason) = lock(&self.broadcast_error).clone() {
            return Err(Error::Group(reason));
        }
        tracing::debug!("Broadcasting {} to the simulated group", message.type_name());
        lock(&self.broadcasts).push(message);
        Ok(())
    }

    async fn request_leave(&self, reason: &str) {
        tracing::warn!("Member {} requested to leave the group: {}", self.local, reason);
        lock(&self.leave_requests).push(reason.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::{MemberStatus, MemberVersion};

    fn member(n: u128) -> MemberInfo {
        MemberInfo::new(Uuid::from_u128(n), format!("db-{}", n), 3306, MemberVersion::new(8, 0, 36))
    }

    #[tokio::test]
    async fn test_membership_changes() {
        let group = SimGroup::new(member(1));
        assert_eq!(group.member_count().await, 1);

        group.add_member(member(2)).await;
        group.add_member(member(3)).await;
        assert_eq!(group.member_count().await, 3);
        assert!(group.is_present(&Uuid::from_u128(2)).await);

        assert!(group.update_member(&Uuid::from_u128(3), |m| m.status = MemberStatus::Offline).await);
        let members = group.list_members().await;
        assert_eq!(members[2].status, MemberStatus::Offline);

        assert!(group.remove_member(&Uuid::from_u128(2)).await.is_some());
        assert!(group.remove_member(&Uuid::from_u128(2)).await.is_none());
        assert_eq!(group.member_count().await, 2);
    }

    #[tokio::test]
    async fn test_messages_are_recorded() {
        let group = SimGroup::new(member(1));
        let message = GroupMessage::RecoveryEnd {
            member: Uuid::from_u128(1),
            view_id: "1:1".into(),
        };

        group.broadcast(message.clone()).await.unwrap();
        group.request_leave("fatal").await;
        assert_eq!(group.broadcasts(), vec![message.clone()]);
        assert_eq!(group.leave_requests(), vec!["fatal".to_string()]);

        group.fail_broadcasts("partitioned");
        assert!(matches!(group.broadcast(message).await, Err(Error::Group(_))));
    }
}
