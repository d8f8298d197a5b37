//! Donor Selection
//!
//! Builds a shuffled list of members able to serve state transfer and hands
//! them out one at a time. The list is rebuilt when it runs dry or when the
//! membership changes; the selected donor is kept in sync with the latest
//! membership view so a failover decision always sees fresh data.
//!
//! The selector holds no lock of its own: the state transfer owns it behind
//! the selection lock, together with the attempt counter.

use std::collections::HashSet;

use rand::seq::SliceRandom;
use uuid::Uuid;

use crate::group::{MemberInfo, MemberVersion};

/// Randomized donor candidate list for one recovery session
#[derive(Debug)]
pub struct DonorSelector {
    /// Local member uuid, never a candidate
    local_uuid: Uuid,
    /// Local member version
    local_version: MemberVersion,
    /// Accept donors running a higher version
    allow_lower_local: bool,
    /// Remaining candidates, consumed from the back
    candidates: Vec<MemberInfo>,
    /// Donor currently used or attempted
    selected: Option<MemberInfo>,
    /// Donor connection attempts in this session
    attempts: u32,
}

impl DonorSelector {
    /// Create an empty selector
    pub fn new(local_uuid: Uuid, local_version: MemberVersion, allow_lower_local: bool) -> Self {
        Self {
            local_uuid,
            local_version,
            allow_lower_local,
            candidates: Vec::new(),
            selected: None,
            attempts: 0,
        }
    }

    fn is_compatible(&self, member: &MemberInfo) -> bool {
        member.uuid != self.local_uuid
            && self.local_version.accepts_donor(&member.version, self.allow_lower_local)
    }

    /// Rebuild the candidate list from a membership snapshot.
    ///
    /// Returns the refreshed selected donor when it is still present and
    /// compatible; the selection itself is left untouched otherwise so the
    /// caller can decide between failover and clearing it.
    pub fn rebuild(&mut self, members: &[MemberInfo]) -> Option<&MemberInfo> {
        let mut seen = HashSet::new();
        let mut candidates: Vec<MemberInfo> = members
            .iter()
            .filter(|m| m.is_online() && self.is_compatible(m) && seen.insert(m.uuid))
            .cloned()
            .collect();
        candidates.shuffle(&mut rand::thread_rng());

        tracing::debug!(
            "Rebuilt donor list: {} candidates out of {} members",
            candidates.len(),
            members.len()
        );
        self.candidates = candidates;

        let selected_uuid = self.selected.as_ref().map(|d| d.uuid)?;
        let fresh = members
            .iter()
            .find(|m| m.uuid == selected_uuid && self.is_compatible(m))
            .cloned()?;
        self.selected = Some(fresh);
        self.selected.as_ref()
    }

    /// Pop the next candidate and make it the selected donor
    pub fn next(&mut self) -> Option<MemberInfo> {
        let donor = self.candidates.pop()?;
        self.selected = Some(donor.clone());
        Some(donor)
    }

    /// Check if every candidate of the current build was consumed
    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    /// Number of candidates left
    pub fn remaining(&self) -> usize {
        self.candidates.len()
    }

    /// Donor currently used or attempted
    pub fn selected(&self) -> Option<&MemberInfo> {
        self.selected.as_ref()
    }

    /// Forget the selected donor
    pub fn clear_selected(&mut self) {
        self.selected = None;
    }

    /// Donor connection attempts so far
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Count one more connection attempt
    pub fn record_attempt(&mut self) -> u32 {
        self.attempts += 1;
        self.attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::MemberStatus;

    fn member(n: u128, version: MemberVersion) -> MemberInfo {
        MemberInfo::new(Uuid::from_u128(n), format!("db-{}", n), 3306, version)
    }

    fn group(size: u128) -> Vec<MemberInfo> {
        (1..=size).map(|n| member(n, MemberVersion::new(8, 0, 36))).collect()
    }

    fn selector() -> DonorSelector {
        DonorSelector::new(Uuid::from_u128(1), MemberVersion::new(8, 0, 36), false)
    }

    #[test]
    fn test_rebuild_excludes_self_and_has_no_duplicates() {
        for size in 2..8 {
            let mut donors = selector();
            donors.rebuild(&group(size));
            assert_eq!(donors.remaining(), (size - 1) as usize);

            let mut seen = HashSet::new();
            for _ in 1..size {
                let donor = donors.next().unwrap();
                assert_ne!(donor.uuid, Uuid::from_u128(1));
                assert!(seen.insert(donor.uuid));
            }
            assert!(donors.is_empty());
            assert!(donors.next().is_none());
        }
    }

    #[test]
    fn test_rebuild_filters_status_and_version() {
        let mut members = group(4);
        members[1].status = MemberStatus::Recovering;
        members[2].version = MemberVersion::new(8, 0, 40);

        let mut donors = selector();
        donors.rebuild(&members);
        assert_eq!(donors.remaining(), 1);
        assert_eq!(donors.next().unwrap().uuid, Uuid::from_u128(4));

        let mut permissive = DonorSelector::new(Uuid::from_u128(1), MemberVersion::new(8, 0, 36), true);
        permissive.rebuild(&members);
        assert_eq!(permissive.remaining(), 2);
    }

    #[test]
    fn test_selected_donor_refreshed_on_rebuild() {
        let mut members = group(3);
        let mut donors = selector();
        donors.rebuild(&members);
        let chosen = donors.next().unwrap();

        let index = members.iter().position(|m| m.uuid == chosen.uuid).unwrap();
        members[index].host = "db-moved".into();

        let refreshed = donors.rebuild(&members).cloned().unwrap();
        assert_eq!(refreshed.uuid, chosen.uuid);
        assert_eq!(refreshed.host, "db-moved");
        assert_eq!(donors.selected().unwrap().uuid, chosen.uuid);
    }

    #[test]
    fn test_departed_donor_is_not_refreshed() {
        let members = group(3);
        let mut donors = selector();
        donors.rebuild(&members);
        let chosen = donors.next().unwrap();

        let remaining: Vec<_> = members.into_iter().filter(|m| m.uuid != chosen.uuid).collect();
        assert!(donors.rebuild(&remaining).is_none());
        assert_eq!(donors.selected().unwrap().uuid, chosen.uuid);

        donors.clear_selected();
        assert!(donors.selected().is_none());
    }

    #[test]
    fn test_attempt_counter() {
        let mut donors = selector();
        assert_eq!(donors.attempts(), 0);
        assert_eq!(donors.record_attempt(), 1);
        assert_eq!(donors.record_attempt(), 2);
        assert_eq!(donors.attempts(), 2);
    }
}
