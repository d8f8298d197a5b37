//! Group Module
//!
//! Membership queries and group messaging consumed by recovery.

mod membership;
mod messaging;

pub use membership::{GroupMembership, MemberInfo, MemberStatus, MemberVersion};
pub use messaging::{GroupMessage, GroupMessenger};
