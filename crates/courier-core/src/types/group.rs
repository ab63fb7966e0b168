//! Group chat types
//!
//! Groups are mutated only by applying [`GroupCommand`]s, whether we issued
//! them or received them. Messages reference a group by identity; there is no
//! foreign key from a message to the group row.

use serde::{Deserialize, Serialize};

use super::{Identity, ThreadId};

/// Control message altering group membership, subject or lifecycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupCommand {
    /// Group creation with its initial members
    Create {
        members: Vec<Identity>,
        subject: Option<String>,
    },
    /// Membership change. `existing` lists members that were already in the group.
    Members {
        added: Vec<Identity>,
        removed: Vec<Identity>,
        existing: Vec<Identity>,
    },
    SetSubject { subject: String },
    /// The sender leaves the group
    Part,
}

impl GroupCommand {
    pub fn is_create(&self) -> bool {
        matches!(self, GroupCommand::Create { .. })
    }

    pub fn is_part(&self) -> bool {
        matches!(self, GroupCommand::Part)
    }

    /// Wire-style textual form, e.g. `add:alice@x,bob@x`
    pub fn describe(&self) -> String {
        fn join(ids: &[Identity]) -> String {
            ids.iter().map(Identity::as_str).collect::<Vec<_>>().join(",")
        }
        match self {
            GroupCommand::Create { members, .. } => format!("create:{}", join(members)),
            GroupCommand::Members { added, removed, .. } => {
                let mut parts = Vec::new();
                if !added.is_empty() {
                    parts.push(format!("add:{}", join(added)));
                }
                if !removed.is_empty() {
                    parts.push(format!("remove:{}", join(removed)));
                }
                parts.join(";")
            }
            GroupCommand::SetSubject { subject } => format!("subject:{}", subject),
            GroupCommand::Part => "part".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberState {
    Member,
    Kicked,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMember {
    pub identity: Identity,
    pub state: MemberState,
}

/// Our own standing in a group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Membership {
    Member,
    /// We were removed by the owner
    Kicked,
    /// We left the group
    Parted,
}

/// A group conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub id: Identity,
    pub owner: Identity,
    pub subject: Option<String>,
    pub thread_id: ThreadId,
    pub membership: Membership,
    /// Other participants (never includes ourselves)
    pub members: Vec<GroupMember>,
}

impl Group {
    pub fn new(id: Identity, owner: Identity, thread_id: ThreadId) -> Self {
        Self {
            id,
            owner,
            subject: None,
            thread_id,
            membership: Membership::Member,
            members: Vec::new(),
        }
    }

    /// Identities currently in the group, excluding kicked members
    pub fn live_members(&self) -> Vec<Identity> {
        self.members
            .iter()
            .filter(|m| m.state == MemberState::Member)
            .map(|m| m.identity.clone())
            .collect()
    }

    pub fn is_member(&self, identity: &Identity) -> bool {
        self.members
            .iter()
            .any(|m| &m.identity == identity && m.state == MemberState::Member)
    }

    /// Add (or re-admit) a member
    pub fn add_member(&mut self, identity: Identity) {
        match self.members.iter_mut().find(|m| m.identity == identity) {
            Some(member) => member.state = MemberState::Member,
            None => self.members.push(GroupMember {
                identity,
                state: MemberState::Member,
            }),
        }
    }

    /// Mark a member as kicked; unknown identities are ignored
    pub fn kick_member(&mut self, identity: &Identity) {
        if let Some(member) = self.members.iter_mut().find(|m| &m.identity == identity) {
            member.state = MemberState::Kicked;
        }
    }

    /// Drop a member that left on their own
    pub fn remove_member(&mut self, identity: &Identity) {
        self.members.retain(|m| &m.identity != identity);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> Identity {
        Identity::new(s)
    }

    #[test]
    fn test_live_members_exclude_kicked() {
        let mut group = Group::new(id("g@x"), id("me@x"), ThreadId(1));
        group.add_member(id("alice@x"));
        group.add_member(id("bob@x"));
        group.kick_member(&id("bob@x"));

        assert_eq!(group.live_members(), vec![id("alice@x")]);
        assert!(!group.is_member(&id("bob@x")));

        group.add_member(id("bob@x"));
        assert!(group.is_member(&id("bob@x")));
        assert_eq!(group.members.len(), 2);
    }

    #[test]
    fn test_remove_member() {
        let mut group = Group::new(id("g@x"), id("me@x"), ThreadId(1));
        group.add_member(id("alice@x"));
        group.remove_member(&id("alice@x"));
        assert!(group.live_members().is_empty());
        assert!(group.members.is_empty());
    }

    #[test]
    fn test_describe_commands() {
        let cmd = GroupCommand::Members {
            added: vec![id("a@x")],
            removed: vec![id("b@x")],
            existing: vec![],
        };
        assert_eq!(cmd.describe(), "add:a@x;remove:b@x");
        assert_eq!(GroupCommand::Part.describe(), "part");
        assert!(GroupCommand::Create {
            members: vec![],
            subject: None
        }
        .is_create());
    }
}
