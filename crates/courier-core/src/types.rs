//! Core types for Courier

use serde::{Deserialize, Serialize};
use ulid::Ulid;

pub mod contact;
pub mod group;
pub mod message;
pub mod thread;

pub use contact::{AddressBookEntry, BatchOutcome, Contact, ContactOp};
pub use group::{Group, GroupCommand, GroupMember, MemberState, Membership};
pub use message::{
    Attachment, Direction, GroupRef, InboundAttachment, InboundGroup, InboundMessage, Location,
    Message, MessageStatus, NewMessage, GROUP_COMMAND_MIME, LOCATION_MIME, TEXT_MIME,
};
pub use thread::{PrivacyAction, RequestStatus, Thread, ThreadSummary};

/// Stable address of a user or a group.
///
/// Always stored bare (any `/resource` suffix stripped) and lowercased, so two
/// identities compare equal exactly when the server would route them to the
/// same account.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Identity(String);

impl Identity {
    /// Create an identity from a raw address, normalizing it to its bare form
    pub fn new(raw: impl AsRef<str>) -> Self {
        let raw = raw.as_ref().trim();
        let bare = match raw.find('/') {
            Some(idx) => &raw[..idx],
            None => raw,
        };
        Self(bare.to_lowercase())
    }

    /// Derive the identity the server registers for a phone number.
    ///
    /// Only the digits of `number` are hashed, so formatting differences in the
    /// local address book map to the same identity.
    pub fn for_number(number: &str, server: &str) -> Self {
        let digits: String = number.chars().filter(|c| c.is_ascii_digit()).collect();
        let hash = blake3::hash(digits.as_bytes());
        let local = hex::encode(&hash.as_bytes()[..20]);
        Self::new(format!("{}@{}", local, server))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Part before `@`, or the whole identity when there is none
    pub fn local_part(&self) -> &str {
        self.0.split('@').next().unwrap_or(&self.0)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(&self.0)
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Identity({})", self.0)
    }
}

impl From<&str> for Identity {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for Identity {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

/// Local message identifier, allocated monotonically by the repository
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(pub i64);

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

/// Conversation identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ThreadId(pub i64);

impl ThreadId {
    /// Sentinel carried by messages that are not attached to any persisted thread
    pub const NONE: ThreadId = ThreadId(-1);

    pub fn is_none(&self) -> bool {
        *self == Self::NONE
    }
}

impl std::fmt::Display for ThreadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

/// Correlation id for a protocol request and its responses
///
/// Uses ULID so ids are unique without coordination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId(pub Ulid);

impl RequestId {
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Current time in milliseconds since the Unix epoch
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_is_bare_and_lowercase() {
        let id = Identity::new("Alice@Example.org/Phone-1");
        assert_eq!(id.as_str(), "alice@example.org");
        assert_eq!(id.local_part(), "alice");
        assert_eq!(id, Identity::new("alice@example.org"));
    }

    #[test]
    fn test_identity_for_number_ignores_formatting() {
        let a = Identity::for_number("+39 333 123 4567", "example.org");
        let b = Identity::for_number("393331234567", "example.org");
        assert_eq!(a, b);
        assert!(a.as_str().ends_with("@example.org"));
        assert_eq!(a.local_part().len(), 40);
    }

    #[test]
    fn test_thread_none_sentinel() {
        assert!(ThreadId::NONE.is_none());
        assert_eq!(ThreadId::NONE.0, -1);
        assert!(!ThreadId(3).is_none());
    }

    #[test]
    fn test_request_ids_unique() {
        assert_ne!(RequestId::new(), RequestId::new());
    }
}
