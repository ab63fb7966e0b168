//! Contact Types
//!
//! The local address book ([`AddressBookEntry`]) is the input of a contact
//! sync; [`Contact`] rows are what a sync materializes from the server's
//! answer. Only derived fields of a discovery round ever reach a `Contact`.

use serde::{Deserialize, Serialize};

use super::Identity;

/// A phone-book entry the user has locally
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressBookEntry {
    pub number: String,
    /// Stable key of the entry in the local address book
    pub lookup_key: String,
    pub display_name: Option<String>,
}

/// A contact known to be (or to have been) registered on the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub identity: Identity,
    pub number: String,
    pub lookup_key: Option<String>,
    pub display_name: String,
    pub registered: bool,
    pub status: Option<String>,
    /// Last seen, milliseconds since the epoch
    pub last_seen: Option<i64>,
    pub public_key: Option<Vec<u8>>,
    pub fingerprint: Option<String>,
    pub blocked: bool,
}

impl Contact {
    pub fn new(identity: Identity, number: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            identity,
            number: number.into(),
            lookup_key: None,
            display_name: display_name.into(),
            registered: true,
            status: None,
            last_seen: None,
            public_key: None,
            fingerprint: None,
            blocked: false,
        }
    }
}

/// One materialization step of a contact sync batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContactOp {
    /// Insert or replace a synced contact
    Upsert(Contact),
    /// Write our own profile entry
    Profile(Contact),
}

impl ContactOp {
    pub fn contact(&self) -> &Contact {
        match self {
            ContactOp::Upsert(c) | ContactOp::Profile(c) => c,
        }
    }
}

/// Result of applying a contact batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub applied: usize,
    /// Entries the store refused; the rest of the batch is still committed
    pub skipped: usize,
}
