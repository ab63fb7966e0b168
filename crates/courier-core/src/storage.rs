//! Persistent storage using redb.
//!
//! The rest of the crate sees storage only through the [`Repository`] traits:
//! - [`MessageStore`]: outbound queue and inbound messages
//! - [`ThreadStore`]: conversations and their denormalized summaries
//! - [`GroupStore`]: groups and their members
//! - [`ContactStore`]: local address book, synced contacts, own profile
//!
//! [`RedbRepository`] implements all of them on top of a single redb file with
//! postcard-encoded rows. Every multi-row write runs in one write transaction;
//! an error anywhere drops the transaction, which rolls it back. Change
//! notifications are broadcast only after a successful commit.

use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use redb::{Database, ReadTransaction, ReadableTable, TableDefinition, WriteTransaction};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::{CourierError, CourierResult};
use crate::types::{
    AddressBookEntry, BatchOutcome, Contact, ContactOp, Direction, Group, Identity, Message,
    MessageId, MessageStatus, NewMessage, RequestStatus, Thread, ThreadId,
};

// Submodules
mod contacts;
mod groups;
mod messages;
mod threads;

pub use messages::MessageQuery;

use contacts::{ADDRESS_BOOK_TABLE, CONTACTS_TABLE, PROFILE_TABLE};
use groups::GROUPS_TABLE;
use messages::{MESSAGES_TABLE, SERVER_ID_INDEX};
use threads::{THREADS_TABLE, THREAD_PEER_INDEX};

/// Counters and flags (key: name, value: integer)
const META_TABLE: TableDefinition<&str, i64> = TableDefinition::new("meta");

const NEXT_MESSAGE_ID: &str = "next_message_id";
const NEXT_THREAD_ID: &str = "next_thread_id";
const RESYNC_PENDING: &str = "resync_pending";

/// Capacity of the change notification channel
const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// A logical resource changed by a committed write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepoChange {
    Message(MessageId),
    Thread(ThreadId),
    Group(Identity),
    Contacts,
}

// ═══════════════════════════════════════════════════════════════════════
// Repository contract
// ═══════════════════════════════════════════════════════════════════════

/// Messages, in and out
pub trait MessageStore: Send + Sync {
    /// Insert a message, allocating the next id. Attached threads get their
    /// message count and summary refreshed.
    fn insert_message(&self, new: NewMessage) -> CourierResult<Message>;

    fn message(&self, id: MessageId) -> CourierResult<Option<Message>>;

    /// Look up a message by its sender-assigned id within one direction
    fn message_by_server_id(
        &self,
        direction: Direction,
        server_id: &str,
    ) -> CourierResult<Option<Message>>;

    /// Replace a stored message. Fails with `MessageNotFound` if it is gone.
    fn update_message(&self, message: &Message) -> CourierResult<()>;

    /// Set the status of several messages in one transaction; returns how many existed
    fn update_statuses(&self, ids: &[MessageId], status: MessageStatus) -> CourierResult<usize>;

    /// Messages matching `query`, ascending by id
    fn query_messages(&self, query: &MessageQuery) -> CourierResult<Vec<Message>>;

    /// Delete messages in one transaction; threads left empty without a draft are deleted too
    fn delete_messages(&self, ids: &[MessageId]) -> CourierResult<usize>;
}

/// Conversations
pub trait ThreadStore: Send + Sync {
    /// Thread for `peer`, created if missing
    fn ensure_thread(&self, peer: &Identity, is_group: bool) -> CourierResult<Thread>;

    fn thread(&self, id: ThreadId) -> CourierResult<Option<Thread>>;

    fn thread_for_peer(&self, peer: &Identity) -> CourierResult<Option<Thread>>;

    fn threads(&self) -> CourierResult<Vec<Thread>>;

    /// Set or clear the draft. Clearing the draft of an empty thread deletes it.
    fn set_draft(&self, id: ThreadId, draft: Option<String>) -> CourierResult<()>;

    fn set_request_status(&self, id: ThreadId, status: RequestStatus) -> CourierResult<()>;
}

/// Groups and memberships
pub trait GroupStore: Send + Sync {
    fn save_group(&self, group: &Group) -> CourierResult<()>;

    fn group(&self, id: &Identity) -> CourierResult<Option<Group>>;

    fn groups(&self) -> CourierResult<Vec<Group>>;
}

/// Address book, synced contacts and own profile
pub trait ContactStore: Send + Sync {
    fn add_address_book_entry(&self, entry: &AddressBookEntry) -> CourierResult<()>;

    /// Local entries a contact sync should look up
    fn sync_candidates(&self) -> CourierResult<Vec<AddressBookEntry>>;

    /// Mark the contact table as being resynced
    fn begin_resync(&self) -> CourierResult<()>;

    fn is_resync_pending(&self) -> CourierResult<bool>;

    /// Remove every contact materialized by a previous sync; returns how many
    fn delete_synced_contacts(&self) -> CourierResult<usize>;

    /// Apply materialization ops in one transaction. Invalid ops are skipped
    /// and counted; the valid ones are committed.
    fn apply_contact_batch(&self, ops: &[ContactOp]) -> CourierResult<BatchOutcome>;

    /// Clear the resync mark
    fn commit_resync(&self) -> CourierResult<()>;

    fn contact(&self, identity: &Identity) -> CourierResult<Option<Contact>>;

    fn contacts(&self) -> CourierResult<Vec<Contact>>;

    fn profile(&self) -> CourierResult<Option<Contact>>;

    /// Flag a known contact as registered. Returns false when there is no such contact.
    fn mark_registered(&self, identity: &Identity) -> CourierResult<bool>;
}

/// The full transactional store shared by every component
pub trait Repository: MessageStore + ThreadStore + GroupStore + ContactStore + 'static {
    /// Stream of changes, delivered after each commit
    fn changes(&self) -> broadcast::Receiver<RepoChange>;
}

// ═══════════════════════════════════════════════════════════════════════
// redb implementation
// ═══════════════════════════════════════════════════════════════════════

/// Repository backed by a redb database file
#[derive(Clone)]
pub struct RedbRepository {
    db: Arc<RwLock<Database>>,
    change_tx: broadcast::Sender<RepoChange>,
}

impl RedbRepository {
    /// Open (or create) the database at `path` and make sure every table exists
    pub fn open(path: impl AsRef<Path>) -> CourierResult<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::create(path)?;

        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(META_TABLE)?;
            let _ = write_txn.open_table(MESSAGES_TABLE)?;
            let _ = write_txn.open_table(SERVER_ID_INDEX)?;
            let _ = write_txn.open_table(THREADS_TABLE)?;
            let _ = write_txn.open_table(THREAD_PEER_INDEX)?;
            let _ = write_txn.open_table(GROUPS_TABLE)?;
            let _ = write_txn.open_table(CONTACTS_TABLE)?;
            let _ = write_txn.open_table(PROFILE_TABLE)?;
            let _ = write_txn.open_table(ADDRESS_BOOK_TABLE)?;
        }
        write_txn.commit()?;

        debug!(path = %path.display(), "Repository opened");

        let (change_tx, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Ok(Self {
            db: Arc::new(RwLock::new(db)),
            change_tx,
        })
    }

    /// Run `f` inside one write transaction, commit, then announce the changes it recorded.
    ///
    /// Returning an error from `f` drops the transaction uncommitted.
    fn write<T>(
        &self,
        f: impl FnOnce(&WriteTransaction, &mut Vec<RepoChange>) -> CourierResult<T>,
    ) -> CourierResult<T> {
        let mut changes = Vec::new();
        let result = {
            let db = self.db.read();
            let txn = db.begin_write()?;
            let result = f(&txn, &mut changes)?;
            txn.commit()?;
            result
        };

        for change in changes {
            // Nobody listening is fine.
            let _ = self.change_tx.send(change);
        }
        Ok(result)
    }

    fn read<T>(&self, f: impl FnOnce(&ReadTransaction) -> CourierResult<T>) -> CourierResult<T> {
        let db = self.db.read();
        let txn = db.begin_read()?;
        f(&txn)
    }
}

impl Repository for RedbRepository {
    fn changes(&self) -> broadcast::Receiver<RepoChange> {
        self.change_tx.subscribe()
    }
}

/// Allocate the next value of a monotonic counter (first value is 1)
fn next_id(txn: &WriteTransaction, counter: &str) -> CourierResult<i64> {
    let mut meta = txn.open_table(META_TABLE)?;
    let next = meta.get(counter)?.map(|v| v.value()).unwrap_or(1);
    meta.insert(counter, next + 1)?;
    Ok(next)
}

pub(crate) fn encode<T: Serialize>(value: &T) -> CourierResult<Vec<u8>> {
    postcard::to_allocvec(value).map_err(|e| CourierError::Serialization(e.to_string()))
}

pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> CourierResult<T> {
    postcard::from_bytes(bytes).map_err(|e| CourierError::Serialization(e.to_string()))
}
