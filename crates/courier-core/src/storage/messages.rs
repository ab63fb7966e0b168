//! Message Storage - queue entries and received messages
//!
//! Rows are keyed by the numeric message id, so table order is insertion
//! order and every query returns messages ascending by id.

use std::collections::BTreeSet;

use redb::{ReadableTable, TableDefinition};

use crate::error::{CourierError, CourierResult};
use crate::types::{Direction, Identity, Message, MessageId, MessageStatus, NewMessage, ThreadId};

use super::{decode, encode, next_id, threads, MessageStore, RedbRepository, RepoChange, NEXT_MESSAGE_ID};

/// Table for messages (key: message id, value: serialized Message)
pub(crate) const MESSAGES_TABLE: TableDefinition<i64, &[u8]> = TableDefinition::new("messages");

/// Index from (direction, sender-assigned id) to message id.
///
/// Inbound ids are chosen by peers and outbound ids by us, so the two
/// directions are separate key spaces.
pub(crate) const SERVER_ID_INDEX: TableDefinition<(u8, &str), i64> =
    TableDefinition::new("message_server_ids");

fn server_key(direction: Direction, server_id: &str) -> (u8, &str) {
    let tag = match direction {
        Direction::Incoming => 0,
        Direction::Outgoing => 1,
    };
    (tag, server_id)
}

/// Filter for [`MessageStore::query_messages`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageQuery {
    pub direction: Option<Direction>,
    /// Only these statuses, when set
    pub statuses: Option<Vec<MessageStatus>>,
    /// Never these statuses
    pub exclude_statuses: Vec<MessageStatus>,
    pub peer: Option<Identity>,
    pub thread: Option<ThreadId>,
}

impl MessageQuery {
    pub fn outgoing() -> Self {
        Self {
            direction: Some(Direction::Outgoing),
            ..Default::default()
        }
    }

    pub fn incoming() -> Self {
        Self {
            direction: Some(Direction::Incoming),
            ..Default::default()
        }
    }

    pub fn with_status(mut self, status: MessageStatus) -> Self {
        self.statuses.get_or_insert_with(Vec::new).push(status);
        self
    }

    pub fn excluding(mut self, statuses: &[MessageStatus]) -> Self {
        self.exclude_statuses.extend_from_slice(statuses);
        self
    }

    pub fn to_peer(mut self, peer: Identity) -> Self {
        self.peer = Some(peer);
        self
    }

    pub fn in_thread(mut self, thread: ThreadId) -> Self {
        self.thread = Some(thread);
        self
    }

    pub fn matches(&self, message: &Message) -> bool {
        if self.direction.is_some_and(|d| d != message.direction) {
            return false;
        }
        if let Some(statuses) = &self.statuses {
            if !statuses.contains(&message.status) {
                return false;
            }
        }
        if self.exclude_statuses.contains(&message.status) {
            return false;
        }
        if self.peer.as_ref().is_some_and(|p| p != &message.peer) {
            return false;
        }
        if self.thread.is_some_and(|t| t != message.thread_id) {
            return false;
        }
        true
    }
}

impl MessageStore for RedbRepository {
    fn insert_message(&self, new: NewMessage) -> CourierResult<Message> {
        self.write(|txn, changes| {
            let id = MessageId(next_id(txn, NEXT_MESSAGE_ID)?);
            let message = Message {
                id,
                thread_id: new.thread_id,
                peer: new.peer,
                direction: new.direction,
                status: new.status,
                mime: new.mime,
                body: new.body,
                encrypted: new.encrypted,
                security_key: new.security_key,
                attachment: new.attachment,
                location: new.location,
                group: new.group,
                group_command: new.group_command,
                in_reply_to: new.in_reply_to,
                server_id: new.server_id,
                timestamp: new.timestamp,
                status_changed: new.timestamp,
            };

            {
                let mut table = txn.open_table(MESSAGES_TABLE)?;
                let data = encode(&message)?;
                table.insert(id.0, data.as_slice())?;
            }
            if let Some(server_id) = &message.server_id {
                let mut index = txn.open_table(SERVER_ID_INDEX)?;
                index.insert(server_key(message.direction, server_id), id.0)?;
            }
            if threads::record_insert(txn, &message)? {
                changes.push(RepoChange::Thread(message.thread_id));
            }

            changes.push(RepoChange::Message(id));
            Ok(message)
        })
    }

    fn message(&self, id: MessageId) -> CourierResult<Option<Message>> {
        self.read(|txn| {
            let table = txn.open_table(MESSAGES_TABLE)?;
            match table.get(id.0)? {
                Some(data) => Ok(Some(decode(data.value())?)),
                None => Ok(None),
            }
        })
    }

    fn message_by_server_id(
        &self,
        direction: Direction,
        server_id: &str,
    ) -> CourierResult<Option<Message>> {
        self.read(|txn| {
            let index = txn.open_table(SERVER_ID_INDEX)?;
            let Some(id) = index.get(server_key(direction, server_id))?.map(|v| v.value()) else {
                return Ok(None);
            };
            let table = txn.open_table(MESSAGES_TABLE)?;
            match table.get(id)? {
                Some(data) => Ok(Some(decode(data.value())?)),
                None => Ok(None),
            }
        })
    }

    fn update_message(&self, message: &Message) -> CourierResult<()> {
        self.write(|txn, changes| {
            {
                let mut table = txn.open_table(MESSAGES_TABLE)?;
                let exists = table.get(message.id.0)?.is_some();
                if !exists {
                    return Err(CourierError::MessageNotFound(message.id.0));
                }
                let data = encode(message)?;
                table.insert(message.id.0, data.as_slice())?;
            }
            if threads::record_update(txn, message)? {
                changes.push(RepoChange::Thread(message.thread_id));
            }
            changes.push(RepoChange::Message(message.id));
            Ok(())
        })
    }

    fn update_statuses(&self, ids: &[MessageId], status: MessageStatus) -> CourierResult<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        self.write(|txn, changes| {
            let mut updated = Vec::new();
            {
                let mut table = txn.open_table(MESSAGES_TABLE)?;
                let now = crate::types::now_millis();
                for id in ids {
                    let existing = table.get(id.0)?.map(|v| v.value().to_vec());
                    let Some(data) = existing else {
                        continue;
                    };
                    let mut message: Message = decode(&data)?;
                    message.status = status;
                    message.status_changed = now;
                    let data = encode(&message)?;
                    table.insert(id.0, data.as_slice())?;
                    updated.push(message);
                }
            }
            for message in &updated {
                if threads::record_update(txn, message)? {
                    changes.push(RepoChange::Thread(message.thread_id));
                }
                changes.push(RepoChange::Message(message.id));
            }
            Ok(updated.len())
        })
    }

    fn query_messages(&self, query: &MessageQuery) -> CourierResult<Vec<Message>> {
        self.read(|txn| {
            let table = txn.open_table(MESSAGES_TABLE)?;
            let mut result = Vec::new();
            for entry in table.iter()? {
                let (_, data) = entry?;
                let message: Message = decode(data.value())?;
                if query.matches(&message) {
                    result.push(message);
                }
            }
            Ok(result)
        })
    }

    fn delete_messages(&self, ids: &[MessageId]) -> CourierResult<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        self.write(|txn, changes| {
            let mut deleted = 0;
            let mut touched_threads = BTreeSet::new();
            {
                let mut table = txn.open_table(MESSAGES_TABLE)?;
                let mut index = txn.open_table(SERVER_ID_INDEX)?;
                for id in ids {
                    let removed = table.remove(id.0)?.map(|v| v.value().to_vec());
                    let Some(data) = removed else {
                        continue;
                    };
                    let message: Message = decode(&data)?;
                    if let Some(server_id) = &message.server_id {
                        index.remove(server_key(message.direction, server_id))?;
                    }
                    if !message.thread_id.is_none() {
                        touched_threads.insert(message.thread_id);
                    }
                    changes.push(RepoChange::Message(message.id));
                    deleted += 1;
                }
            }
            for thread_id in touched_threads {
                threads::refresh(txn, thread_id)?;
                changes.push(RepoChange::Thread(thread_id));
            }
            Ok(deleted)
        })
    }
}
