//! Thread Storage - conversations and their denormalized summaries

use redb::{ReadableTable, TableDefinition, WriteTransaction};

use crate::error::CourierResult;
use crate::types::{Identity, Message, RequestStatus, Thread, ThreadId, ThreadSummary};

use super::messages::MESSAGES_TABLE;
use super::{decode, encode, next_id, RedbRepository, RepoChange, ThreadStore, NEXT_THREAD_ID};

/// Table for threads (key: thread id, value: serialized Thread)
pub(crate) const THREADS_TABLE: TableDefinition<i64, &[u8]> = TableDefinition::new("threads");

/// Index from peer identity to thread id
pub(crate) const THREAD_PEER_INDEX: TableDefinition<&str, i64> =
    TableDefinition::new("thread_peers");

fn summary_of(message: &Message) -> ThreadSummary {
    ThreadSummary {
        message_id: message.id,
        direction: message.direction,
        status: message.status,
        mime: message.mime.clone(),
        snippet: message.snippet(),
        timestamp: message.timestamp,
    }
}

fn load(txn: &WriteTransaction, id: ThreadId) -> CourierResult<Option<Thread>> {
    let table = txn.open_table(THREADS_TABLE)?;
    let data = table.get(id.0)?.map(|v| v.value().to_vec());
    data.map(|d| decode(&d)).transpose()
}

fn store(txn: &WriteTransaction, thread: &Thread) -> CourierResult<()> {
    let mut table = txn.open_table(THREADS_TABLE)?;
    let data = encode(thread)?;
    table.insert(thread.id.0, data.as_slice())?;
    Ok(())
}

fn remove(txn: &WriteTransaction, thread: &Thread) -> CourierResult<()> {
    {
        let mut table = txn.open_table(THREADS_TABLE)?;
        table.remove(thread.id.0)?;
    }
    let mut index = txn.open_table(THREAD_PEER_INDEX)?;
    index.remove(thread.peer.as_str())?;
    Ok(())
}

/// Count a newly inserted message in its thread. Returns whether a thread was touched.
pub(crate) fn record_insert(txn: &WriteTransaction, message: &Message) -> CourierResult<bool> {
    if message.thread_id.is_none() {
        return Ok(false);
    }
    let Some(mut thread) = load(txn, message.thread_id)? else {
        return Ok(false);
    };
    thread.message_count += 1;
    thread.last_message = Some(summary_of(message));
    store(txn, &thread)?;
    Ok(true)
}

/// Refresh the summary if `message` is the thread's latest. Returns whether a thread was touched.
pub(crate) fn record_update(txn: &WriteTransaction, message: &Message) -> CourierResult<bool> {
    if message.thread_id.is_none() {
        return Ok(false);
    }
    let Some(mut thread) = load(txn, message.thread_id)? else {
        return Ok(false);
    };
    let is_latest = thread
        .last_message
        .as_ref()
        .is_some_and(|s| s.message_id == message.id);
    if !is_latest {
        return Ok(false);
    }
    thread.last_message = Some(summary_of(message));
    store(txn, &thread)?;
    Ok(true)
}

/// Recount a thread from its messages; deletes it when it ends up disposable
pub(crate) fn refresh(txn: &WriteTransaction, id: ThreadId) -> CourierResult<()> {
    let Some(mut thread) = load(txn, id)? else {
        return Ok(());
    };

    let mut count = 0u32;
    let mut latest: Option<Message> = None;
    {
        let table = txn.open_table(MESSAGES_TABLE)?;
        for entry in table.iter()? {
            let (_, data) = entry?;
            let message: Message = decode(data.value())?;
            if message.thread_id == id {
                count += 1;
                latest = Some(message);
            }
        }
    }

    thread.message_count = count;
    thread.last_message = latest.as_ref().map(summary_of);

    if thread.is_disposable() {
        remove(txn, &thread)
    } else {
        store(txn, &thread)
    }
}

impl ThreadStore for RedbRepository {
    fn ensure_thread(&self, peer: &Identity, is_group: bool) -> CourierResult<Thread> {
        self.write(|txn, changes| {
            let existing = {
                let index = txn.open_table(THREAD_PEER_INDEX)?;
                let id = index.get(peer.as_str())?.map(|v| v.value());
                id
            };
            if let Some(id) = existing {
                if let Some(thread) = load(txn, ThreadId(id))? {
                    return Ok(thread);
                }
            }

            let id = ThreadId(next_id(txn, NEXT_THREAD_ID)?);
            let thread = Thread::new(id, peer.clone(), is_group);
            store(txn, &thread)?;
            {
                let mut index = txn.open_table(THREAD_PEER_INDEX)?;
                index.insert(peer.as_str(), id.0)?;
            }
            changes.push(RepoChange::Thread(id));
            Ok(thread)
        })
    }

    fn thread(&self, id: ThreadId) -> CourierResult<Option<Thread>> {
        self.read(|txn| {
            let table = txn.open_table(THREADS_TABLE)?;
            match table.get(id.0)? {
                Some(data) => Ok(Some(decode(data.value())?)),
                None => Ok(None),
            }
        })
    }

    fn thread_for_peer(&self, peer: &Identity) -> CourierResult<Option<Thread>> {
        let id = self.read(|txn| {
            let index = txn.open_table(THREAD_PEER_INDEX)?;
            let id = index.get(peer.as_str())?.map(|v| v.value());
            Ok(id)
        })?;
        match id {
            Some(id) => self.thread(ThreadId(id)),
            None => Ok(None),
        }
    }

    fn threads(&self) -> CourierResult<Vec<Thread>> {
        self.read(|txn| {
            let table = txn.open_table(THREADS_TABLE)?;
            let mut threads = Vec::new();
            for entry in table.iter()? {
                let (_, data) = entry?;
                threads.push(decode(data.value())?);
            }
            Ok(threads)
        })
    }

    fn set_draft(&self, id: ThreadId, draft: Option<String>) -> CourierResult<()> {
        self.write(|txn, changes| {
            let Some(mut thread) = load(txn, id)? else {
                return Ok(());
            };
            thread.draft = draft;
            if thread.is_disposable() {
                remove(txn, &thread)?;
            } else {
                store(txn, &thread)?;
            }
            changes.push(RepoChange::Thread(id));
            Ok(())
        })
    }

    fn set_request_status(&self, id: ThreadId, status: RequestStatus) -> CourierResult<()> {
        self.write(|txn, changes| {
            let Some(mut thread) = load(txn, id)? else {
                return Ok(());
            };
            thread.request_status = status;
            store(txn, &thread)?;
            changes.push(RepoChange::Thread(id));
            Ok(())
        })
    }
}
