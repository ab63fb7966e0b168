//! Conversation threads

use serde::{Deserialize, Serialize};

use super::{Direction, Identity, MessageId, MessageStatus, ThreadId};

/// Reply we owe (or await) for a presence subscription request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestStatus {
    None,
    /// We asked the peer for a subscription and wait for an answer
    WaitingReply,
    /// The user accepted an incoming request; the reply is not sent yet
    ReplyPendingAccept,
    /// The user blocked the peer; the reply is not sent yet
    ReplyPendingBlock,
    /// The user unblocked the peer; the reply is not sent yet
    ReplyPendingUnblock,
}

impl RequestStatus {
    /// The privacy action still to be sent, if any
    pub fn pending_reply(&self) -> Option<PrivacyAction> {
        match self {
            RequestStatus::ReplyPendingAccept => Some(PrivacyAction::Accept),
            RequestStatus::ReplyPendingBlock => Some(PrivacyAction::Block),
            RequestStatus::ReplyPendingUnblock => Some(PrivacyAction::Unblock),
            RequestStatus::None | RequestStatus::WaitingReply => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PrivacyAction {
    Accept,
    Block,
    Unblock,
}

/// Denormalized copy of the latest message of a thread
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadSummary {
    pub message_id: MessageId,
    pub direction: Direction,
    pub status: MessageStatus,
    pub mime: String,
    pub snippet: String,
    pub timestamp: i64,
}

/// A conversation with a peer or a group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Thread {
    pub id: ThreadId,
    pub peer: Identity,
    pub is_group: bool,
    pub request_status: RequestStatus,
    pub draft: Option<String>,
    pub message_count: u32,
    pub last_message: Option<ThreadSummary>,
}

impl Thread {
    pub fn new(id: ThreadId, peer: Identity, is_group: bool) -> Self {
        Self {
            id,
            peer,
            is_group,
            request_status: RequestStatus::None,
            draft: None,
            message_count: 0,
            last_message: None,
        }
    }

    /// A thread with no messages and no draft is removed
    pub fn is_disposable(&self) -> bool {
        self.message_count == 0 && self.draft.as_deref().map_or(true, str::is_empty)
    }
}
