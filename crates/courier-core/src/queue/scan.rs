//! Resend scan planning
//!
//! A resend scan is one ordered pass over the persisted outbound messages that
//! decides, per message, whether to dispatch it now, skip it this pass, or
//! delete it. Planning is pure: [`plan_resend`] takes the candidate rows and a
//! membership lookup and returns a [`ScanPlan`]; the worker then publishes and
//! deletes accordingly.
//!
//! ```text
//!   for each candidate, ascending id:
//!     thread stalled by an earlier group command?  ──► skip (Stalled)
//!     group command?                               ──► stall its thread
//!     group with no live members?
//!        thread is the NONE sentinel               ──► delete (ghost)
//!        otherwise                                 ──► skip (EmptyGroup)
//!     media not uploaded, no upload service?       ──► skip (AwaitingUploadService)
//!     media not uploaded                           ──► Upload
//!     otherwise                                    ──► Send
//! ```
//!
//! Stalls only live for one pass; nothing about them is persisted.

use std::collections::HashSet;

use crate::types::{Direction, Identity, Message, MessageId, MessageStatus, ThreadId};

/// Statuses a scan never picks up
pub const IN_FLIGHT_OR_TERMINAL: [MessageStatus; 4] = [
    MessageStatus::Sent,
    MessageStatus::Received,
    MessageStatus::NotDelivered,
    MessageStatus::Queued,
];

/// What a scan should consider
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanOptions {
    /// Media retry after an upload service was discovered: only un-uploaded media qualify
    pub retrying_media: bool,
    /// Include messages held in PENDING for user review
    pub force_pending: bool,
    /// Only messages to this peer, directly or through group membership
    pub peer: Option<Identity>,
}

impl ScanOptions {
    pub fn media_retry() -> Self {
        Self {
            retrying_media: true,
            ..Default::default()
        }
    }

    pub fn for_peer(peer: Identity) -> Self {
        Self {
            peer: Some(peer),
            ..Default::default()
        }
    }

    pub fn forced(mut self) -> Self {
        self.force_pending = true;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// An earlier group command in the same thread has not round-tripped
    Stalled,
    /// The group has no live members yet; the message is kept
    EmptyGroup,
    /// Media must be uploaded but no upload service is known this session
    AwaitingUploadService,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Send(MessageId),
    Upload(MessageId),
}

impl Dispatch {
    pub fn id(&self) -> MessageId {
        match self {
            Dispatch::Send(id) | Dispatch::Upload(id) => *id,
        }
    }
}

/// Outcome of planning one scan
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanPlan {
    pub dispatch: Vec<Dispatch>,
    pub skipped: Vec<(MessageId, SkipReason)>,
    /// Ghost messages to delete once the pass is over
    pub delete: Vec<MessageId>,
}

/// Whether the status and media state of `message` qualify it for a scan
pub fn is_candidate(message: &Message, options: &ScanOptions) -> bool {
    if message.direction != Direction::Outgoing {
        return false;
    }
    if IN_FLIGHT_OR_TERMINAL.contains(&message.status) {
        return false;
    }
    if message.status == MessageStatus::Pending && !options.force_pending {
        return false;
    }
    // Inbound-only statuses
    if matches!(
        message.status,
        MessageStatus::Incoming | MessageStatus::Confirmed
    ) {
        return false;
    }

    match &message.attachment {
        None => !options.retrying_media,
        Some(attachment) if options.retrying_media => attachment.needs_upload(),
        Some(attachment) => attachment.remote.is_some(),
    }
}

fn addressed_to<F>(message: &Message, peer: &Identity, members_of: &F) -> bool
where
    F: Fn(&Identity) -> Vec<Identity>,
{
    if &message.peer == peer {
        return true;
    }
    match &message.group {
        Some(group) => members_of(&group.id).contains(peer),
        None => false,
    }
}

/// Plan one resend pass over `messages`.
///
/// `members_of` returns the live members of a group (empty for unknown groups).
/// Messages are filtered with [`is_candidate`] and the peer filter, then
/// processed in ascending id order.
pub fn plan_resend<F>(
    messages: &[Message],
    options: &ScanOptions,
    upload_available: bool,
    members_of: F,
) -> ScanPlan
where
    F: Fn(&Identity) -> Vec<Identity>,
{
    let mut candidates: Vec<&Message> = messages
        .iter()
        .filter(|m| is_candidate(m, options))
        .filter(|m| match &options.peer {
            Some(peer) => addressed_to(m, peer, &members_of),
            None => true,
        })
        .collect();
    candidates.sort_by_key(|m| m.id);

    let mut plan = ScanPlan::default();
    let mut stalled: HashSet<ThreadId> = HashSet::new();

    for message in candidates {
        let thread = message.thread_id;

        if stalled.contains(&thread) {
            plan.skipped.push((message.id, SkipReason::Stalled));
            continue;
        }

        // The sentinel is not a real thread: detached messages never stall each other
        if message.is_group_command() && !thread.is_none() {
            stalled.insert(thread);
        }

        if let Some(group) = &message.group {
            if members_of(&group.id).is_empty() {
                if thread.is_none() {
                    plan.delete.push(message.id);
                } else {
                    plan.skipped.push((message.id, SkipReason::EmptyGroup));
                }
                continue;
            }
        }

        if message.needs_upload() {
            if upload_available {
                plan.dispatch.push(Dispatch::Upload(message.id));
            } else {
                plan.skipped
                    .push((message.id, SkipReason::AwaitingUploadService));
            }
            continue;
        }

        plan.dispatch.push(Dispatch::Send(message.id));
    }

    plan
}
