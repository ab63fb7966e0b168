//! Serialized worker behind [`MessageQueue`](super::MessageQueue)

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::scan::{plan_resend, Dispatch, ScanOptions, ScanPlan, IN_FLIGHT_OR_TERMINAL};
use super::{BinaryContent, Command, Notifier};
use crate::bus::{BusEvent, EventBus};
use crate::config::CourierConfig;
use crate::crypto::CryptoProvider;
use crate::error::{CourierError, CourierResult};
use crate::storage::{MessageQuery, Repository};
use crate::types::{
    Attachment, GroupRef, Identity, Location, Message, MessageId, MessageStatus, NewMessage,
    PrivacyAction, RequestId, RequestStatus, Thread, ThreadId, LOCATION_MIME, TEXT_MIME,
};

pub(crate) struct Worker {
    pub(super) repo: Arc<dyn Repository>,
    pub(super) bus: EventBus,
    pub(super) crypto: Arc<dyn CryptoProvider>,
    pub(super) notifier: Arc<dyn Notifier>,
    pub(super) config: CourierConfig,
    /// An upload service was discovered during this connection
    upload_service: bool,
    connected: bool,
}

impl Worker {
    pub(super) fn new(
        repo: Arc<dyn Repository>,
        bus: EventBus,
        crypto: Arc<dyn CryptoProvider>,
        notifier: Arc<dyn Notifier>,
        config: CourierConfig,
    ) -> Self {
        Self {
            repo,
            bus,
            crypto,
            notifier,
            config,
            upload_service: false,
            connected: false,
        }
    }

    pub(super) async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = rx.recv().await {
            if matches!(command, Command::Shutdown) {
                break;
            }
            self.handle(command);
        }
        info!("Message queue worker stopped");
    }

    fn handle(&mut self, command: Command) {
        // A caller that went away does not care about the answer.
        match command {
            Command::SendText {
                thread,
                text,
                in_reply_to,
                reply,
            } => {
                let _ = reply.send(self.send_text(thread, text, in_reply_to));
            }
            Command::SendLocation {
                thread,
                location,
                reply,
            } => {
                let _ = reply.send(self.send_location(thread, location));
            }
            Command::SendBinary {
                thread,
                content,
                reply,
            } => {
                let _ = reply.send(self.send_binary(thread, content));
            }
            Command::CreateGroup {
                group,
                members,
                subject,
                reply,
            } => {
                let _ = reply.send(self.create_group(group, members, subject));
            }
            Command::AddGroupMembers {
                group,
                members,
                reply,
            } => {
                let _ = reply.send(self.add_group_members(&group, members));
            }
            Command::RemoveGroupMembers {
                group,
                members,
                reply,
            } => {
                let _ = reply.send(self.remove_group_members(&group, members));
            }
            Command::SetGroupSubject {
                group,
                subject,
                reply,
            } => {
                let _ = reply.send(self.set_group_subject(&group, subject));
            }
            Command::LeaveGroup { group, reply } => {
                let _ = reply.send(self.leave_group(&group));
            }
            Command::RetryMessage { id, reply } => {
                let _ = reply.send(self.retry_message(id));
            }
            Command::RetryMessagesTo { peer, reply } => {
                let _ = reply.send(self.retry_messages_to(&peer));
            }
            Command::RetryAll { reply } => {
                let _ = reply.send(self.retry_all());
            }
            Command::ReplySubscription {
                thread,
                action,
                reply,
            } => {
                let _ = reply.send(self.reply_subscription(thread, action));
            }
            Command::Incoming { message, reply } => {
                let _ = reply.send(self.incoming(*message));
            }
            Command::Resend { options, reply } => {
                let result = self.resend(options);
                match reply {
                    Some(reply) => {
                        let _ = reply.send(result);
                    }
                    None => {
                        if let Err(e) = result {
                            warn!(error = %e, "Resend scan failed");
                        }
                    }
                }
            }
            Command::Event(event) => self.on_event(event),
            Command::Shutdown => {}
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Composing
    // ═══════════════════════════════════════════════════════════════════════

    fn load_thread(&self, id: ThreadId) -> CourierResult<Thread> {
        self.repo
            .thread(id)?
            .ok_or_else(|| CourierError::InvalidOperation(format!("unknown thread {}", id)))
    }

    /// Base values for a new outbound message in `thread`
    fn compose(&self, thread: &Thread, mime: &str) -> CourierResult<NewMessage> {
        let mut new = NewMessage::outgoing(thread.id, thread.peer.clone(), mime);
        if thread.is_group {
            let group = self
                .repo
                .group(&thread.peer)?
                .ok_or_else(|| CourierError::GroupNotFound(thread.peer.to_string()))?;
            new.group = Some(GroupRef {
                id: group.id,
                owner: group.owner,
            });
        }
        new.encrypted = self.config.encryption_enabled;
        new.server_id = Some(RequestId::new().to_string());
        if thread.request_status == RequestStatus::WaitingReply {
            new.status = MessageStatus::Pending;
        }
        Ok(new)
    }

    fn send_text(
        &mut self,
        thread: ThreadId,
        text: String,
        in_reply_to: Option<MessageId>,
    ) -> CourierResult<MessageId> {
        let thread = self.load_thread(thread)?;
        let mut new = self.compose(&thread, TEXT_MIME)?.with_body(text);
        new.in_reply_to = in_reply_to;

        let message = self.repo.insert_message(new)?;
        debug!(id = %message.id, thread = %thread.id, "Text message queued");
        self.dispatch_fresh(&message)?;
        Ok(message.id)
    }

    fn send_location(&mut self, thread: ThreadId, location: Location) -> CourierResult<MessageId> {
        let thread = self.load_thread(thread)?;
        let body = location.text.clone().unwrap_or_default();
        let mut new = self.compose(&thread, LOCATION_MIME)?.with_body(body);
        new.location = Some(location);

        let message = self.repo.insert_message(new)?;
        debug!(id = %message.id, thread = %thread.id, "Location message queued");
        self.dispatch_fresh(&message)?;
        Ok(message.id)
    }

    fn send_binary(&mut self, thread: ThreadId, content: BinaryContent) -> CourierResult<MessageId> {
        let thread = self.load_thread(thread)?;
        let attachment = Attachment {
            mime: content.mime.clone(),
            local: Some(content.locator),
            remote: None,
            preview: None,
            length: content.length,
            encrypted: self.config.encryption_enabled,
        };
        let new = self
            .compose(&thread, &content.mime)?
            .with_attachment(attachment);

        let message = self.repo.insert_message(new)?;
        debug!(id = %message.id, thread = %thread.id, mime = %content.mime, "Binary message queued");

        if content.is_media {
            let compression = if content.mime.starts_with("image/") {
                self.config.image_compression
            } else {
                0
            };
            self.bus.publish(BusEvent::PrepareMediaRequest {
                id: message.id,
                compression,
            });
        } else {
            self.dispatch_fresh(&message)?;
        }
        Ok(message.id)
    }

    /// Whether an earlier group command in the message's thread is still unacknowledged
    pub(super) fn thread_stalled(&self, message: &Message) -> CourierResult<bool> {
        if message.thread_id.is_none() {
            return Ok(false);
        }
        let earlier = self
            .repo
            .query_messages(&MessageQuery::outgoing().in_thread(message.thread_id))?;
        Ok(earlier.iter().any(|m| {
            m.id < message.id && m.is_group_command() && !m.status.is_acknowledged()
        }))
    }

    /// First dispatch of a message right after it was persisted
    pub(super) fn dispatch_fresh(&mut self, message: &Message) -> CourierResult<()> {
        if message.status == MessageStatus::Pending {
            debug!(id = %message.id, "Message held for review");
            return Ok(());
        }
        if self.thread_stalled(message)? {
            debug!(id = %message.id, thread = %message.thread_id, "Message waits for group command");
            return Ok(());
        }
        if message.needs_upload() {
            if self.upload_service {
                self.bus
                    .publish(BusEvent::UploadAttachmentRequest { id: message.id });
            } else {
                debug!(id = %message.id, "No upload service yet, media delayed");
            }
            return Ok(());
        }
        self.bus
            .publish(BusEvent::SendMessageRequest { id: message.id });
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Retry and resend
    // ═══════════════════════════════════════════════════════════════════════

    fn retry_message(&mut self, id: MessageId) -> CourierResult<usize> {
        let message = self
            .repo
            .message(id)?
            .ok_or(CourierError::MessageNotFound(id.0))?;
        self.repo.update_statuses(&[id], MessageStatus::Sending)?;
        info!(%id, peer = %message.peer, "Retrying message");
        // Everything else pending for the same peer goes out with it.
        self.resend(ScanOptions::for_peer(message.peer))?;
        Ok(1)
    }

    fn retry_messages_to(&mut self, peer: &Identity) -> CourierResult<usize> {
        let pending = self.repo.query_messages(
            &MessageQuery::outgoing()
                .with_status(MessageStatus::Pending)
                .to_peer(peer.clone()),
        )?;
        let ids: Vec<MessageId> = pending.iter().map(|m| m.id).collect();
        let count = self.repo.update_statuses(&ids, MessageStatus::Sending)?;
        info!(%peer, count, "Retrying messages to peer");
        self.resend(ScanOptions::for_peer(peer.clone()))?;
        Ok(count)
    }

    fn retry_all(&mut self) -> CourierResult<usize> {
        let pending = self
            .repo
            .query_messages(&MessageQuery::outgoing().with_status(MessageStatus::Pending))?;
        let ids: Vec<MessageId> = pending.iter().map(|m| m.id).collect();
        let count = self.repo.update_statuses(&ids, MessageStatus::Sending)?;
        info!(count, "Retrying all pending messages");
        self.resend(ScanOptions::default())?;
        Ok(count)
    }

    /// Run one resend scan: plan, publish, then delete ghosts
    pub(super) fn resend(&mut self, options: ScanOptions) -> CourierResult<ScanPlan> {
        let messages = self
            .repo
            .query_messages(&MessageQuery::outgoing().excluding(&IN_FLIGHT_OR_TERMINAL))?;

        let mut members: HashMap<Identity, Vec<Identity>> = HashMap::new();
        for message in &messages {
            if let Some(group) = &message.group {
                if !members.contains_key(&group.id) {
                    let live = self
                        .repo
                        .group(&group.id)?
                        .map(|g| g.live_members())
                        .unwrap_or_default();
                    members.insert(group.id.clone(), live);
                }
            }
        }

        let plan = plan_resend(&messages, &options, self.upload_service, |group| {
            members.get(group).cloned().unwrap_or_default()
        });

        for (id, reason) in &plan.skipped {
            debug!(%id, ?reason, "Resend skipped");
        }
        for dispatch in &plan.dispatch {
            match dispatch {
                Dispatch::Send(id) => {
                    debug!(%id, "Resending message");
                    self.bus.publish(BusEvent::SendMessageRequest { id: *id });
                }
                Dispatch::Upload(id) => {
                    debug!(%id, "Resending attachment upload");
                    self.bus
                        .publish(BusEvent::UploadAttachmentRequest { id: *id });
                }
            }
        }
        if !plan.delete.is_empty() {
            let deleted = self.repo.delete_messages(&plan.delete)?;
            info!(deleted, "Deleted messages of empty detached groups");
        }

        info!(
            dispatched = plan.dispatch.len(),
            skipped = plan.skipped.len(),
            deleted = plan.delete.len(),
            retrying_media = options.retrying_media,
            "Resend scan complete"
        );
        Ok(plan)
    }

    /// Re-request delivery receipts we still owe
    fn resend_receipts(&self) -> CourierResult<()> {
        let owed = self
            .repo
            .query_messages(&MessageQuery::incoming().with_status(MessageStatus::Received))?;
        for message in &owed {
            debug!(id = %message.id, "Resending pending receipt");
            self.bus
                .publish(BusEvent::SendDeliveryReceiptRequest { id: message.id });
        }
        Ok(())
    }

    /// Send subscription replies the user gave while we were offline
    fn send_subscription_replies(&self) -> CourierResult<()> {
        for thread in self.repo.threads()? {
            let Some(action) = thread.request_status.pending_reply() else {
                continue;
            };
            debug!(peer = %thread.peer, ?action, "Sending pending subscription reply");
            self.bus.publish(BusEvent::SetUserPrivacyRequest {
                identity: thread.peer.clone(),
                action,
            });
            self.repo
                .set_request_status(thread.id, RequestStatus::None)?;
        }
        Ok(())
    }

    fn reply_subscription(&mut self, thread: ThreadId, action: PrivacyAction) -> CourierResult<()> {
        let thread = self.load_thread(thread)?;
        let status = match action {
            PrivacyAction::Accept => RequestStatus::ReplyPendingAccept,
            PrivacyAction::Block => RequestStatus::ReplyPendingBlock,
            PrivacyAction::Unblock => RequestStatus::ReplyPendingUnblock,
        };
        self.repo.set_request_status(thread.id, status)?;
        if self.connected {
            self.send_subscription_replies()?;
        }
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Bus events
    // ═══════════════════════════════════════════════════════════════════════

    fn on_event(&mut self, event: BusEvent) {
        let name = event.name();
        if let Err(e) = self.apply_event(event) {
            warn!(event = name, error = %e, "Failed to handle bus event");
        }
    }

    pub(super) fn apply_event(&mut self, event: BusEvent) -> CourierResult<()> {
        match event {
            BusEvent::Connected => {
                self.connected = true;
                self.resend(ScanOptions::default())?;
                self.resend_receipts()?;
                self.send_subscription_replies()?;
            }
            BusEvent::Disconnected => {
                self.connected = false;
                self.upload_service = false;
            }
            BusEvent::RosterLoaded => {
                self.resend(ScanOptions::default())?;
                self.resend_receipts()?;
            }
            BusEvent::UploadServiceFound => {
                self.upload_service = true;
                self.resend(ScanOptions::media_retry())?;
            }
            BusEvent::GroupCreated { group } => {
                self.resend(ScanOptions::for_peer(group))?;
            }
            BusEvent::UserSubscribed { identity } => {
                if let Some(thread) = self.repo.thread_for_peer(&identity)? {
                    if thread.request_status == RequestStatus::WaitingReply {
                        self.repo
                            .set_request_status(thread.id, RequestStatus::None)?;
                    }
                }
                self.resend(ScanOptions::for_peer(identity).forced())?;
            }
            BusEvent::MessageSent { id } => {
                if let Some(message) = self.advance(id, MessageStatus::Sent)? {
                    if message.is_group_command() {
                        // Release whatever the command was holding back.
                        self.resend(ScanOptions::for_peer(message.peer))?;
                    }
                }
            }
            BusEvent::MessageDelivered { id } => {
                self.advance(id, MessageStatus::Received)?;
            }
            BusEvent::MessageFailed { id } => {
                self.advance(id, MessageStatus::Error)?;
            }
            BusEvent::DeliveryReceiptSent { id } => {
                self.advance(id, MessageStatus::Confirmed)?;
            }
            BusEvent::UploadCompleted { id, remote } => self.upload_completed(id, remote)?,
            BusEvent::MediaPrepared {
                id,
                preview,
                length,
            } => self.media_prepared(id, preview, length)?,
            other => debug!(event = other.name(), "Ignoring bus event"),
        }
        Ok(())
    }

    /// Move a message forward to `status`. Returns the updated message, or
    /// `None` when it is gone or the update would move it backwards.
    fn advance(&self, id: MessageId, status: MessageStatus) -> CourierResult<Option<Message>> {
        let Some(mut message) = self.repo.message(id)? else {
            debug!(%id, %status, "Status update for unknown message");
            return Ok(None);
        };
        if !message.status.can_transition_to(status) {
            debug!(%id, from = %message.status, to = %status, "Ignoring non-monotonic status update");
            return Ok(None);
        }
        message.status = status;
        message.status_changed = crate::types::now_millis();
        self.repo.update_message(&message)?;
        debug!(%id, %status, "Message status updated");
        Ok(Some(message))
    }

    fn upload_completed(&mut self, id: MessageId, remote: String) -> CourierResult<()> {
        let Some(mut message) = self.repo.message(id)? else {
            debug!(%id, "Upload completed for unknown message");
            return Ok(());
        };
        let Some(attachment) = message.attachment.as_mut() else {
            warn!(%id, "Upload completed for message without attachment");
            return Ok(());
        };
        attachment.remote = Some(remote);
        self.repo.update_message(&message)?;
        info!(%id, "Attachment uploaded, sending message");
        self.bus.publish(BusEvent::SendMessageRequest { id });
        Ok(())
    }

    fn media_prepared(
        &mut self,
        id: MessageId,
        preview: Option<String>,
        length: u64,
    ) -> CourierResult<()> {
        let Some(mut message) = self.repo.message(id)? else {
            debug!(%id, "Media prepared for unknown message");
            return Ok(());
        };
        if let Some(attachment) = message.attachment.as_mut() {
            attachment.preview = preview;
            if length > 0 {
                attachment.length = length;
            }
        }
        self.repo.update_message(&message)?;
        debug!(%id, length, "Media prepared");
        if !message.status.is_in_flight_or_terminal() {
            self.dispatch_fresh(&message)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::PlaintextCrypto;
    use crate::queue::NoopNotifier;
    use crate::storage::RedbRepository;
    use tempfile::tempdir;
    use tokio::sync::mpsc;

    fn worker() -> (tempfile::TempDir, Worker, mpsc::UnboundedReceiver<BusEvent>) {
        let dir = tempdir().unwrap();
        let repo = Arc::new(RedbRepository::open(dir.path().join("courier.redb")).unwrap());
        let bus = EventBus::new();
        let rx = bus.subscribe();
        let config = CourierConfig::new(Identity::new("me@x"), "x");
        let worker = Worker::new(
            repo,
            bus,
            Arc::new(PlaintextCrypto),
            Arc::new(NoopNotifier),
            config,
        );
        (dir, worker, rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<BusEvent>) -> Vec<BusEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_send_text_dispatches_immediately() {
        let (_dir, mut worker, mut rx) = worker();
        let bob = Identity::new("bob@x");
        let thread = worker.repo.ensure_thread(&bob, false).unwrap();

        let id = worker.send_text(thread.id, "hello".into(), None).unwrap();
        assert_eq!(drain(&mut rx), vec![BusEvent::SendMessageRequest { id }]);

        let stored = worker.repo.message(id).unwrap().unwrap();
        assert_eq!(stored.status, MessageStatus::Sending);
        assert_eq!(stored.text(), Some("hello"));
        assert!(stored.server_id.is_some());
    }

    #[test]
    fn test_send_to_waiting_peer_is_held_pending() {
        let (_dir, mut worker, mut rx) = worker();
        let bob = Identity::new("bob@x");
        let thread = worker.repo.ensure_thread(&bob, false).unwrap();
        worker
            .repo
            .set_request_status(thread.id, RequestStatus::WaitingReply)
            .unwrap();

        let id = worker.send_text(thread.id, "hi".into(), None).unwrap();
        assert!(drain(&mut rx).is_empty());
        assert_eq!(
            worker.repo.message(id).unwrap().unwrap().status,
            MessageStatus::Pending
        );

        worker
            .apply_event(BusEvent::UserSubscribed {
                identity: bob.clone(),
            })
            .unwrap();
        assert_eq!(drain(&mut rx), vec![BusEvent::SendMessageRequest { id }]);
    }

    #[test]
    fn test_unknown_thread_is_an_error() {
        let (_dir, mut worker, _rx) = worker();
        let err = worker.send_text(ThreadId(42), "x".into(), None).unwrap_err();
        assert!(matches!(err, CourierError::InvalidOperation(_)));
    }

    #[test]
    fn test_media_waits_for_preparation_and_upload_service() {
        let (_dir, mut worker, mut rx) = worker();
        let bob = Identity::new("bob@x");
        let thread = worker.repo.ensure_thread(&bob, false).unwrap();

        let id = worker
            .send_binary(
                thread.id,
                BinaryContent {
                    locator: "/sdcard/cat.jpg".into(),
                    mime: "image/jpeg".into(),
                    length: 4096,
                    is_media: true,
                },
            )
            .unwrap();
        assert_eq!(
            drain(&mut rx),
            vec![BusEvent::PrepareMediaRequest { id, compression: 0 }]
        );

        worker
            .apply_event(BusEvent::MediaPrepared {
                id,
                preview: Some("/cache/cat.thumb".into()),
                length: 2048,
            })
            .unwrap();
        assert!(drain(&mut rx).is_empty());

        worker.apply_event(BusEvent::UploadServiceFound).unwrap();
        assert_eq!(
            drain(&mut rx),
            vec![BusEvent::UploadAttachmentRequest { id }]
        );

        worker
            .apply_event(BusEvent::UploadCompleted {
                id,
                remote: "https://media/cat".into(),
            })
            .unwrap();
        assert_eq!(drain(&mut rx), vec![BusEvent::SendMessageRequest { id }]);

        let stored = worker.repo.message(id).unwrap().unwrap();
        let attachment = stored.attachment.unwrap();
        assert_eq!(attachment.remote.as_deref(), Some("https://media/cat"));
        assert_eq!(attachment.length, 2048);
    }

    #[test]
    fn test_acks_are_monotonic() {
        let (_dir, mut worker, _rx) = worker();
        let bob = Identity::new("bob@x");
        let thread = worker.repo.ensure_thread(&bob, false).unwrap();
        let id = worker.send_text(thread.id, "x".into(), None).unwrap();

        worker.apply_event(BusEvent::MessageDelivered { id }).unwrap();
        worker.apply_event(BusEvent::MessageSent { id }).unwrap();
        worker.apply_event(BusEvent::MessageFailed { id }).unwrap();

        assert_eq!(
            worker.repo.message(id).unwrap().unwrap().status,
            MessageStatus::Received
        );
    }

    #[test]
    fn test_retry_resets_failed_message() {
        let (_dir, mut worker, mut rx) = worker();
        let bob = Identity::new("bob@x");
        let thread = worker.repo.ensure_thread(&bob, false).unwrap();
        let id = worker.send_text(thread.id, "x".into(), None).unwrap();
        worker.apply_event(BusEvent::MessageSent { id }).unwrap();
        drain(&mut rx);

        worker.retry_message(id).unwrap();
        assert_eq!(
            worker.repo.message(id).unwrap().unwrap().status,
            MessageStatus::Sending
        );
        assert_eq!(drain(&mut rx), vec![BusEvent::SendMessageRequest { id }]);

        let err = worker.retry_message(MessageId(999)).unwrap_err();
        assert!(matches!(err, CourierError::MessageNotFound(999)));
    }

    #[test]
    fn test_subscription_reply_sent_on_connect() {
        let (_dir, mut worker, mut rx) = worker();
        let bob = Identity::new("bob@x");
        let thread = worker.repo.ensure_thread(&bob, false).unwrap();

        worker
            .reply_subscription(thread.id, PrivacyAction::Accept)
            .unwrap();
        assert!(drain(&mut rx).is_empty());

        worker.apply_event(BusEvent::Connected).unwrap();
        assert_eq!(
            drain(&mut rx),
            vec![BusEvent::SetUserPrivacyRequest {
                identity: bob.clone(),
                action: PrivacyAction::Accept,
            }]
        );
        assert_eq!(
            worker.repo.thread(thread.id).unwrap().unwrap().request_status,
            RequestStatus::None
        );

        worker
            .reply_subscription(thread.id, PrivacyAction::Block)
            .unwrap();
        assert_eq!(
            drain(&mut rx),
            vec![BusEvent::SetUserPrivacyRequest {
                identity: bob,
                action: PrivacyAction::Block,
            }]
        );
    }
}
