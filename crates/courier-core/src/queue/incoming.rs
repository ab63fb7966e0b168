//! Inbound message handling

use tracing::{debug, info, warn};

use super::worker::Worker;
use crate::bus::BusEvent;
use crate::error::CourierResult;
use crate::storage::{ContactStore, ThreadStore};
use crate::types::{
    Attachment, Direction, GroupRef, Identity, InboundMessage, MessageId, MessageStatus,
    NewMessage, ThreadId,
};

impl Worker {
    /// Persist an inbound message and apply its side effects.
    ///
    /// Returns `None` when a message with the same server id is already stored.
    pub(super) fn incoming(&mut self, inbound: InboundMessage) -> CourierResult<Option<MessageId>> {
        if self
            .repo
            .message_by_server_id(Direction::Incoming, &inbound.server_id)?
            .is_some()
        {
            debug!(server_id = %inbound.server_id, "Duplicate inbound message");
            return Ok(None);
        }

        let (body, encrypted) = if inbound.encrypted {
            match self.crypto.decrypt(&inbound.sender, &inbound.body) {
                Ok(plain) => (plain, false),
                Err(e) => {
                    warn!(server_id = %inbound.server_id, error = %e, "Unable to decrypt inbound message");
                    (inbound.body.clone(), true)
                }
            }
        } else {
            (inbound.body.clone(), false)
        };

        let (thread_peer, is_group) = match &inbound.group {
            Some(group) => (group.id.clone(), true),
            None => (inbound.sender.clone(), false),
        };
        let thread = self.repo.ensure_thread(&thread_peer, is_group)?;

        let notify = match inbound.group.as_ref().and_then(|g| g.command.as_ref()) {
            Some(command) => command.is_create() || command.is_part(),
            None => true,
        };

        let in_reply_to = match &inbound.in_reply_to {
            Some(server_id) => self.reply_target(server_id)?,
            None => None,
        };

        let status = if inbound.request_receipt {
            MessageStatus::Received
        } else {
            MessageStatus::Incoming
        };

        let new = NewMessage {
            thread_id: thread.id,
            peer: inbound.sender.clone(),
            direction: Direction::Incoming,
            status,
            mime: inbound.mime.clone(),
            body,
            encrypted,
            security_key: None,
            attachment: inbound.attachment.as_ref().map(|a| Attachment {
                mime: a.mime.clone(),
                local: None,
                remote: Some(a.url.clone()),
                preview: None,
                length: a.length,
                encrypted: a.encrypted,
            }),
            location: inbound.location.clone(),
            group: inbound.group.as_ref().map(|g| GroupRef {
                id: g.id.clone(),
                owner: g.owner.clone(),
            }),
            group_command: inbound.group.as_ref().and_then(|g| g.command.clone()),
            in_reply_to,
            server_id: Some(inbound.server_id.clone()),
            timestamp: inbound.timestamp,
        };
        let message = self.repo.insert_message(new)?;
        info!(id = %message.id, thread = %thread.id, sender = %inbound.sender, "Inbound message stored");

        if let Some(group) = &inbound.group {
            if let Err(e) = self.apply_inbound_group(group, &inbound.sender, thread.id) {
                warn!(group = %group.id, error = %e, "Failed to apply inbound group command");
            }
        } else if let Err(e) = self.repo.mark_registered(&inbound.sender) {
            debug!(sender = %inbound.sender, error = %e, "Could not mark sender registered");
        }

        if let Some(attachment) = &inbound.attachment {
            if self.config.can_auto_download(attachment.length) {
                debug!(id = %message.id, length = attachment.length, "Auto-downloading attachment");
                self.bus.publish(BusEvent::DownloadAttachmentRequest {
                    id: message.id,
                    url: attachment.url.clone(),
                });
            }
        }

        if inbound.request_receipt {
            self.bus
                .publish(BusEvent::SendDeliveryReceiptRequest { id: message.id });
        }

        if notify {
            self.notify(&thread_peer, thread.id);
        }
        Ok(Some(message.id))
    }

    /// Resolve a quoted server id, preferring our own outbound messages
    fn reply_target(&self, server_id: &str) -> CourierResult<Option<MessageId>> {
        for direction in [Direction::Outgoing, Direction::Incoming] {
            if let Some(message) = self.repo.message_by_server_id(direction, server_id)? {
                return Ok(Some(message.id));
            }
        }
        Ok(None)
    }

    fn notify(&self, peer: &Identity, thread: ThreadId) {
        if self.notifier.is_paused(peer) {
            self.notifier.play_incoming_sound();
        } else {
            self.notifier.update_notifications(thread);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use crate::config::CourierConfig;
    use crate::crypto::PlaintextCrypto;
    use crate::queue::Notifier;
    use crate::storage::{GroupStore, RedbRepository};
    use crate::types::{
        Contact, ContactOp, GroupCommand, InboundAttachment, InboundGroup, Membership, TEXT_MIME,
    };
    use parking_lot::Mutex;
    use std::sync::Arc;
    use tempfile::tempdir;
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct RecordingNotifier {
        paused: Option<Identity>,
        updates: Mutex<Vec<ThreadId>>,
        sounds: Mutex<usize>,
    }

    impl Notifier for RecordingNotifier {
        fn is_paused(&self, peer: &Identity) -> bool {
            self.paused.as_ref() == Some(peer)
        }

        fn update_notifications(&self, thread: ThreadId) {
            self.updates.lock().push(thread);
        }

        fn play_incoming_sound(&self) {
            *self.sounds.lock() += 1;
        }
    }

    fn worker(
        notifier: Arc<RecordingNotifier>,
    ) -> (tempfile::TempDir, Worker, mpsc::UnboundedReceiver<BusEvent>) {
        let dir = tempdir().unwrap();
        let repo = Arc::new(RedbRepository::open(dir.path().join("courier.redb")).unwrap());
        let bus = EventBus::new();
        let rx = bus.subscribe();
        let worker = Worker::new(
            repo,
            bus,
            Arc::new(PlaintextCrypto),
            notifier,
            CourierConfig::new(Identity::new("me@x"), "x"),
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
    fn test_incoming_text_is_stored_once() {
        let notifier = Arc::new(RecordingNotifier::default());
        let (_dir, mut worker, _rx) = worker(notifier.clone());
        let alice = Identity::new("alice@x");

        let id = worker
            .incoming(InboundMessage::text("s-1", alice.clone(), "hi"))
            .unwrap()
            .unwrap();
        let dup = worker
            .incoming(InboundMessage::text("s-1", alice.clone(), "hi"))
            .unwrap();
        assert!(dup.is_none());

        let stored = worker.repo.message(id).unwrap().unwrap();
        assert_eq!(stored.direction, Direction::Incoming);
        assert_eq!(stored.status, MessageStatus::Incoming);
        assert_eq!(stored.text(), Some("hi"));

        let thread = worker.repo.thread_for_peer(&alice).unwrap().unwrap();
        assert_eq!(thread.id, stored.thread_id);
        assert_eq!(*notifier.updates.lock(), vec![thread.id]);
    }

    #[test]
    fn test_receipt_and_auto_download_requests() {
        let notifier = Arc::new(RecordingNotifier::default());
        let (_dir, mut worker, mut rx) = worker(notifier);
        let mut inbound = InboundMessage::text("s-2", Identity::new("alice@x"), "");
        inbound.mime = "image/png".into();
        inbound.request_receipt = true;
        inbound.attachment = Some(InboundAttachment {
            mime: "image/png".into(),
            url: "https://media/1".into(),
            length: 1024,
            encrypted: false,
        });

        let id = worker.incoming(inbound).unwrap().unwrap();
        assert_eq!(
            drain(&mut rx),
            vec![
                BusEvent::DownloadAttachmentRequest {
                    id,
                    url: "https://media/1".into(),
                },
                BusEvent::SendDeliveryReceiptRequest { id },
            ]
        );
        let stored = worker.repo.message(id).unwrap().unwrap();
        assert_eq!(stored.status, MessageStatus::Received);
        assert_eq!(
            stored.attachment.unwrap().remote.as_deref(),
            Some("https://media/1")
        );

        worker.apply_event(BusEvent::DeliveryReceiptSent { id }).unwrap();
        assert_eq!(
            worker.repo.message(id).unwrap().unwrap().status,
            MessageStatus::Confirmed
        );
    }

    #[test]
    fn test_large_attachment_is_not_auto_downloaded() {
        let notifier = Arc::new(RecordingNotifier::default());
        let (_dir, mut worker, mut rx) = worker(notifier);
        let mut inbound = InboundMessage::text("s-3", Identity::new("alice@x"), "");
        inbound.attachment = Some(InboundAttachment {
            mime: "video/mp4".into(),
            url: "https://media/2".into(),
            length: 50 * 1024 * 1024,
            encrypted: false,
        });
        worker.incoming(inbound).unwrap().unwrap();
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_reply_reference_resolved() {
        let notifier = Arc::new(RecordingNotifier::default());
        let (_dir, mut worker, _rx) = worker(notifier);
        let alice = Identity::new("alice@x");
        let first = worker
            .incoming(InboundMessage::text("s-10", alice.clone(), "question"))
            .unwrap()
            .unwrap();

        let mut reply = InboundMessage::text("s-11", alice.clone(), "follow-up");
        reply.in_reply_to = Some("s-10".into());
        let second = worker.incoming(reply).unwrap().unwrap();

        let stored = worker.repo.message(second).unwrap().unwrap();
        assert_eq!(stored.in_reply_to, Some(first));
    }

    #[test]
    fn test_inbound_id_matching_outbound_id_is_stored() {
        let notifier = Arc::new(RecordingNotifier::default());
        let (_dir, mut worker, _rx) = worker(notifier);
        let alice = Identity::new("alice@x");
        let thread = worker.repo.ensure_thread(&alice, false).unwrap();
        let mut outbound = NewMessage::outgoing(thread.id, alice.clone(), TEXT_MIME);
        outbound.server_id = Some("s-20".into());
        let outbound = worker.repo.insert_message(outbound).unwrap();

        let inbound = worker
            .incoming(InboundMessage::text("s-20", alice.clone(), "same id, other side"))
            .unwrap();
        let inbound = inbound.expect("inbound message dropped as duplicate");
        assert_ne!(inbound, outbound.id);

        // A quote of that id resolves to our own message
        let mut reply = InboundMessage::text("s-21", alice, "re");
        reply.in_reply_to = Some("s-20".into());
        let reply = worker.incoming(reply).unwrap().unwrap();
        assert_eq!(
            worker.repo.message(reply).unwrap().unwrap().in_reply_to,
            Some(outbound.id)
        );
    }

    #[test]
    fn test_paused_conversation_plays_sound() {
        let alice = Identity::new("alice@x");
        let notifier = Arc::new(RecordingNotifier {
            paused: Some(alice.clone()),
            ..Default::default()
        });
        let (_dir, mut worker, _rx) = worker(notifier.clone());
        worker
            .incoming(InboundMessage::text("s-4", alice, "hey"))
            .unwrap();
        assert_eq!(*notifier.sounds.lock(), 1);
        assert!(notifier.updates.lock().is_empty());
    }

    #[test]
    fn test_group_commands_update_group_and_notify_selectively() {
        let notifier = Arc::new(RecordingNotifier::default());
        let (_dir, mut worker, _rx) = worker(notifier.clone());
        let owner = Identity::new("olga@x");
        let group_id = Identity::new("g9@x");
        let command = |server_id: &str, command: GroupCommand| {
            let mut inbound = InboundMessage::text(server_id, owner.clone(), "");
            inbound.group = Some(InboundGroup {
                id: group_id.clone(),
                owner: owner.clone(),
                command: Some(command),
            });
            inbound
        };

        worker
            .incoming(command(
                "g-1",
                GroupCommand::Create {
                    members: vec![Identity::new("me@x"), Identity::new("alice@x")],
                    subject: None,
                },
            ))
            .unwrap();
        worker
            .incoming(command(
                "g-2",
                GroupCommand::SetSubject {
                    subject: "Weekend".into(),
                },
            ))
            .unwrap();

        let group = worker.repo.group(&group_id).unwrap().unwrap();
        assert_eq!(group.subject.as_deref(), Some("Weekend"));
        assert_eq!(group.membership, Membership::Member);

        // Only the create notified
        let thread = worker.repo.thread_for_peer(&group_id).unwrap().unwrap();
        assert!(thread.is_group);
        assert_eq!(*notifier.updates.lock(), vec![thread.id]);
    }

    #[test]
    fn test_sender_marked_registered() {
        let notifier = Arc::new(RecordingNotifier::default());
        let (_dir, mut worker, _rx) = worker(notifier);
        let alice = Identity::new("alice@x");
        let mut contact = Contact::new(alice.clone(), "5550001", "Alice");
        contact.registered = false;
        worker
            .repo
            .apply_contact_batch(&[ContactOp::Upsert(contact)])
            .unwrap();

        worker
            .incoming(InboundMessage::text("s-5", alice.clone(), "yo"))
            .unwrap();
        assert!(worker.repo.contact(&alice).unwrap().unwrap().registered);
    }
}
