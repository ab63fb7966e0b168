//! Message queue controller
//!
//! Owns the lifecycle of outbound messages: composing and persisting them,
//! handing them to the transport through bus requests, resending whatever is
//! left over after a reconnect, keeping group commands ordered ahead of later
//! messages in the same thread, and applying inbound messages.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  Command   ┌──────────────────────────────┐
//! │ MessageQueue │───────────►│ worker task (one, serialized)│
//! │   (handle)   │◄───────────│  compose / retry / incoming  │
//! └──────────────┘  oneshot   │  resend scans / acks         │
//!                             └──────┬──────────────▲────────┘
//! ┌──────────────┐  Command::Event   │ publish      │ Repository
//! │ QueueTrigger │──────────────────►│              │
//! │ (bus handler)│                   ▼              │
//! └──────▲───────┘             ┌──────────┐   ┌─────┴──────┐
//!        └─────────────────────│ EventBus │   │ redb store │
//!                              └──────────┘   └────────────┘
//! ```
//!
//! Every mutation and every resend scan runs on the single worker task, so
//! ordering decisions inside a scan are deterministic and scans never
//! interleave. Handle methods return as soon as the worker has answered.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use crate::bus::{BusEvent, EventBus, EventHandler, Subscription};
use crate::config::CourierConfig;
use crate::crypto::CryptoProvider;
use crate::error::{CourierError, CourierResult};
use crate::storage::Repository;
use crate::types::{Identity, InboundMessage, Location, MessageId, PrivacyAction, ThreadId};

mod group;
mod incoming;
pub mod scan;
mod worker;

pub use scan::{plan_resend, Dispatch, ScanOptions, ScanPlan, SkipReason};

use worker::Worker;

/// Hooks into the UI's notification layer
pub trait Notifier: Send + Sync + 'static {
    /// Whether the conversation with `peer` is on screen (notifications paused)
    fn is_paused(&self, peer: &Identity) -> bool;

    /// Refresh the message notification for a new message in `thread`
    fn update_notifications(&self, thread: ThreadId);

    /// Play the in-conversation sound for a message in the open conversation
    fn play_incoming_sound(&self);
}

/// Notifier that does nothing, for headless use
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

impl Notifier for NoopNotifier {
    fn is_paused(&self, _peer: &Identity) -> bool {
        false
    }

    fn update_notifications(&self, _thread: ThreadId) {}

    fn play_incoming_sound(&self) {}
}

/// Binary content to send
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryContent {
    /// Local content locator
    pub locator: String,
    pub mime: String,
    pub length: u64,
    /// Images and videos go through media preparation (compression, preview) first
    pub is_media: bool,
}

type Reply<T> = oneshot::Sender<CourierResult<T>>;

/// Work items for the serialized worker
pub(crate) enum Command {
    SendText {
        thread: ThreadId,
        text: String,
        in_reply_to: Option<MessageId>,
        reply: Reply<MessageId>,
    },
    SendLocation {
        thread: ThreadId,
        location: Location,
        reply: Reply<MessageId>,
    },
    SendBinary {
        thread: ThreadId,
        content: BinaryContent,
        reply: Reply<MessageId>,
    },
    CreateGroup {
        group: Identity,
        members: Vec<Identity>,
        subject: Option<String>,
        reply: Reply<MessageId>,
    },
    AddGroupMembers {
        group: Identity,
        members: Vec<Identity>,
        reply: Reply<MessageId>,
    },
    RemoveGroupMembers {
        group: Identity,
        members: Vec<Identity>,
        reply: Reply<MessageId>,
    },
    SetGroupSubject {
        group: Identity,
        subject: String,
        reply: Reply<MessageId>,
    },
    LeaveGroup {
        group: Identity,
        reply: Reply<MessageId>,
    },
    RetryMessage {
        id: MessageId,
        reply: Reply<usize>,
    },
    RetryMessagesTo {
        peer: Identity,
        reply: Reply<usize>,
    },
    RetryAll {
        reply: Reply<usize>,
    },
    ReplySubscription {
        thread: ThreadId,
        action: PrivacyAction,
        reply: Reply<()>,
    },
    Incoming {
        message: Box<InboundMessage>,
        reply: Reply<Option<MessageId>>,
    },
    Resend {
        options: ScanOptions,
        reply: Option<Reply<ScanPlan>>,
    },
    Event(BusEvent),
    Shutdown,
}

/// Handle to the message queue worker
#[derive(Clone)]
pub struct MessageQueue {
    tx: mpsc::UnboundedSender<Command>,
}

impl MessageQueue {
    /// Start the worker and register its bus triggers.
    ///
    /// The returned [`Subscription`] keeps the bus triggers alive. Once it is
    /// dropped and every handle is gone, the worker stops.
    pub fn spawn(
        repo: Arc<dyn Repository>,
        bus: EventBus,
        crypto: Arc<dyn CryptoProvider>,
        notifier: Arc<dyn Notifier>,
        config: CourierConfig,
    ) -> (Self, Subscription) {
        let (tx, rx) = mpsc::unbounded_channel();

        let worker = Worker::new(repo, bus.clone(), crypto, notifier, config);
        tokio::spawn(worker.run(rx));

        let trigger = Arc::new(QueueTrigger { tx: tx.clone() });
        let subscription = bus.register("message_queue", trigger);

        info!("Message queue started");
        (Self { tx }, subscription)
    }

    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> CourierResult<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .map_err(|_| CourierError::WorkerStopped)?;
        rx.await.map_err(|_| CourierError::WorkerStopped)?
    }

    /// Persist an outbound text message and hand it to the transport
    pub async fn send_text(
        &self,
        thread: ThreadId,
        text: impl Into<String>,
        in_reply_to: Option<MessageId>,
    ) -> CourierResult<MessageId> {
        let text = text.into();
        self.request(|reply| Command::SendText {
            thread,
            text,
            in_reply_to,
            reply,
        })
        .await
    }

    pub async fn send_location(
        &self,
        thread: ThreadId,
        location: Location,
    ) -> CourierResult<MessageId> {
        self.request(|reply| Command::SendLocation {
            thread,
            location,
            reply,
        })
        .await
    }

    /// Persist an outbound attachment. Media is prepared before it is uploaded.
    pub async fn send_binary(
        &self,
        thread: ThreadId,
        content: BinaryContent,
    ) -> CourierResult<MessageId> {
        self.request(|reply| Command::SendBinary {
            thread,
            content,
            reply,
        })
        .await
    }

    /// Create a group locally and queue its create command. Returns the command message id.
    pub async fn create_group(
        &self,
        group: Identity,
        members: Vec<Identity>,
        subject: Option<String>,
    ) -> CourierResult<MessageId> {
        self.request(|reply| Command::CreateGroup {
            group,
            members,
            subject,
            reply,
        })
        .await
    }

    pub async fn add_group_members(
        &self,
        group: Identity,
        members: Vec<Identity>,
    ) -> CourierResult<MessageId> {
        self.request(|reply| Command::AddGroupMembers {
            group,
            members,
            reply,
        })
        .await
    }

    pub async fn remove_group_members(
        &self,
        group: Identity,
        members: Vec<Identity>,
    ) -> CourierResult<MessageId> {
        self.request(|reply| Command::RemoveGroupMembers {
            group,
            members,
            reply,
        })
        .await
    }

    pub async fn set_group_subject(
        &self,
        group: Identity,
        subject: impl Into<String>,
    ) -> CourierResult<MessageId> {
        let subject = subject.into();
        self.request(|reply| Command::SetGroupSubject {
            group,
            subject,
            reply,
        })
        .await
    }

    pub async fn leave_group(&self, group: Identity) -> CourierResult<MessageId> {
        self.request(|reply| Command::LeaveGroup { group, reply })
            .await
    }

    /// Reset one message to SENDING and resend everything pending for its peer
    pub async fn retry_message(&self, id: MessageId) -> CourierResult<usize> {
        self.request(|reply| Command::RetryMessage { id, reply })
            .await
    }

    /// Release every PENDING message to `peer` and resend
    pub async fn retry_messages_to(&self, peer: Identity) -> CourierResult<usize> {
        self.request(|reply| Command::RetryMessagesTo { peer, reply })
            .await
    }

    /// Release every PENDING message and resend
    pub async fn retry_all(&self) -> CourierResult<usize> {
        self.request(|reply| Command::RetryAll { reply }).await
    }

    /// Record the user's answer to a subscription request; sent now if connected
    pub async fn reply_subscription(
        &self,
        thread: ThreadId,
        action: PrivacyAction,
    ) -> CourierResult<()> {
        self.request(|reply| Command::ReplySubscription {
            thread,
            action,
            reply,
        })
        .await
    }

    /// Apply an inbound message. Returns `None` for duplicates.
    pub async fn incoming(&self, message: InboundMessage) -> CourierResult<Option<MessageId>> {
        let message = Box::new(message);
        self.request(|reply| Command::Incoming { message, reply })
            .await
    }

    /// Run a resend scan now and return its plan
    pub async fn resend(&self, options: ScanOptions) -> CourierResult<ScanPlan> {
        self.request(|reply| Command::Resend {
            options,
            reply: Some(reply),
        })
        .await
    }

    /// Ask the worker to stop after the commands already queued
    pub fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown);
    }
}

/// Forwards the bus events the queue reacts to onto the worker
struct QueueTrigger {
    tx: mpsc::UnboundedSender<Command>,
}

impl QueueTrigger {
    fn wants(event: &BusEvent) -> bool {
        matches!(
            event,
            BusEvent::Connected
                | BusEvent::Disconnected
                | BusEvent::RosterLoaded
                | BusEvent::UploadServiceFound
                | BusEvent::GroupCreated { .. }
                | BusEvent::UserSubscribed { .. }
                | BusEvent::MessageSent { .. }
                | BusEvent::MessageDelivered { .. }
                | BusEvent::MessageFailed { .. }
                | BusEvent::UploadCompleted { .. }
                | BusEvent::MediaPrepared { .. }
                | BusEvent::DeliveryReceiptSent { .. }
        )
    }
}

impl EventHandler for QueueTrigger {
    fn handle(&self, event: &BusEvent) {
        if !Self::wants(event) {
            return;
        }
        if self.tx.send(Command::Event(event.clone())).is_err() {
            debug!(event = event.name(), "Message queue worker gone, dropping event");
        }
    }
}
