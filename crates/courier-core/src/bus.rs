//! In-process event bus
//!
//! Every protocol request, protocol response and application trigger travels
//! as a [`BusEvent`] fanned out to per-subscriber queues. Components get the bus as an
//! explicit [`EventBus`] handle at construction; nothing is registered
//! globally.
//!
//! ```text
//!   MessageQueue ──publish──►┌──────────┐──deliver──► transport
//!   DiscoveryRound ─────────►│ EventBus │──deliver──► DiscoveryRound
//!   transport ──────────────►└──────────┘──deliver──► MessageQueue
//! ```
//!
//! Handlers registered with [`EventBus::register`] run on their own delivery
//! task. Delivery is lossless and in publish order per subscriber. Dropping
//! (or calling [`Subscription::unsubscribe`] on) the returned token stops
//! delivery.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::types::{Identity, MessageId, PrivacyAction, RequestId};

/// Presence information received during a discovery round
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceUpdate {
    pub id: RequestId,
    pub identity: Identity,
    pub status: Option<String>,
    /// Delay timestamp of the presence (last seen), milliseconds
    pub timestamp: Option<i64>,
    pub roster_name: Option<String>,
    /// Both `from` and `to` subscriptions are in place
    pub mutual_subscription: bool,
}

/// Every event that can travel on the bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
    // ─── Outbound message requests ─────────────────────────────────────
    SendMessageRequest { id: MessageId },
    UploadAttachmentRequest { id: MessageId },
    SendDeliveryReceiptRequest { id: MessageId },
    PrepareMediaRequest { id: MessageId, compression: u8 },
    DownloadAttachmentRequest { id: MessageId, url: String },
    SetUserPrivacyRequest { identity: Identity, action: PrivacyAction },

    // ─── Discovery requests ────────────────────────────────────────────
    ConnectionStatusRequest,
    RosterMatchRequest { batch_id: RequestId, identities: Vec<Identity> },
    PresenceRequest { id: RequestId },
    PublicKeyRequest { id: RequestId },
    BlocklistRequest { id: RequestId },
    LastActivityRequest { id: RequestId, identity: Identity },
    UnsubscribeRequest { identity: Identity },

    // ─── Discovery responses ───────────────────────────────────────────
    RosterMatch { batch_id: RequestId, matched: Vec<Identity> },
    Presence(PresenceUpdate),
    PublicKey { id: RequestId, identity: Identity, key: Vec<u8> },
    Blocklist { id: RequestId, blocked: Vec<Identity> },
    LastActivity { id: RequestId, identity: Identity, not_found: bool },

    // ─── Connection lifecycle and triggers ─────────────────────────────
    Connected,
    Disconnected,
    RosterLoaded,
    UploadServiceFound,
    GroupCreated { group: Identity },
    UserSubscribed { identity: Identity },

    // ─── Delivery acknowledgements ─────────────────────────────────────
    MessageSent { id: MessageId },
    MessageDelivered { id: MessageId },
    MessageFailed { id: MessageId },
    UploadCompleted { id: MessageId, remote: String },
    MediaPrepared { id: MessageId, preview: Option<String>, length: u64 },
    DeliveryReceiptSent { id: MessageId },
}

impl BusEvent {
    /// Short name used in logs
    pub fn name(&self) -> &'static str {
        match self {
            BusEvent::SendMessageRequest { .. } => "send_message_request",
            BusEvent::UploadAttachmentRequest { .. } => "upload_attachment_request",
            BusEvent::SendDeliveryReceiptRequest { .. } => "send_delivery_receipt_request",
            BusEvent::PrepareMediaRequest { .. } => "prepare_media_request",
            BusEvent::DownloadAttachmentRequest { .. } => "download_attachment_request",
            BusEvent::SetUserPrivacyRequest { .. } => "set_user_privacy_request",
            BusEvent::ConnectionStatusRequest => "connection_status_request",
            BusEvent::RosterMatchRequest { .. } => "roster_match_request",
            BusEvent::PresenceRequest { .. } => "presence_request",
            BusEvent::PublicKeyRequest { .. } => "public_key_request",
            BusEvent::BlocklistRequest { .. } => "blocklist_request",
            BusEvent::LastActivityRequest { .. } => "last_activity_request",
            BusEvent::UnsubscribeRequest { .. } => "unsubscribe_request",
            BusEvent::RosterMatch { .. } => "roster_match",
            BusEvent::Presence(_) => "presence",
            BusEvent::PublicKey { .. } => "public_key",
            BusEvent::Blocklist { .. } => "blocklist",
            BusEvent::LastActivity { .. } => "last_activity",
            BusEvent::Connected => "connected",
            BusEvent::Disconnected => "disconnected",
            BusEvent::RosterLoaded => "roster_loaded",
            BusEvent::UploadServiceFound => "upload_service_found",
            BusEvent::GroupCreated { .. } => "group_created",
            BusEvent::UserSubscribed { .. } => "user_subscribed",
            BusEvent::MessageSent { .. } => "message_sent",
            BusEvent::MessageDelivered { .. } => "message_delivered",
            BusEvent::MessageFailed { .. } => "message_failed",
            BusEvent::UploadCompleted { .. } => "upload_completed",
            BusEvent::MediaPrepared { .. } => "media_prepared",
            BusEvent::DeliveryReceiptSent { .. } => "delivery_receipt_sent",
        }
    }
}

/// Callback invoked for every event delivered to a registered handler.
///
/// Implementations must not panic and should not block for long. Each handler
/// runs on its own delivery task; events queue up behind a slow one.
pub trait EventHandler: Send + Sync + 'static {
    fn handle(&self, event: &BusEvent);
}

/// Cloneable handle to the event bus.
///
/// Every subscriber owns an unbounded queue, so a slow handler delays its own
/// deliveries but never loses one.
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<mpsc::UnboundedSender<BusEvent>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Post an event to every current subscriber. Never blocks.
    pub fn publish(&self, event: BusEvent) {
        trace!(event = event.name(), "Publishing bus event");
        let mut subscribers = self.subscribers.lock();
        // A failed send means the receiver is gone; drop its sender.
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Raw receiver for callers that drive their own loop
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<BusEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Deliver every subsequent event to `handler` until the returned token is dropped
    pub fn register(&self, name: &'static str, handler: Arc<dyn EventHandler>) -> Subscription {
        let mut rx = self.subscribe();

        let task = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                handler.handle(&event);
            }
        });

        debug!(handler = name, "Event handler registered");
        Subscription {
            name,
            task: Some(task),
        }
    }

    /// Number of live receivers, registered handlers included
    pub fn receiver_count(&self) -> usize {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| !tx.is_closed());
        subscribers.len()
    }
}

/// Unsubscribe token returned by [`EventBus::register`]
pub struct Subscription {
    name: &'static str,
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    /// Stop delivering events to the handler
    pub fn unsubscribe(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            debug!(handler = self.name, "Event handler unregistered");
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("name", &self.name)
            .field("active", &self.task.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<BusEvent>>,
    }

    impl EventHandler for Recorder {
        fn handle(&self, event: &BusEvent) {
            self.seen.lock().push(event.clone());
        }
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let bus = EventBus::new();
        bus.publish(BusEvent::Connected);
        assert_eq!(bus.receiver_count(), 0);
    }

    #[tokio::test]
    async fn test_raw_subscribe_receives_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(BusEvent::SendMessageRequest { id: MessageId(7) });
        assert_eq!(
            rx.recv().await.unwrap(),
            BusEvent::SendMessageRequest { id: MessageId(7) }
        );
    }

    #[tokio::test]
    async fn test_registered_handler_receives_until_unsubscribed() {
        let bus = EventBus::new();
        let recorder = Arc::new(Recorder::default());
        let sub = bus.register("recorder", recorder.clone());

        bus.publish(BusEvent::Connected);
        settle().await;
        assert_eq!(recorder.seen.lock().len(), 1);

        sub.unsubscribe();
        settle().await;
        bus.publish(BusEvent::Disconnected);
        settle().await;
        assert_eq!(recorder.seen.lock().as_slice(), &[BusEvent::Connected]);
    }

    #[tokio::test]
    async fn test_dropping_subscription_stops_delivery() {
        let bus = EventBus::new();
        let recorder = Arc::new(Recorder::default());
        {
            let _sub = bus.register("recorder", recorder.clone());
            settle().await;
        }
        settle().await;
        bus.publish(BusEvent::Connected);
        settle().await;
        assert!(recorder.seen.lock().is_empty());
    }

    #[tokio::test]
    async fn test_backlog_larger_than_any_buffer_is_delivered() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let recorder = Arc::new(Recorder::default());
        let _sub = bus.register("recorder", recorder.clone());

        for i in 0..5_000 {
            bus.publish(BusEvent::SendMessageRequest { id: MessageId(i) });
        }

        let mut received = Vec::new();
        while let Ok(event) = rx.try_recv() {
            received.push(event);
        }
        assert_eq!(received.len(), 5_000);
        assert_eq!(
            received.last(),
            Some(&BusEvent::SendMessageRequest { id: MessageId(4_999) })
        );

        for _ in 0..100 {
            if recorder.seen.lock().len() == 5_000 {
                break;
            }
            settle().await;
        }
        let seen = recorder.seen.lock();
        assert_eq!(seen.len(), 5_000);
        assert_eq!(seen[0], BusEvent::SendMessageRequest { id: MessageId(0) });
    }

    #[tokio::test]
    async fn test_dropped_receivers_are_pruned() {
        let bus = EventBus::new();
        let rx = bus.subscribe();
        let _kept = bus.subscribe();
        assert_eq!(bus.receiver_count(), 2);
        drop(rx);
        bus.publish(BusEvent::Connected);
        assert_eq!(bus.receiver_count(), 1);
    }
}
