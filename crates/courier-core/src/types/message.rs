//! Message types
//!
//! A [`Message`] is both the outbound queue entry and the stored inbound
//! message. Its [`MessageStatus`] only moves forward (see
//! [`MessageStatus::can_transition_to`]); the single exception is an explicit
//! user retry, which resets the status to a resendable state.
//!
//! ```text
//! outbound:  PENDING ─► SENDING ─► QUEUED ─► SENT ─► RECEIVED
//!                          │                   │
//!                          └─► ERROR           └─► NOT_DELIVERED
//!
//! inbound:   INCOMING ─► RECEIVED (receipt owed) ─► CONFIRMED
//! ```

use serde::{Deserialize, Serialize};

use super::{GroupCommand, Identity, MessageId, ThreadId};

/// Mime type of plain text messages
pub const TEXT_MIME: &str = "text/plain";

/// Mime type of group-command messages
pub const GROUP_COMMAND_MIME: &str = "application/x-courier-group-command";

/// Mime type of location messages
pub const LOCATION_MIME: &str = "application/x-courier-location";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Incoming,
    Outgoing,
}

/// Delivery status of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageStatus {
    /// Inbound message, no receipt owed
    Incoming,
    /// Outbound message being sent
    Sending,
    /// Outbound message failed to send
    Error,
    /// Outbound message refused by the server
    NotAccepted,
    /// Outbound message accepted by the server
    Sent,
    /// Outbound: delivered to the peer. Inbound: received, delivery receipt owed
    Received,
    /// Inbound message whose delivery receipt was sent
    Confirmed,
    /// Outbound message the server could not deliver
    NotDelivered,
    /// Outbound message waiting for user review (e.g. peer has not accepted us yet)
    Pending,
    /// Outbound message queued on the server for an offline peer
    Queued,
}

impl MessageStatus {
    /// Numeric code, stable across versions
    pub fn code(&self) -> u8 {
        match self {
            MessageStatus::Incoming => 0,
            MessageStatus::Sending => 1,
            MessageStatus::Error => 2,
            MessageStatus::NotAccepted => 3,
            MessageStatus::Sent => 4,
            MessageStatus::Received => 5,
            MessageStatus::Confirmed => 6,
            MessageStatus::NotDelivered => 7,
            MessageStatus::Pending => 8,
            MessageStatus::Queued => 9,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => MessageStatus::Incoming,
            1 => MessageStatus::Sending,
            2 => MessageStatus::Error,
            3 => MessageStatus::NotAccepted,
            4 => MessageStatus::Sent,
            5 => MessageStatus::Received,
            6 => MessageStatus::Confirmed,
            7 => MessageStatus::NotDelivered,
            8 => MessageStatus::Pending,
            9 => MessageStatus::Queued,
            _ => return None,
        })
    }

    /// Position along the delivery lifecycle. Codes are not ordered, ranks are.
    fn rank(&self) -> u8 {
        match self {
            MessageStatus::Incoming => 0,
            MessageStatus::Pending => 1,
            MessageStatus::Sending => 2,
            MessageStatus::Error | MessageStatus::NotAccepted => 3,
            MessageStatus::Queued => 4,
            MessageStatus::Sent => 5,
            MessageStatus::NotDelivered => 6,
            MessageStatus::Received => 7,
            MessageStatus::Confirmed => 8,
        }
    }

    /// Whether an automatic (non-retry) update may move from `self` to `next`
    pub fn can_transition_to(&self, next: MessageStatus) -> bool {
        next.rank() > self.rank()
    }

    /// Statuses a resend scan never picks up: already handed off or settled
    pub fn is_in_flight_or_terminal(&self) -> bool {
        matches!(
            self,
            MessageStatus::Sent
                | MessageStatus::Received
                | MessageStatus::NotDelivered
                | MessageStatus::Queued
        )
    }

    /// Whether the server has acknowledged an outbound message
    pub fn is_acknowledged(&self) -> bool {
        matches!(
            self,
            MessageStatus::Sent
                | MessageStatus::Received
                | MessageStatus::NotDelivered
                | MessageStatus::Confirmed
        )
    }
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            MessageStatus::Incoming => "incoming",
            MessageStatus::Sending => "sending",
            MessageStatus::Error => "error",
            MessageStatus::NotAccepted => "not_accepted",
            MessageStatus::Sent => "sent",
            MessageStatus::Received => "received",
            MessageStatus::Confirmed => "confirmed",
            MessageStatus::NotDelivered => "not_delivered",
            MessageStatus::Pending => "pending",
            MessageStatus::Queued => "queued",
        };
        f.pad(name)
    }
}

/// Media attachment of a message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub mime: String,
    /// Local content locator (file path or content uri)
    pub local: Option<String>,
    /// Remote locator, set once uploaded (or for inbound media, where to fetch it)
    pub remote: Option<String>,
    /// Thumbnail produced by media preparation
    pub preview: Option<String>,
    /// Size in bytes, 0 when unknown
    pub length: u64,
    pub encrypted: bool,
}

impl Attachment {
    /// Has local content that has not been uploaded yet
    pub fn needs_upload(&self) -> bool {
        self.local.is_some() && self.remote.is_none()
    }
}

/// Geographic location carried by location messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
    pub text: Option<String>,
    pub street: Option<String>,
}

/// Group a message belongs to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupRef {
    pub id: Identity,
    pub owner: Identity,
}

/// A stored message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub thread_id: ThreadId,
    /// Sender (inbound) or recipient (outbound); the group identity for group messages
    pub peer: Identity,
    pub direction: Direction,
    pub status: MessageStatus,
    pub mime: String,
    /// Text content, or ciphertext when `encrypted` is still set on an inbound message
    pub body: Vec<u8>,
    pub encrypted: bool,
    /// Fingerprint of the key the message was encrypted with
    pub security_key: Option<String>,
    pub attachment: Option<Attachment>,
    pub location: Option<Location>,
    pub group: Option<GroupRef>,
    pub group_command: Option<GroupCommand>,
    pub in_reply_to: Option<MessageId>,
    /// Id assigned by the sender, used to dedup inbound messages and match receipts
    pub server_id: Option<String>,
    pub timestamp: i64,
    pub status_changed: i64,
}

impl Message {
    pub fn is_group_command(&self) -> bool {
        self.group_command.is_some()
    }

    /// Body as UTF-8 text, if it is valid text
    pub fn text(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }

    /// Has an attachment whose local content is not uploaded yet
    pub fn needs_upload(&self) -> bool {
        self.attachment.as_ref().is_some_and(Attachment::needs_upload)
    }

    /// Short human-readable description, used for thread summaries
    pub fn snippet(&self) -> String {
        if let Some(command) = &self.group_command {
            return command.describe();
        }
        if self.location.is_some() {
            return "[location]".to_string();
        }
        if let Some(attachment) = &self.attachment {
            return format!("[{}]", attachment.mime);
        }
        if self.encrypted {
            return "[encrypted]".to_string();
        }
        let text = self.text().unwrap_or_default();
        text.chars().take(64).collect()
    }
}

/// Values for a message about to be inserted; the repository assigns the id
#[derive(Debug, Clone, PartialEq)]
pub struct NewMessage {
    pub thread_id: ThreadId,
    pub peer: Identity,
    pub direction: Direction,
    pub status: MessageStatus,
    pub mime: String,
    pub body: Vec<u8>,
    pub encrypted: bool,
    pub security_key: Option<String>,
    pub attachment: Option<Attachment>,
    pub location: Option<Location>,
    pub group: Option<GroupRef>,
    pub group_command: Option<GroupCommand>,
    pub in_reply_to: Option<MessageId>,
    pub server_id: Option<String>,
    pub timestamp: i64,
}

impl NewMessage {
    /// A plain outbound message to `peer` in `thread_id`
    pub fn outgoing(thread_id: ThreadId, peer: Identity, mime: impl Into<String>) -> Self {
        Self {
            thread_id,
            peer,
            direction: Direction::Outgoing,
            status: MessageStatus::Sending,
            mime: mime.into(),
            body: Vec::new(),
            encrypted: false,
            security_key: None,
            attachment: None,
            location: None,
            group: None,
            group_command: None,
            in_reply_to: None,
            server_id: None,
            timestamp: super::now_millis(),
        }
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_status(mut self, status: MessageStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachment = Some(attachment);
        self
    }

    pub fn with_group(mut self, group: GroupRef) -> Self {
        self.group = Some(group);
        self
    }

    pub fn with_group_command(mut self, command: GroupCommand) -> Self {
        self.mime = GROUP_COMMAND_MIME.to_string();
        self.group_command = Some(command);
        self
    }
}

/// Media reference of an inbound message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundAttachment {
    pub mime: String,
    /// Where the content can be fetched from
    pub url: String,
    pub length: u64,
    pub encrypted: bool,
}

/// Group metadata of an inbound message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundGroup {
    pub id: Identity,
    pub owner: Identity,
    pub command: Option<GroupCommand>,
}

/// A message as received from the transport, before it is stored
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Sender-assigned message id
    pub server_id: String,
    pub sender: Identity,
    pub mime: String,
    pub body: Vec<u8>,
    pub encrypted: bool,
    pub timestamp: i64,
    pub attachment: Option<InboundAttachment>,
    pub location: Option<Location>,
    /// Sender-assigned id of the message this one replies to
    pub in_reply_to: Option<String>,
    pub group: Option<InboundGroup>,
    /// Sender asked for a delivery receipt
    pub request_receipt: bool,
}

impl InboundMessage {
    /// A plain text message from `sender`
    pub fn text(server_id: impl Into<String>, sender: Identity, text: &str) -> Self {
        Self {
            server_id: server_id.into(),
            sender,
            mime: TEXT_MIME.to_string(),
            body: text.as_bytes().to_vec(),
            encrypted: false,
            timestamp: super::now_millis(),
            attachment: None,
            location: None,
            in_reply_to: None,
            group: None,
            request_receipt: false,
        }
    }

    pub fn is_group_command(&self) -> bool {
        self.group.as_ref().is_some_and(|g| g.command.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_round_trip() {
        for code in 0..10 {
            let status = MessageStatus::from_code(code).unwrap();
            assert_eq!(status.code(), code);
        }
        assert!(MessageStatus::from_code(10).is_none());
    }

    #[test]
    fn test_status_is_monotonic() {
        assert!(MessageStatus::Sending.can_transition_to(MessageStatus::Sent));
        assert!(MessageStatus::Sent.can_transition_to(MessageStatus::Received));
        assert!(MessageStatus::Error.can_transition_to(MessageStatus::Sent));
        assert!(!MessageStatus::Received.can_transition_to(MessageStatus::Sent));
        assert!(!MessageStatus::Sent.can_transition_to(MessageStatus::Error));
        assert!(!MessageStatus::Sent.can_transition_to(MessageStatus::Sent));
        assert!(MessageStatus::Received.can_transition_to(MessageStatus::Confirmed));
    }

    #[test]
    fn test_in_flight_set() {
        assert!(MessageStatus::Queued.is_in_flight_or_terminal());
        assert!(MessageStatus::NotDelivered.is_in_flight_or_terminal());
        assert!(!MessageStatus::Sending.is_in_flight_or_terminal());
        assert!(!MessageStatus::Pending.is_in_flight_or_terminal());
        assert!(!MessageStatus::Error.is_in_flight_or_terminal());
    }

    #[test]
    fn test_needs_upload() {
        let mut attachment = Attachment {
            mime: "image/png".into(),
            local: Some("/tmp/a.png".into()),
            remote: None,
            preview: None,
            length: 10,
            encrypted: false,
        };
        assert!(attachment.needs_upload());
        attachment.remote = Some("https://media/a".into());
        assert!(!attachment.needs_upload());
    }
}
