//! Courier - outbound message queue and contact discovery for a secure messaging client
//!
//! Courier is the part of a messaging client that sits between the UI and the
//! network transport. It owns no sockets: every request to the network and
//! every answer from it travels over an in-process [`EventBus`].
//!
//! ## Components
//!
//! - [`MessageQueue`]: persists outbound messages, hands them to the
//!   transport, resends what is left over after reconnecting and applies
//!   inbound messages
//! - [`DiscoveryRound`]: one round of the roster/presence/key/blocklist
//!   discovery protocol
//! - [`ContactSyncer`]: turns the local address book into synced contacts by
//!   running a discovery round
//! - [`RedbRepository`]: the embedded store shared by all of the above
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use courier_core::{
//!     CourierConfig, EventBus, MessageQueue, PlaintextCrypto, RedbRepository,
//!     queue::NoopNotifier, types::Identity,
//! };
//!
//! let repo = Arc::new(RedbRepository::open("courier.redb")?);
//! let bus = EventBus::default();
//! let config = CourierConfig::new(Identity::new("me@example.org"), "example.org");
//!
//! let (queue, _triggers) = MessageQueue::spawn(
//!     repo.clone(),
//!     bus.clone(),
//!     Arc::new(PlaintextCrypto),
//!     Arc::new(NoopNotifier),
//!     config,
//! );
//!
//! let thread = repo.ensure_thread(&Identity::new("bob@example.org"), false)?;
//! queue.send_text(thread.id, "Hello!", None).await?;
//! ```

pub mod bus;
pub mod config;
pub mod crypto;
pub mod discovery;
pub mod error;
pub mod queue;
pub mod storage;
pub mod sync;
pub mod types;

pub use bus::{BusEvent, EventBus, EventHandler, Subscription};
pub use config::CourierConfig;
pub use crypto::{CryptoProvider, PlaintextCrypto};
pub use discovery::{DiscoveryRound, RoundOutcome};
pub use error::{CourierError, CourierResult};
pub use queue::MessageQueue;
pub use storage::{RedbRepository, Repository};
pub use sync::{ContactSyncer, SyncOutcome, SyncStats};
