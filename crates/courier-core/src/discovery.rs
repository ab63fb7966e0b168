//! Discovery protocol state machine
//!
//! One [`DiscoveryRound`] answers the question "which of my local identities
//! are registered on the server, and what do we know about them?". It drives
//! the request/response exchange over the [`EventBus`] and hands the result to
//! whoever created it through a oneshot channel.
//!
//! ```text
//!   Init ──Connected──► AwaitingRosterMatch ──all batches──► AwaitingPresenceKeysBlocklist
//!     │                        │  (0 matched + blocklist)              │
//!     │                        └──────────────────────────► Done ◄─────┘
//!     └──────────── Disconnected (any live phase) ────────► Unavailable
//! ```
//!
//! All handlers take the same lock; the completion check runs under it after
//! every mutation, so the outcome is sent exactly once.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::bus::{BusEvent, EventBus, EventHandler, PresenceUpdate};
use crate::error::CourierError;
use crate::types::{Identity, RequestId};

/// Phase of a discovery round
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundPhase {
    Init,
    AwaitingRosterMatch,
    AwaitingPresenceKeysBlocklist,
    Done,
    Unavailable,
}

impl RoundPhase {
    pub fn is_finished(&self) -> bool {
        matches!(self, RoundPhase::Done | RoundPhase::Unavailable)
    }
}

/// Everything learned about one identity during a round
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceItem {
    pub identity: Identity,
    pub status: Option<String>,
    pub timestamp: Option<i64>,
    pub roster_name: Option<String>,
    pub public_key: Option<Vec<u8>>,
    pub blocked: bool,
    /// A presence was received for this identity
    pub presence: bool,
    /// The server matched this identity against our roster
    pub matched: bool,
    /// The server does not know this identity any more
    pub discarded: bool,
}

impl PresenceItem {
    fn new(identity: Identity) -> Self {
        Self {
            identity,
            status: None,
            timestamp: None,
            roster_name: None,
            public_key: None,
            blocked: false,
            presence: false,
            matched: false,
            discarded: false,
        }
    }
}

/// How a round ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoundOutcome {
    Completed(Vec<PresenceItem>),
    /// The connection went away before the round finished
    Unavailable,
}

struct RoundState {
    phase: RoundPhase,
    candidates: Vec<Identity>,
    batch_size: usize,
    pending_batches: HashSet<RequestId>,
    /// Identities are already lowercased, so lookups here are case-insensitive
    items: BTreeMap<Identity, PresenceItem>,
    matched: usize,
    presence_count: usize,
    key_count: usize,
    blocklist_received: bool,
    activity_checks: HashMap<RequestId, Identity>,
    unsubscribed: HashSet<Identity>,
    done_tx: Option<oneshot::Sender<RoundOutcome>>,
}

impl RoundState {
    fn item(&mut self, identity: &Identity) -> &mut PresenceItem {
        self.items
            .entry(identity.clone())
            .or_insert_with(|| PresenceItem::new(identity.clone()))
    }

    fn roster_complete(&self) -> bool {
        self.phase != RoundPhase::Init && self.pending_batches.is_empty()
    }

    fn is_complete(&self) -> bool {
        self.roster_complete()
            && self.blocklist_received
            && (self.matched == 0
                || (self.key_count >= self.presence_count && self.activity_checks.is_empty()))
    }

    fn finish(&mut self, phase: RoundPhase, outcome: RoundOutcome) {
        self.phase = phase;
        if let Some(tx) = self.done_tx.take() {
            // The waiter may have timed out already.
            let _ = tx.send(outcome);
        }
    }
}

/// One discovery round over the bus.
///
/// Register it with [`EventBus::register`], then ask for the connection
/// status; the round starts on the `Connected` answer.
pub struct DiscoveryRound {
    bus: EventBus,
    presence_id: RequestId,
    key_id: RequestId,
    blocklist_id: RequestId,
    state: Mutex<RoundState>,
}

impl DiscoveryRound {
    pub fn new(
        candidates: Vec<Identity>,
        bus: EventBus,
        batch_size: usize,
    ) -> (Arc<Self>, oneshot::Receiver<RoundOutcome>) {
        let (done_tx, done_rx) = oneshot::channel();
        let round = Arc::new(Self {
            bus,
            presence_id: RequestId::new(),
            key_id: RequestId::new(),
            blocklist_id: RequestId::new(),
            state: Mutex::new(RoundState {
                phase: RoundPhase::Init,
                candidates,
                batch_size: batch_size.max(1),
                pending_batches: HashSet::new(),
                items: BTreeMap::new(),
                matched: 0,
                presence_count: 0,
                key_count: 0,
                blocklist_received: false,
                activity_checks: HashMap::new(),
                unsubscribed: HashSet::new(),
                done_tx: Some(done_tx),
            }),
        });
        (round, done_rx)
    }

    pub fn phase(&self) -> RoundPhase {
        self.state.lock().phase
    }

    /// Snapshot of the items collected so far
    pub fn items(&self) -> Vec<PresenceItem> {
        self.state.lock().items.values().cloned().collect()
    }

    pub fn presence_request_id(&self) -> RequestId {
        self.presence_id
    }

    pub fn key_request_id(&self) -> RequestId {
        self.key_id
    }

    /// Id a blocklist answer must carry. The blocklist may be answered at any
    /// point after the round started, even before it was requested.
    pub fn blocklist_request_id(&self) -> RequestId {
        self.blocklist_id
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Handlers (all called with the state lock held)
    // ═══════════════════════════════════════════════════════════════════════

    fn on_connected(&self, state: &mut RoundState) {
        if state.phase != RoundPhase::Init {
            return;
        }
        state.phase = RoundPhase::AwaitingRosterMatch;

        let candidates = std::mem::take(&mut state.candidates);
        let mut batches = 0;
        for chunk in candidates.chunks(state.batch_size) {
            let batch_id = RequestId::new();
            state.pending_batches.insert(batch_id);
            self.bus.publish(BusEvent::RosterMatchRequest {
                batch_id,
                identities: chunk.to_vec(),
            });
            batches += 1;
        }
        info!(candidates = candidates.len(), batches, "Discovery round started");

        if state.pending_batches.is_empty() {
            self.on_roster_complete(state);
        }
    }

    fn on_roster_match(&self, state: &mut RoundState, batch_id: RequestId, matched: &[Identity]) {
        if !state.pending_batches.remove(&batch_id) {
            self.mismatch("roster_match", batch_id);
            return;
        }
        for identity in matched {
            let item = state.item(identity);
            if !item.matched {
                item.matched = true;
                state.matched += 1;
            }
        }
        debug!(
            matched = matched.len(),
            pending = state.pending_batches.len(),
            "Roster match batch answered"
        );
        if state.pending_batches.is_empty() {
            self.on_roster_complete(state);
        }
    }

    fn on_roster_complete(&self, state: &mut RoundState) {
        if state.matched == 0 && state.blocklist_received {
            debug!("No roster matches, skipping presence and key requests");
            return;
        }
        state.phase = RoundPhase::AwaitingPresenceKeysBlocklist;
        self.bus.publish(BusEvent::PresenceRequest {
            id: self.presence_id,
        });
        self.bus.publish(BusEvent::PublicKeyRequest { id: self.key_id });
        if !state.blocklist_received {
            self.bus.publish(BusEvent::BlocklistRequest {
                id: self.blocklist_id,
            });
        }
        debug!(matched = state.matched, "Roster complete, waiting for presence, keys and blocklist");
    }

    fn on_presence(&self, state: &mut RoundState, update: &PresenceUpdate) {
        if update.id != self.presence_id || state.phase != RoundPhase::AwaitingPresenceKeysBlocklist
        {
            self.mismatch("presence", update.id);
            return;
        }
        let item = state.item(&update.identity);
        if update.status.is_some() {
            item.status = update.status.clone();
        }
        if update.timestamp.is_some() {
            item.timestamp = update.timestamp;
        }
        if update.roster_name.is_some() {
            item.roster_name = update.roster_name.clone();
        }
        if item.presence {
            return;
        }
        item.presence = true;
        let verify = !item.matched && update.mutual_subscription;
        state.presence_count += 1;

        if verify {
            let id = RequestId::new();
            state.activity_checks.insert(id, update.identity.clone());
            debug!(identity = %update.identity, "Verifying unmatched subscribed identity");
            self.bus.publish(BusEvent::LastActivityRequest {
                id,
                identity: update.identity.clone(),
            });
        }
    }

    fn on_public_key(&self, state: &mut RoundState, id: RequestId, identity: &Identity, key: &[u8]) {
        if id != self.key_id || state.phase != RoundPhase::AwaitingPresenceKeysBlocklist {
            self.mismatch("public_key", id);
            return;
        }
        // Keys only attach to identities this round already knows about
        match state.items.get_mut(identity) {
            Some(item) => {
                item.public_key = Some(key.to_vec());
                state.key_count += 1;
            }
            None => debug!(%identity, "Ignoring public key for unknown identity"),
        }
    }

    fn on_blocklist(&self, state: &mut RoundState, id: RequestId, blocked: &[Identity]) {
        if id != self.blocklist_id {
            self.mismatch("blocklist", id);
            return;
        }
        state.blocklist_received = true;
        for identity in blocked {
            if let Some(item) = state.items.get_mut(identity) {
                item.blocked = true;
            }
        }
        debug!(blocked = blocked.len(), "Blocklist received");
    }

    fn on_last_activity(
        &self,
        state: &mut RoundState,
        id: RequestId,
        identity: &Identity,
        not_found: bool,
    ) {
        let Some(checked) = state.activity_checks.remove(&id) else {
            self.mismatch("last_activity", id);
            return;
        };
        if checked != *identity {
            debug!(expected = %checked, got = %identity, "Last activity answered for another identity");
        }
        if !not_found {
            return;
        }
        state.item(&checked).discarded = true;
        if state.unsubscribed.insert(checked.clone()) {
            info!(identity = %checked, "Identity no longer exists, unsubscribing");
            self.bus
                .publish(BusEvent::UnsubscribeRequest { identity: checked });
        }
    }

    fn mismatch(&self, event: &'static str, id: RequestId) {
        let err = CourierError::ProtocolMismatch(format!("{} for unknown request {}", event, id));
        debug!(error = %err, "Ignoring discovery event");
    }

    fn check_complete(&self, state: &mut RoundState) {
        if state.phase.is_finished() || !state.is_complete() {
            return;
        }
        let items: Vec<PresenceItem> = state.items.values().cloned().collect();
        info!(
            items = items.len(),
            matched = state.matched,
            presence = state.presence_count,
            keys = state.key_count,
            "Discovery round complete"
        );
        state.finish(RoundPhase::Done, RoundOutcome::Completed(items));
    }
}

impl EventHandler for DiscoveryRound {
    fn handle(&self, event: &BusEvent) {
        let mut state = self.state.lock();
        if state.phase.is_finished() {
            return;
        }

        match event {
            BusEvent::Connected => self.on_connected(&mut state),
            BusEvent::Disconnected => {
                warn!(phase = ?state.phase, "Connection lost during discovery round");
                state.finish(RoundPhase::Unavailable, RoundOutcome::Unavailable);
                return;
            }
            BusEvent::RosterMatch { batch_id, matched } => {
                self.on_roster_match(&mut state, *batch_id, matched)
            }
            BusEvent::Presence(update) => self.on_presence(&mut state, update),
            BusEvent::PublicKey { id, identity, key } => {
                self.on_public_key(&mut state, *id, identity, key)
            }
            BusEvent::Blocklist { id, blocked } => {
                if state.phase == RoundPhase::Init {
                    self.mismatch("blocklist", *id);
                    return;
                }
                self.on_blocklist(&mut state, *id, blocked)
            }
            BusEvent::LastActivity {
                id,
                identity,
                not_found,
            } => self.on_last_activity(&mut state, *id, identity, *not_found),
            _ => return,
        }

        self.check_complete(&mut state);
    }
}
