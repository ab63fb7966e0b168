//! Contact sync coordinator
//!
//! A sync turns the local address book into synced [`Contact`] rows:
//!
//! 1. mark the contact table for resync and collect candidate identities
//! 2. run a [`DiscoveryRound`] over the bus, bounded by the sync timeout
//! 3. replace the previously synced contacts with the round's result
//! 4. clear the resync mark
//!
//! A round that times out or loses the connection leaves the table marked and
//! untouched; it is counted as an I/O exception and the next sync retries. A
//! cancelled sync never writes a contact batch.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bus::{BusEvent, EventBus};
use crate::config::CourierConfig;
use crate::crypto::CryptoProvider;
use crate::discovery::{DiscoveryRound, PresenceItem, RoundOutcome};
use crate::error::{CourierError, CourierResult};
use crate::storage::Repository;
use crate::types::{AddressBookEntry, Contact, ContactOp, Identity};

/// Address book numbers shorter than this are never looked up
const MIN_NUMBER_DIGITS: usize = 4;

/// Counters of one sync, in the spirit of a platform sync result
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStats {
    /// Previously synced contacts removed
    pub deletes: usize,
    /// Contacts (and profile) written
    pub inserts: usize,
    /// Items returned by the discovery round
    pub entries: usize,
    /// Batch entries the store refused
    pub skipped_entries: usize,
    /// Rounds that timed out or lost the connection
    pub io_exceptions: usize,
    /// A storage operation failed
    pub database_error: bool,
}

/// Why a sync did not run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    OfflineMode,
    NoServer,
    Throttled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Skipped(SkipReason),
    Completed(SyncStats),
}

/// Runs contact syncs against a repository and the event bus
pub struct ContactSyncer {
    repo: Arc<dyn Repository>,
    bus: EventBus,
    crypto: Arc<dyn CryptoProvider>,
    config: CourierConfig,
    last_sync: Mutex<Option<Instant>>,
}

impl ContactSyncer {
    pub fn new(
        repo: Arc<dyn Repository>,
        bus: EventBus,
        crypto: Arc<dyn CryptoProvider>,
        config: CourierConfig,
    ) -> Self {
        Self {
            repo,
            bus,
            crypto,
            config,
            last_sync: Mutex::new(None),
        }
    }

    /// Run one sync.
    ///
    /// Automatic syncs (`forced == false`) closer than the minimum interval to
    /// the previous one are skipped. Returns [`CourierError::Cancelled`] when
    /// `cancel` fires before the result is written.
    pub async fn sync(&self, forced: bool, cancel: &CancellationToken) -> CourierResult<SyncOutcome> {
        if self.config.offline_mode {
            debug!("Offline mode, not syncing contacts");
            return Ok(SyncOutcome::Skipped(SkipReason::OfflineMode));
        }
        let Some(server) = self.config.endpoint_server.clone() else {
            debug!("No server known, not syncing contacts");
            return Ok(SyncOutcome::Skipped(SkipReason::NoServer));
        };
        if cancel.is_cancelled() {
            return Err(CourierError::Cancelled);
        }
        if !self.claim(forced) {
            debug!("Contact sync throttled");
            return Ok(SyncOutcome::Skipped(SkipReason::Throttled));
        }

        let mut stats = SyncStats::default();
        let result = self.run(&server, cancel, &mut stats).await;
        *self.last_sync.lock() = Some(Instant::now());

        match result {
            Ok(()) => {}
            Err(CourierError::Cancelled) => {
                info!("Contact sync cancelled");
                return Err(CourierError::Cancelled);
            }
            Err(e) if e.is_storage() => {
                error!(error = %e, "Contact sync failed on storage");
                stats.database_error = true;
            }
            Err(e) => return Err(e),
        }

        info!(
            deletes = stats.deletes,
            inserts = stats.inserts,
            entries = stats.entries,
            skipped = stats.skipped_entries,
            io_exceptions = stats.io_exceptions,
            database_error = stats.database_error,
            "Contact sync finished"
        );
        Ok(SyncOutcome::Completed(stats))
    }

    /// Check the throttle and stamp the start time under one lock. Returns
    /// false when an automatic sync has to be skipped.
    fn claim(&self, forced: bool) -> bool {
        let mut last_sync = self.last_sync.lock();
        let interval = self.config.min_sync_interval();
        if !forced && last_sync.is_some_and(|last| last.elapsed() < interval) {
            return false;
        }
        *last_sync = Some(Instant::now());
        true
    }

    async fn run(
        &self,
        server: &str,
        cancel: &CancellationToken,
        stats: &mut SyncStats,
    ) -> CourierResult<()> {
        self.repo.begin_resync()?;
        let local = self.candidates(server, stats)?;

        if local.is_empty() {
            stats.deletes = self.repo.delete_synced_contacts()?;
            self.repo.commit_resync()?;
            debug!(deletes = stats.deletes, "No sync candidates, synced contacts cleared");
            return Ok(());
        }

        let candidates: Vec<Identity> = local.keys().cloned().collect();
        let Some(items) = self.discover(candidates, cancel, stats).await? else {
            return Ok(());
        };
        if cancel.is_cancelled() {
            return Err(CourierError::Cancelled);
        }

        stats.entries = items.len();
        stats.deletes = self.repo.delete_synced_contacts()?;

        let ops = self.materialize(&items, &local);
        let outcome = self.repo.apply_contact_batch(&ops)?;
        stats.inserts = outcome.applied;
        stats.skipped_entries += outcome.skipped;

        self.repo.commit_resync()?;
        Ok(())
    }

    /// Local identities keyed by the server-side identity of their number
    fn candidates(
        &self,
        server: &str,
        stats: &mut SyncStats,
    ) -> CourierResult<BTreeMap<Identity, AddressBookEntry>> {
        let mut candidates = BTreeMap::new();
        for entry in self.repo.sync_candidates()? {
            let digits = entry.number.chars().filter(|c| c.is_ascii_digit()).count();
            if digits < MIN_NUMBER_DIGITS {
                debug!(lookup_key = %entry.lookup_key, "Skipping short number");
                stats.skipped_entries += 1;
                continue;
            }
            let identity = Identity::for_number(&entry.number, server);
            candidates.entry(identity).or_insert(entry);
        }
        Ok(candidates)
    }

    /// Register a round, start it and wait for its outcome.
    ///
    /// `Ok(None)` means the round produced nothing usable (timeout or lost
    /// connection); it has been counted in `stats`.
    async fn discover(
        &self,
        candidates: Vec<Identity>,
        cancel: &CancellationToken,
        stats: &mut SyncStats,
    ) -> CourierResult<Option<Vec<PresenceItem>>> {
        let (round, done) =
            DiscoveryRound::new(candidates, self.bus.clone(), self.config.roster_batch_size);
        let subscription = self.bus.register("discovery_round", round);
        self.bus.publish(BusEvent::ConnectionStatusRequest);

        let timeout = self.config.sync_timeout();
        let outcome = tokio::select! {
            outcome = tokio::time::timeout(timeout, done) => outcome,
            _ = cancel.cancelled() => {
                subscription.unsubscribe();
                return Err(CourierError::Cancelled);
            }
        };
        subscription.unsubscribe();

        match outcome {
            Ok(Ok(RoundOutcome::Completed(items))) => Ok(Some(items)),
            Ok(Ok(RoundOutcome::Unavailable)) => {
                warn!(error = %CourierError::ConnectionLost, "Discovery round aborted");
                stats.io_exceptions += 1;
                Ok(None)
            }
            Ok(Err(_)) => {
                warn!("Discovery round dropped without an outcome");
                stats.io_exceptions += 1;
                Ok(None)
            }
            Err(_) => {
                let err = CourierError::NetworkTimeout(timeout.as_secs());
                warn!(error = %err, "Discovery round did not complete");
                stats.io_exceptions += 1;
                Ok(None)
            }
        }
    }

    fn materialize(
        &self,
        items: &[PresenceItem],
        local: &BTreeMap<Identity, AddressBookEntry>,
    ) -> Vec<ContactOp> {
        let mut ops = Vec::with_capacity(items.len());
        for item in items.iter().filter(|i| !i.discarded) {
            let entry = local.get(&item.identity);
            let number = entry
                .map(|e| e.number.clone())
                .unwrap_or_else(|| item.identity.local_part().to_string());
            let display_name = entry
                .and_then(|e| e.display_name.clone())
                .or_else(|| {
                    item.public_key
                        .as_deref()
                        .and_then(|key| self.crypto.key_display_name(key))
                })
                .or_else(|| item.roster_name.clone())
                .unwrap_or_else(|| number.clone());

            let mut contact = Contact::new(item.identity.clone(), number, display_name);
            contact.lookup_key = entry.map(|e| e.lookup_key.clone());
            contact.status = item.status.clone();
            contact.last_seen = item.timestamp;
            contact.fingerprint = item
                .public_key
                .as_deref()
                .map(|key| self.crypto.fingerprint(key));
            contact.public_key = item.public_key.clone();
            contact.blocked = item.blocked;

            if self.config.is_self(&item.identity) {
                ops.push(ContactOp::Profile(contact.clone()));
            }
            ops.push(ContactOp::Upsert(contact));
        }
        ops
    }

    /// Run automatic syncs every `interval` until `cancel` fires
    pub fn spawn_periodic(
        self: Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                match self.sync(false, &cancel).await {
                    Ok(outcome) => debug!(?outcome, "Periodic contact sync"),
                    Err(CourierError::Cancelled) => break,
                    Err(e) => warn!(error = %e, "Periodic contact sync failed"),
                }
            }
            debug!("Periodic contact sync stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::PlaintextCrypto;
    use crate::storage::RedbRepository;
    use tempfile::tempdir;

    fn syncer(config: CourierConfig) -> (tempfile::TempDir, ContactSyncer) {
        let dir = tempdir().unwrap();
        let repo = Arc::new(RedbRepository::open(dir.path().join("courier.redb")).unwrap());
        let syncer = ContactSyncer::new(repo, EventBus::new(), Arc::new(PlaintextCrypto), config);
        (dir, syncer)
    }

    #[tokio::test]
    async fn test_offline_and_serverless_are_skipped() {
        let mut config = CourierConfig::new(Identity::new("me@x"), "x");
        config.offline_mode = true;
        let (_dir, offline) = syncer(config);
        let token = CancellationToken::new();
        assert_eq!(
            offline.sync(true, &token).await.unwrap(),
            SyncOutcome::Skipped(SkipReason::OfflineMode)
        );

        let (_dir, serverless) = syncer(CourierConfig::default());
        assert_eq!(
            serverless.sync(true, &token).await.unwrap(),
            SyncOutcome::Skipped(SkipReason::NoServer)
        );
    }

    #[tokio::test]
    async fn test_empty_address_book_clears_synced_contacts() {
        let (_dir, syncer) = syncer(CourierConfig::new(Identity::new("me@x"), "x"));
        syncer
            .repo
            .apply_contact_batch(&[ContactOp::Upsert(Contact::new(
                Identity::new("old@x"),
                "5551234",
                "Old",
            ))])
            .unwrap();

        let token = CancellationToken::new();
        let outcome = syncer.sync(false, &token).await.unwrap();
        assert_eq!(
            outcome,
            SyncOutcome::Completed(SyncStats {
                deletes: 1,
                ..Default::default()
            })
        );
        assert!(syncer.repo.contacts().unwrap().is_empty());
        assert!(!syncer.repo.is_resync_pending().unwrap());

        // A second automatic sync right away is throttled; a forced one is not.
        assert_eq!(
            syncer.sync(false, &token).await.unwrap(),
            SyncOutcome::Skipped(SkipReason::Throttled)
        );
        assert!(matches!(
            syncer.sync(true, &token).await.unwrap(),
            SyncOutcome::Completed(_)
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_automatic_syncs_run_once() {
        let (_dir, syncer) = syncer(CourierConfig::new(Identity::new("me@x"), "x"));
        let syncer = Arc::new(syncer);
        let barrier = Arc::new(tokio::sync::Barrier::new(8));
        let token = CancellationToken::new();

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let syncer = syncer.clone();
                let barrier = barrier.clone();
                let token = token.clone();
                tokio::spawn(async move {
                    barrier.wait().await;
                    syncer.sync(false, &token).await.unwrap()
                })
            })
            .collect();

        let mut completed = 0;
        for task in tasks {
            match task.await.unwrap() {
                SyncOutcome::Completed(_) => completed += 1,
                outcome => assert_eq!(outcome, SyncOutcome::Skipped(SkipReason::Throttled)),
            }
        }
        assert_eq!(completed, 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let (_dir, syncer) = syncer(CourierConfig::new(Identity::new("me@x"), "x"));
        let token = CancellationToken::new();
        token.cancel();
        let err = syncer.sync(true, &token).await.unwrap_err();
        assert!(matches!(err, CourierError::Cancelled));
        assert!(!syncer.repo.is_resync_pending().unwrap());
    }

    #[test]
    fn test_short_numbers_are_not_candidates() {
        let (_dir, syncer) = syncer(CourierConfig::new(Identity::new("me@x"), "x"));
        for (key, number) in [("a", "112"), ("b", "+39 333 1234567"), ("c", "3331234567")] {
            syncer
                .repo
                .add_address_book_entry(&AddressBookEntry {
                    number: number.into(),
                    lookup_key: key.into(),
                    display_name: None,
                })
                .unwrap();
        }
        let mut stats = SyncStats::default();
        let candidates = syncer.candidates("x", &mut stats).unwrap();
        assert_eq!(candidates.len(), 2);
        assert_eq!(stats.skipped_entries, 1);
        assert!(candidates
            .values()
            .all(|e| e.lookup_key == "b" || e.lookup_key == "c"));
    }

    #[test]
    fn test_materialize_prefers_local_names() {
        let config = CourierConfig::new(Identity::new("me@x"), "x");
        let (_dir, syncer) = syncer(config);
        let alice = Identity::new("alice@x");
        let me = Identity::new("me@x");
        let mut local = BTreeMap::new();
        local.insert(
            alice.clone(),
            AddressBookEntry {
                number: "5550001".into(),
                lookup_key: "lk-alice".into(),
                display_name: Some("Alice A.".into()),
            },
        );

        let item = |identity: &Identity, roster: Option<&str>| PresenceItem {
            identity: identity.clone(),
            status: Some("busy".into()),
            timestamp: Some(42),
            roster_name: roster.map(String::from),
            public_key: Some(vec![7; 8]),
            blocked: false,
            presence: true,
            matched: true,
            discarded: false,
        };
        let mut gone = item(&Identity::new("gone@x"), None);
        gone.discarded = true;

        let ops = syncer.materialize(
            &[item(&alice, Some("Roster Alice")), item(&me, Some("Me")), gone],
            &local,
        );
        assert_eq!(ops.len(), 3);
        let alice_contact = ops[0].contact();
        assert_eq!(alice_contact.display_name, "Alice A.");
        assert_eq!(alice_contact.lookup_key.as_deref(), Some("lk-alice"));
        assert_eq!(alice_contact.last_seen, Some(42));
        assert_eq!(
            alice_contact.fingerprint.as_deref(),
            Some(PlaintextCrypto.fingerprint(&[7; 8]).as_str())
        );
        assert!(matches!(ops[1], ContactOp::Profile(_)));
        assert_eq!(ops[2].contact().display_name, "Me");
    }
}
