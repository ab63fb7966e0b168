//! Runtime configuration shared by the queue and the contact syncer.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::Identity;

/// Max number of identities in one roster match request.
pub const ROSTER_MATCH_BATCH_SIZE: usize = 500;

/// Max time to wait for a discovery round to complete.
pub const SYNC_TIMEOUT_SECS: u64 = 60;

/// Minimum interval between two automatic syncs.
pub const MIN_SYNC_INTERVAL_SECS: u64 = 600;

/// Configuration for a Courier client.
///
/// Built in code (or deserialized by the embedding application). Every field
/// has a default matching the protocol constants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CourierConfig {
    /// Our own bare identity, used to recognize self in group commands and sync results
    pub self_identity: Option<Identity>,
    /// When set, no sync round is ever started
    pub offline_mode: bool,
    /// Server endpoint; `None` means no server is known yet
    pub endpoint_server: Option<String>,
    /// Whether outgoing messages are flagged for encryption
    pub encryption_enabled: bool,
    /// Compression level handed to media preparation for images (0 = none)
    pub image_compression: u8,
    /// Identities per roster match request
    pub roster_batch_size: usize,
    /// Bounded wait for a discovery round, in seconds
    pub sync_timeout_secs: u64,
    /// Minimum interval between automatic syncs, in seconds
    pub min_sync_interval_secs: u64,
    /// Largest attachment (bytes) fetched automatically; `None` disables auto-download
    pub auto_download_limit: Option<u64>,
}

impl Default for CourierConfig {
    fn default() -> Self {
        Self {
            self_identity: None,
            offline_mode: false,
            endpoint_server: None,
            encryption_enabled: true,
            image_compression: 0,
            roster_batch_size: ROSTER_MATCH_BATCH_SIZE,
            sync_timeout_secs: SYNC_TIMEOUT_SECS,
            min_sync_interval_secs: MIN_SYNC_INTERVAL_SECS,
            auto_download_limit: Some(512 * 1024),
        }
    }
}

impl CourierConfig {
    /// Create a config for the given self identity and server
    pub fn new(self_identity: Identity, endpoint_server: impl Into<String>) -> Self {
        Self {
            self_identity: Some(self_identity),
            endpoint_server: Some(endpoint_server.into()),
            ..Default::default()
        }
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_secs(self.sync_timeout_secs)
    }

    pub fn min_sync_interval(&self) -> Duration {
        Duration::from_secs(self.min_sync_interval_secs)
    }

    /// Whether `identity` is our own
    pub fn is_self(&self, identity: &Identity) -> bool {
        self.self_identity.as_ref() == Some(identity)
    }

    /// Whether an attachment of `length` bytes may be downloaded without asking
    pub fn can_auto_download(&self, length: u64) -> bool {
        match self.auto_download_limit {
            Some(limit) => length <= limit,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_protocol_constants() {
        let config = CourierConfig::default();
        assert_eq!(config.roster_batch_size, 500);
        assert_eq!(config.sync_timeout(), Duration::from_secs(60));
        assert_eq!(config.min_sync_interval(), Duration::from_secs(600));
        assert!(config.endpoint_server.is_none());
    }

    #[test]
    fn test_auto_download_limit() {
        let mut config = CourierConfig::default();
        config.auto_download_limit = Some(1000);
        assert!(config.can_auto_download(1000));
        assert!(!config.can_auto_download(1001));

        config.auto_download_limit = None;
        assert!(!config.can_auto_download(1));
    }

    #[test]
    fn test_is_self() {
        let me = Identity::new("me@example.org");
        let config = CourierConfig::new(me.clone(), "example.org");
        assert!(config.is_self(&Identity::new("ME@example.org/phone")));
        assert!(!config.is_self(&Identity::new("bob@example.org")));
    }
}
