//! Encrypt/decrypt capability
//!
//! The message queue never touches key material itself. It asks a
//! [`CryptoProvider`] to encrypt a body for a recipient, to decrypt an inbound
//! body from a sender, and to describe public keys discovered during a contact
//! sync.
//!
//! [`PlaintextCrypto`] is the built-in provider: bodies pass through unchanged
//! and fingerprints are BLAKE3 digests. Deployments with real keys inject their
//! own provider.

use crate::error::CourierResult;
use crate::types::Identity;

/// Cryptographic capability keyed by peer identity
pub trait CryptoProvider: Send + Sync + 'static {
    /// Encrypt `plaintext` for `recipient`
    fn encrypt(&self, recipient: &Identity, plaintext: &[u8]) -> CourierResult<Vec<u8>>;

    /// Decrypt `ciphertext` received from `sender`
    fn decrypt(&self, sender: &Identity, ciphertext: &[u8]) -> CourierResult<Vec<u8>>;

    /// Printable fingerprint of a public key
    fn fingerprint(&self, public_key: &[u8]) -> String;

    /// Display name embedded in a public key, if the key format carries one
    fn key_display_name(&self, public_key: &[u8]) -> Option<String>;
}

/// Pass-through provider with BLAKE3 fingerprints
#[derive(Debug, Clone, Copy, Default)]
pub struct PlaintextCrypto;

impl CryptoProvider for PlaintextCrypto {
    fn encrypt(&self, _recipient: &Identity, plaintext: &[u8]) -> CourierResult<Vec<u8>> {
        Ok(plaintext.to_vec())
    }

    fn decrypt(&self, _sender: &Identity, ciphertext: &[u8]) -> CourierResult<Vec<u8>> {
        Ok(ciphertext.to_vec())
    }

    fn fingerprint(&self, public_key: &[u8]) -> String {
        let hash = blake3::hash(public_key);
        hex::encode_upper(&hash.as_bytes()[..20])
    }

    fn key_display_name(&self, _public_key: &[u8]) -> Option<String> {
        None
    }
}
