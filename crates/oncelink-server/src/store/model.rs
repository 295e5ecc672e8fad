use serde::{Deserialize, Serialize};
use zeroize::ZeroizeOnDrop;

use crate::crypto::NONCE_LEN;

/// Stored in redb as bincode-encoded bytes, keyed by the 128-bit secret id.
/// `ciphertext` is AES-256-CTR output over the raw secret value.
/// Lifecycle fields are plaintext so the sweep can evict without decrypting.
#[derive(Debug, Clone, Serialize, Deserialize, ZeroizeOnDrop)]
pub struct SecretRecord {
    /// Same length as the plaintext it encrypts.
    pub ciphertext: Vec<u8>,
    /// Per-record random IV.
    pub nonce: [u8; NONCE_LEN],
    /// Unix timestamp (seconds) when the record was created.
    pub created_at: i64,
    /// Unix timestamp (seconds) at which the record stops being readable.
    pub expires_at: i64,
    /// Set once on the first successful reveal, never cleared.
    pub consumed: bool,
}

impl SecretRecord {
    /// A secret can be revealed iff it is unconsumed and its deadline is still ahead.
    pub fn is_live(&self, now: i64) -> bool {
        !self.consumed && now < self.expires_at
    }

    /// Whether the background sweep should physically delete this record.
    pub fn is_reapable(&self, now: i64) -> bool {
        self.consumed || self.expires_at < now
    }
}
