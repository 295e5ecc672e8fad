use std::sync::Arc;

use aes::Aes256;
use ctr::cipher::{KeyIvInit, StreamCipher};
use rand::{rngs::OsRng, RngCore};
use zeroize::ZeroizeOnDrop;

use crate::error::{Error, Result};

/// AES-256 in CTR mode with the whole 16-byte IV used as a big-endian counter block.
type Aes256Ctr = ctr::Ctr128BE<Aes256>;

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 16;

/// 256-bit encryption key, held in memory for the process lifetime.
#[derive(ZeroizeOnDrop)]
pub struct EncryptionKey([u8; KEY_LEN]);

impl EncryptionKey {
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Wrap raw key bytes. Anything other than exactly 32 bytes is a malformed key.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let key: [u8; KEY_LEN] = bytes.try_into().map_err(|_| {
            Error::CipherInit(format!(
                "key must be {KEY_LEN} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self(key))
    }

    /// Parse a key from 64 hex characters (surrounding whitespace ignored).
    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s.trim())
            .map_err(|e| Error::CipherInit(format!("key is not valid hex: {e}")))?;
        Self::from_slice(&bytes)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

/// Generate a fresh random 256-bit key.
pub fn generate_key() -> EncryptionKey {
    let mut key = [0u8; KEY_LEN];
    OsRng.fill_bytes(&mut key);
    EncryptionKey(key)
}

/// Load a key previously persisted as raw bytes. Returns `None` on a length mismatch.
pub fn load_key(bytes: &[u8]) -> Option<EncryptionKey> {
    EncryptionKey::from_slice(bytes).ok()
}

/// Stream cipher bound to one process-wide key.
///
/// There is no authentication tag: a flipped ciphertext or nonce bit decrypts
/// to different bytes instead of failing. Ciphertext length always equals
/// plaintext length.
#[derive(Clone)]
pub struct Cipher {
    key: Arc<EncryptionKey>,
}

impl Cipher {
    pub fn new(key: EncryptionKey) -> Self {
        Self { key: Arc::new(key) }
    }

    /// Encrypt `plaintext` under a fresh random nonce, returning `(ciphertext, nonce)`.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<(Vec<u8>, [u8; NONCE_LEN])> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let mut stream = Aes256Ctr::new_from_slices(self.key.as_bytes(), &nonce)
            .map_err(|e| Error::CipherInit(e.to_string()))?;

        let mut ciphertext = plaintext.to_vec();
        stream.apply_keystream(&mut ciphertext);
        Ok((ciphertext, nonce))
    }

    /// Regenerate the keystream for `nonce` and XOR it back out of `ciphertext`.
    pub fn decrypt(&self, ciphertext: &[u8], nonce: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.is_empty() {
            return Err(Error::InvalidInput("empty ciphertext"));
        }
        if nonce.len() != NONCE_LEN {
            return Err(Error::InvalidInput("nonce must be 16 bytes"));
        }

        let mut stream = Aes256Ctr::new_from_slices(self.key.as_bytes(), nonce)
            .map_err(|e| Error::CipherInit(e.to_string()))?;

        let mut plaintext = ciphertext.to_vec();
        stream.apply_keystream(&mut plaintext);
        Ok(plaintext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher() -> Cipher {
        Cipher::new(generate_key())
    }

    #[test]
    fn round_trip() {
        let c = cipher();
        let plaintext = b"hello, oncelink!";
        let (ct, nonce) = c.encrypt(plaintext).unwrap();
        assert_eq!(ct.len(), plaintext.len());
        assert_ne!(ct.as_slice(), plaintext.as_slice());
        assert_eq!(c.decrypt(&ct, &nonce).unwrap(), plaintext);
    }

    #[test]
    fn round_trip_multi_block() {
        let c = cipher();
        let plaintext: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        let (ct, nonce) = c.encrypt(&plaintext).unwrap();
        assert_eq!(c.decrypt(&ct, &nonce).unwrap(), plaintext);
    }

    #[test]
    fn fresh_nonce_per_encryption() {
        let c = cipher();
        let (ct1, n1) = c.encrypt(b"same").unwrap();
        let (ct2, n2) = c.encrypt(b"same").unwrap();
        assert_ne!(n1, n2);
        assert_ne!(ct1, ct2);
    }

    #[test]
    fn empty_plaintext_encrypts_to_empty() {
        let (ct, _) = cipher().encrypt(b"").unwrap();
        assert!(ct.is_empty());
    }

    #[test]
    fn empty_ciphertext_rejected() {
        let nonce = [0u8; NONCE_LEN];
        assert!(matches!(
            cipher().decrypt(&[], &nonce),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn wrong_nonce_length_rejected() {
        let c = cipher();
        let (ct, _) = c.encrypt(b"secret").unwrap();
        assert!(matches!(
            c.decrypt(&ct, &[0u8; 12]),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn tampering_is_not_detected() {
        let c = cipher();
        let (mut ct, mut nonce) = c.encrypt(b"attack at dawn").unwrap();
        ct[0] ^= 0x01;
        let pt = c.decrypt(&ct, &nonce).unwrap();
        assert_eq!(pt[0], b'a' ^ 0x01);
        assert_eq!(&pt[1..], b"ttack at dawn");

        ct[0] ^= 0x01;
        nonce[15] ^= 0x01;
        let pt = c.decrypt(&ct, &nonce).unwrap();
        assert_eq!(pt.len(), ct.len());
        assert_ne!(pt.as_slice(), b"attack at dawn".as_slice());
    }

    #[test]
    fn wrong_key_yields_garbage() {
        let (ct, nonce) = cipher().encrypt(b"secret").unwrap();
        let pt = cipher().decrypt(&ct, &nonce).unwrap();
        assert_ne!(pt.as_slice(), b"secret".as_slice());
    }

    #[test]
    fn malformed_key_rejected() {
        assert!(matches!(
            EncryptionKey::from_slice(&[0u8; 16]),
            Err(Error::CipherInit(_))
        ));
        assert!(matches!(
            EncryptionKey::from_hex("not-hex"),
            Err(Error::CipherInit(_))
        ));
        assert!(load_key(&[1u8; 31]).is_none());
    }

    #[test]
    fn hex_key_round_trip() {
        let key = generate_key();
        let parsed = EncryptionKey::from_hex(&format!("  {}\n", key.to_hex())).unwrap();
        assert_eq!(parsed.as_bytes(), key.as_bytes());
    }

    #[test]
    fn matches_nist_sp800_38a_ctr_vector() {
        // F.5.5 CTR-AES256.Encrypt, first block.
        let key = EncryptionKey::from_hex(
            "603deb1015ca71be2b73aef0857d77811f352c073b6108d72d9810a30914dff4",
        )
        .unwrap();
        let iv = hex::decode("f0f1f2f3f4f5f6f7f8f9fafbfcfdfeff").unwrap();
        let ct = hex::decode("601ec313775789a5b7a7f504bbf3d228").unwrap();
        let pt = Cipher::new(key).decrypt(&ct, &iv).unwrap();
        assert_eq!(hex::encode(pt), "6bc1bee22e409f96e93d7e117393172a");
    }
}
