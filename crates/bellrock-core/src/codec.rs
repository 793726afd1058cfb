//! Anonymous-ID codec
//!
//! An AID is a single AES-128 block: `E_k(uid ‖ nonce)` with a fresh 8-byte
//! random nonce per broadcast. Single-block ECB is intentional — the whole
//! message is one block, freshness comes from the nonce rather than from
//! chaining, and forgery resistance comes from the sparse match test: a
//! random block decrypts to a given 8-byte UID with probability 2^-64.

use crate::types::{Aid, SecretKey, Uid};
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;
use parking_lot::RwLock;
use rand::rngs::OsRng;
use rand::RngCore;
use std::collections::HashMap;
use std::sync::Arc;

/// Produce a fresh AID for `uid` under `key`.
///
/// Every call draws a new nonce, so two successive calls yield distinct
/// tokens except on an 8-byte nonce collision.
pub fn anonymize(uid: Uid, key: &SecretKey) -> Aid {
    let cipher = Aes128::new(GenericArray::from_slice(key.as_bytes()));
    let mut block = [0u8; 16];
    block[..8].copy_from_slice(uid.as_bytes());
    OsRng.fill_bytes(&mut block[8..]);

    let mut block = GenericArray::from(block);
    cipher.encrypt_block(&mut block);
    Aid(block.into())
}

/// Decrypt one block of `aid` under a prepared cipher.
///
/// Never fails for well-formed inputs; an unrelated key simply yields noise
/// that will not pass [`matches`].
pub fn trial_decrypt(aid: &Aid, cipher: &Aes128) -> [u8; 16] {
    let mut block = GenericArray::from(aid.0);
    cipher.decrypt_block(&mut block);
    block.into()
}

/// True iff the first 8 bytes of a decrypted block equal `uid`.
///
/// The remaining 8 bytes are the decrypted nonce and are discarded.
pub fn matches(plaintext: &[u8; 16], uid: Uid) -> bool {
    plaintext[..8] == uid.as_bytes()[..]
}

/// One complete trial: decrypt `aid` under `key` and test against `uid`.
pub fn resolves_to(aid: &Aid, key: &SecretKey, uid: Uid) -> bool {
    let cipher = Aes128::new(GenericArray::from_slice(key.as_bytes()));
    matches(&trial_decrypt(aid, &cipher), uid)
}

/// Memoized cipher instances, keyed by key bytes.
///
/// Key-schedule setup dominates the cost of a single-block trial decryption,
/// so the resolver reuses one cipher per key across attempts and batches.
/// Entries for retired keys are harmless: a stale cipher can only match an
/// AID minted under that retired key, and retired keys are never offered as
/// candidates.
#[derive(Default)]
pub struct CipherCache {
    ciphers: RwLock<HashMap<[u8; 16], Arc<Aes128>>>,
}

impl CipherCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch the cipher for `key`, initializing it on first use.
    pub fn get(&self, key: &SecretKey) -> Arc<Aes128> {
        if let Some(cipher) = self.ciphers.read().get(key.as_bytes()) {
            return cipher.clone();
        }
        let cipher = Arc::new(Aes128::new(GenericArray::from_slice(key.as_bytes())));
        self.ciphers
            .write()
            .entry(*key.as_bytes())
            .or_insert(cipher)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.ciphers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let uid = Uid::random();
        let key = SecretKey::random();

        let aid = anonymize(uid, &key);
        assert!(resolves_to(&aid, &key, uid));
    }

    #[test]
    fn test_freshness() {
        let uid = Uid::random();
        let key = SecretKey::random();

        // Distinct nonces make successive tokens distinct.
        let a = anonymize(uid, &key);
        let b = anonymize(uid, &key);
        assert_ne!(a, b);

        // Both still decrypt to the same sender.
        assert!(resolves_to(&a, &key, uid));
        assert!(resolves_to(&b, &key, uid));
    }

    #[test]
    fn test_unlinkable_under_wrong_key() {
        let uid = Uid::random();
        let key = SecretKey::random();
        let wrong_key = SecretKey::random();
        let other_uid = Uid::random();

        let aid = anonymize(uid, &key);
        assert!(!resolves_to(&aid, &wrong_key, uid));
        assert!(!resolves_to(&aid, &wrong_key, other_uid));
        assert!(!resolves_to(&aid, &key, other_uid));
    }

    #[test]
    fn test_nonce_is_discarded_by_match() {
        let uid = Uid([7; 8]);
        let mut plaintext = [0u8; 16];
        plaintext[..8].copy_from_slice(uid.as_bytes());

        // Any trailing 8 bytes match; only the UID prefix is compared.
        plaintext[8..].copy_from_slice(&[0xaa; 8]);
        assert!(matches(&plaintext, uid));
        plaintext[8..].copy_from_slice(&[0x55; 8]);
        assert!(matches(&plaintext, uid));

        plaintext[0] ^= 1;
        assert!(!matches(&plaintext, uid));
    }

    #[test]
    fn test_cipher_cache_reuse() {
        let cache = CipherCache::new();
        assert!(cache.is_empty());
        let key = SecretKey::random();

        let a = cache.get(&key);
        let b = cache.get(&key);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 1);

        cache.get(&SecretKey::random());
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_cached_cipher_decrypts() {
        let cache = CipherCache::new();
        let uid = Uid::random();
        let key = SecretKey::random();

        let aid = anonymize(uid, &key);
        let cipher = cache.get(&key);
        assert!(matches(&trial_decrypt(&aid, &cipher), uid));
    }
}
