//! Segregated key store, encrypted at rest
//!
//! Key material never enters the main database. Each row seals one device
//! key with ChaCha20-Poly1305 under a cipher key derived from the
//! operator-supplied master key; the owning UID is bound as associated data
//! so ciphertexts cannot be swapped between rows. A fresh random nonce is
//! stored alongside each ciphertext.

use bellrock_core::types::{SecretKey, Uid};
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use sled::{Db, Tree};
use std::fmt;
use std::path::Path;
use thiserror::Error;

/// Domain separation context for the at-rest cipher key derivation.
const KEY_CONTEXT: &str = "bellrock keystore v1";

const NONCE_LEN: usize = 12;
const MASTER_LEN: usize = 32;

/// Keystore errors
#[derive(Debug, Error)]
pub enum KeystoreError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),
    #[error("master key must be {MASTER_LEN} bytes of hex, got {0} bytes")]
    BadMasterKey(usize),
    #[error("sealed entry for {0} is malformed")]
    Malformed(Uid),
    #[error("cannot open sealed entry for {0} (wrong master key?)")]
    OpenFailed(Uid),
    #[error("sealing key material failed")]
    SealFailed,
}

impl From<KeystoreError> for bellrock_core::Error {
    fn from(e: KeystoreError) -> Self {
        use bellrock_core::Error;
        match e {
            KeystoreError::Sled(_) => Error::Storage(e.to_string()),
            KeystoreError::Malformed(_) => Error::Integrity(e.to_string()),
            KeystoreError::BadMasterKey(_)
            | KeystoreError::OpenFailed(_)
            | KeystoreError::SealFailed => Error::Crypto(e.to_string()),
        }
    }
}

/// At-rest cipher key, derived from operator secret material.
#[derive(Clone)]
pub struct MasterKey([u8; 32]);

impl MasterKey {
    /// Derive from arbitrary secret material with a fixed context string.
    pub fn derive(material: &[u8]) -> Self {
        Self(blake3::derive_key(KEY_CONTEXT, material))
    }

    /// Parse 32 hex-encoded bytes of operator secret.
    pub fn from_hex(hex_str: &str) -> Result<Self, KeystoreError> {
        let bytes = hex::decode(hex_str.trim()).map_err(|_| KeystoreError::BadMasterKey(0))?;
        if bytes.len() != MASTER_LEN {
            return Err(KeystoreError::BadMasterKey(bytes.len()));
        }
        Ok(Self::derive(&bytes))
    }
}

/// Redacted so the master key cannot leak through logs.
impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MasterKey(..)")
    }
}

/// Per-device secret keys, one sealed row per UID.
pub struct Keystore {
    db: Db,
    keys: Tree,
    cipher: ChaCha20Poly1305,
}

impl Keystore {
    /// Open (or create) the key store at the given path.
    pub fn open(path: impl AsRef<Path>, master: &MasterKey) -> Result<Self, KeystoreError> {
        let db = sled::open(path)?;
        let keys = db.open_tree("keys")?;
        let cipher = ChaCha20Poly1305::new_from_slice(&master.0)
            .map_err(|_| KeystoreError::BadMasterKey(master.0.len()))?;
        Ok(Self { db, keys, cipher })
    }

    /// Insert or atomically replace the key for `uid`. Replacement covers
    /// key renewal: the old key is gone once this returns.
    pub fn put(&self, uid: Uid, key: &SecretKey) -> Result<(), KeystoreError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);

        let sealed = self
            .cipher
            .encrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: key.as_bytes(),
                    aad: uid.as_bytes(),
                },
            )
            .map_err(|_| KeystoreError::SealFailed)?;

        let mut value = Vec::with_capacity(NONCE_LEN + sealed.len());
        value.extend_from_slice(&nonce_bytes);
        value.extend_from_slice(&sealed);
        self.keys.insert(uid.as_bytes(), value)?;
        self.db.flush()?;
        Ok(())
    }

    /// The current key for `uid`, or `None` when the UID has no key.
    pub fn get(&self, uid: Uid) -> Result<Option<SecretKey>, KeystoreError> {
        let Some(value) = self.keys.get(uid.as_bytes())? else {
            return Ok(None);
        };
        if value.len() <= NONCE_LEN {
            return Err(KeystoreError::Malformed(uid));
        }
        let (nonce_bytes, sealed) = value.split_at(NONCE_LEN);
        let plain = self
            .cipher
            .decrypt(
                Nonce::from_slice(nonce_bytes),
                Payload {
                    msg: sealed,
                    aad: uid.as_bytes(),
                },
            )
            .map_err(|_| KeystoreError::OpenFailed(uid))?;
        let bytes: [u8; 16] = plain
            .as_slice()
            .try_into()
            .map_err(|_| KeystoreError::Malformed(uid))?;
        Ok(Some(SecretKey::from_bytes(bytes)))
    }

    /// Remove the key for `uid`. Returns whether a key was present.
    pub fn remove(&self, uid: Uid) -> Result<bool, KeystoreError> {
        let removed = self.keys.remove(uid.as_bytes())?.is_some();
        self.db.flush()?;
        Ok(removed)
    }

    pub fn contains(&self, uid: Uid) -> Result<bool, KeystoreError> {
        Ok(self.keys.contains_key(uid.as_bytes())?)
    }

    /// Every UID with a stored key. This feeds the exhaustive search path
    /// only; candidate resolution never enumerates the whole store.
    pub fn all_uids(&self) -> Result<Vec<Uid>, KeystoreError> {
        let mut out = Vec::new();
        for item in self.keys.iter() {
            let (key, _) = item?;
            let bytes: [u8; 8] = key.as_ref().try_into().map_err(|_| {
                KeystoreError::Malformed(Uid::from_bytes([0; 8]))
            })?;
            out.push(Uid::from_bytes(bytes));
        }
        Ok(out)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Truncate the store. A no-op when already empty.
    pub fn clear(&self) -> Result<(), KeystoreError> {
        self.keys.clear()?;
        self.db.flush()?;
        Ok(())
    }

    pub fn flush(&self) -> Result<(), KeystoreError> {
        self.db.flush()?;
        Ok(())
    }
}
