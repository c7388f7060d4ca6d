// SPDX-License-Identifier: MIT OR Apache-2.0
//! dbp-opstate
//!
//! Encrypted state files for operators running debug-plane fleets. Each
//! named payload is a JSON object sealed with AES-256-GCM under a key
//! derived (Argon2) from operator-supplied key material; the random salt
//! and nonce travel in the envelope. Authenticated encryption means a
//! wrong key or a tampered file fails loudly — there is no fallback
//! format.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use argon2::Argon2;
use rand::RngCore;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

const ENVELOPE_VERSION: u8 = 1;
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;

/// Errors surfaced by the state store.
#[derive(Debug, thiserror::Error)]
pub enum OpStateError {
    /// No state has been saved under the requested name.
    #[error("no state stored for '{0}'")]
    NotFound(String),

    /// The envelope is malformed or from an unknown version.
    #[error("stored state is corrupted: {0}")]
    Corrupt(String),

    /// Decryption failed; wrong key material or a tampered file.
    #[error("failed to decrypt state: wrong key material or corrupted file")]
    Decrypt,

    /// Key derivation or encryption failure.
    #[error("crypto failure: {0}")]
    Crypto(String),

    /// Filesystem failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The payload could not be encoded as JSON.
    #[error("payload encoding: {0}")]
    Encode(String),
}

/// Persists per-operator JSON state under `<base>/<name>.json.enc`.
#[derive(Debug, Clone)]
pub struct StateStore {
    base_dir: PathBuf,
}

impl StateStore {
    /// Open (creating if needed) a store rooted at `base_dir`.
    pub fn new(base_dir: impl Into<PathBuf>) -> Result<Self, OpStateError> {
        let base_dir = base_dir.into();
        std::fs::create_dir_all(&base_dir)?;
        Ok(Self { base_dir })
    }

    /// The store's base directory.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn state_path(&self, name: &str) -> PathBuf {
        self.base_dir.join(format!("{name}.json.enc"))
    }

    /// Encrypt and persist `payload` under `name`. Returns the file path.
    pub fn save(
        &self,
        name: &str,
        payload: &Map<String, Value>,
        key_material: &str,
    ) -> Result<PathBuf, OpStateError> {
        let plaintext = serde_json::to_vec(payload).map_err(|e| OpStateError::Encode(e.to_string()))?;

        let mut salt = [0u8; SALT_LEN];
        rand::rngs::OsRng.fill_bytes(&mut salt);
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);

        let cipher = cipher_for(key_material, &salt)?;
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_ref())
            .map_err(|_| OpStateError::Crypto("encryption failed".to_string()))?;

        let mut envelope = Vec::with_capacity(1 + SALT_LEN + NONCE_LEN + ciphertext.len());
        envelope.push(ENVELOPE_VERSION);
        envelope.extend_from_slice(&salt);
        envelope.extend_from_slice(&nonce_bytes);
        envelope.extend_from_slice(&ciphertext);

        let path = self.state_path(name);
        std::fs::write(&path, envelope)?;
        Ok(path)
    }

    /// Load and decrypt the payload stored under `name`.
    pub fn load(&self, name: &str, key_material: &str) -> Result<Map<String, Value>, OpStateError> {
        let path = self.state_path(name);
        if !path.exists() {
            return Err(OpStateError::NotFound(name.to_string()));
        }
        let envelope = std::fs::read(&path)?;
        if envelope.len() < 1 + SALT_LEN + NONCE_LEN {
            return Err(OpStateError::Corrupt("envelope too short".to_string()));
        }
        if envelope[0] != ENVELOPE_VERSION {
            return Err(OpStateError::Corrupt(format!(
                "unknown envelope version {}",
                envelope[0]
            )));
        }
        let salt = &envelope[1..1 + SALT_LEN];
        let nonce = &envelope[1 + SALT_LEN..1 + SALT_LEN + NONCE_LEN];
        let ciphertext = &envelope[1 + SALT_LEN + NONCE_LEN..];

        let cipher = cipher_for(key_material, salt)?;
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| OpStateError::Decrypt)?;

        let value: Value = serde_json::from_slice(&plaintext)
            .map_err(|e| OpStateError::Corrupt(e.to_string()))?;
        match value {
            Value::Object(map) => Ok(map),
            _ => Err(OpStateError::Corrupt(
                "stored state is not a JSON object".to_string(),
            )),
        }
    }

    /// Remove the state stored under `name`, if present.
    pub fn delete(&self, name: &str) -> Result<(), OpStateError> {
        let path = self.state_path(name);
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }
}

fn cipher_for(key_material: &str, salt: &[u8]) -> Result<Aes256Gcm, OpStateError> {
    let mut key = [0u8; 32];
    Argon2::default()
        .hash_password_into(key_material.as_bytes(), salt, &mut key)
        .map_err(|e| OpStateError::Crypto(e.to_string()))?;
    Ok(Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload() -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("version".to_string(), json!(1));
        map.insert(
            "servers".to_string(),
            json!({"stack-a": {"provider": "aws", "sessions": {}}}),
        );
        map
    }

    #[test]
    fn save_then_load_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let store = StateStore::new(tmp.path()).unwrap();
        let saved_to = store.save("inventory", &payload(), "hunter2").unwrap();
        assert!(saved_to.ends_with("inventory.json.enc"));
        assert!(saved_to.exists());

        let loaded = store.load("inventory", "hunter2").unwrap();
        assert_eq!(loaded, payload());
    }

    #[test]
    fn ciphertext_is_not_plaintext() {
        let tmp = tempfile::tempdir().unwrap();
        let store = StateStore::new(tmp.path()).unwrap();
        let path = store.save("inventory", &payload(), "hunter2").unwrap();
        let raw = std::fs::read(path).unwrap();
        let haystack = String::from_utf8_lossy(&raw);
        assert!(!haystack.contains("stack-a"));
        assert!(!haystack.contains("aws"));
    }

    #[test]
    fn wrong_key_fails_to_decrypt() {
        let tmp = tempfile::tempdir().unwrap();
        let store = StateStore::new(tmp.path()).unwrap();
        store.save("inventory", &payload(), "hunter2").unwrap();
        let err = store.load("inventory", "hunter3").unwrap_err();
        assert!(matches!(err, OpStateError::Decrypt));
    }

    #[test]
    fn tampered_envelope_fails_to_decrypt() {
        let tmp = tempfile::tempdir().unwrap();
        let store = StateStore::new(tmp.path()).unwrap();
        let path = store.save("inventory", &payload(), "hunter2").unwrap();

        let mut raw = std::fs::read(&path).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0xff;
        std::fs::write(&path, raw).unwrap();

        let err = store.load("inventory", "hunter2").unwrap_err();
        assert!(matches!(err, OpStateError::Decrypt));
    }

    #[test]
    fn missing_state_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let store = StateStore::new(tmp.path()).unwrap();
        let err = store.load("nope", "hunter2").unwrap_err();
        assert!(matches!(err, OpStateError::NotFound(_)));
    }

    #[test]
    fn truncated_envelope_is_corrupt() {
        let tmp = tempfile::tempdir().unwrap();
        let store = StateStore::new(tmp.path()).unwrap();
        std::fs::write(tmp.path().join("short.json.enc"), [1u8, 2, 3]).unwrap();
        let err = store.load("short", "hunter2").unwrap_err();
        assert!(matches!(err, OpStateError::Corrupt(_)));
    }

    #[test]
    fn delete_removes_state() {
        let tmp = tempfile::tempdir().unwrap();
        let store = StateStore::new(tmp.path()).unwrap();
        store.save("inventory", &payload(), "hunter2").unwrap();
        store.delete("inventory").unwrap();
        assert!(matches!(
            store.load("inventory", "hunter2").unwrap_err(),
            OpStateError::NotFound(_)
        ));
        // Deleting twice is fine.
        store.delete("inventory").unwrap();
    }
}
