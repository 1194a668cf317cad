/*
    transform.rs - Opaque payload transforms for persisted values

    A transform turns a value into a string payload and back. The record
    flags which transform produced it, so hydration can refuse a payload it
    cannot decode instead of surfacing garbage.

    EncryptionTransform: AES-256-GCM, random 96-bit nonce per payload,
    nonce prepended to the ciphertext, whole thing base64-encoded. Keys come
    from a passphrase via Argon2 with a namespace-derived salt, so the same
    passphrase opens the same namespace across restarts.
*/

use aes_gcm::aead::OsRng;
use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use argon2::Argon2;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde_json::Value;

use crate::store::errors::{StoreError, StoreResult};

const NONCE_LEN: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformKind {
    /// Sets `_b64` on the record
    Base64,
    /// Sets `_enc` on the record
    Encrypted,
}

pub trait ValueTransform: Send + Sync {
    fn kind(&self) -> TransformKind;

    fn encode(&self, value: &Value) -> StoreResult<String>;

    fn decode(&self, payload: &str) -> StoreResult<Value>;
}

/// Base64 over the JSON text; obfuscation only
#[derive(Debug, Default, Clone, Copy)]
pub struct Base64Transform;

impl ValueTransform for Base64Transform {
    fn kind(&self) -> TransformKind {
        TransformKind::Base64
    }

    fn encode(&self, value: &Value) -> StoreResult<String> {
        Ok(STANDARD.encode(serde_json::to_vec(value)?))
    }

    fn decode(&self, payload: &str) -> StoreResult<Value> {
        let bytes = STANDARD.decode(payload).map_err(|e| StoreError::Decryption(e.to_string()))?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

pub struct EncryptionTransform {
    cipher: Aes256Gcm,
}

impl EncryptionTransform {
    /// Random key; payloads are unreadable after the process exits
    pub fn new() -> Self {
        let key = Aes256Gcm::generate_key(&mut OsRng);
        EncryptionTransform { cipher: Aes256Gcm::new(&key) }
    }

    pub fn from_key(key: &[u8; 32]) -> Self {
        EncryptionTransform { cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)) }
    }

    /// Derive the key from `passphrase` with Argon2id, salted by `namespace`
    pub fn from_passphrase(passphrase: &str, namespace: &str) -> StoreResult<Self> {
        let salt = format!("statehive:{}", namespace);
        let mut key = [0u8; 32];
        Argon2::default()
            .hash_password_into(passphrase.as_bytes(), salt.as_bytes(), &mut key)
            .map_err(|e| StoreError::Encryption(e.to_string()))?;
        Ok(Self::from_key(&key))
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> StoreResult<Vec<u8>> {
        use aes_gcm::aead::rand_core::RngCore;
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| StoreError::Encryption(e.to_string()))?;

        let mut result = nonce_bytes.to_vec();
        result.extend_from_slice(&ciphertext);
        Ok(result)
    }

    pub fn decrypt(&self, data: &[u8]) -> StoreResult<Vec<u8>> {
        if data.len() < NONCE_LEN {
            return Err(StoreError::Decryption("Invalid ciphertext length".to_string()));
        }
        let (nonce, ciphertext) = data.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|e| StoreError::Decryption(e.to_string()))
    }
}

impl Default for EncryptionTransform {
    fn default() -> Self {
        Self::new()
    }
}

impl ValueTransform for EncryptionTransform {
    fn kind(&self) -> TransformKind {
        TransformKind::Encrypted
    }

    fn encode(&self, value: &Value) -> StoreResult<String> {
        let plaintext = serde_json::to_vec(value)?;
        Ok(STANDARD.encode(self.encrypt(&plaintext)?))
    }

    fn decode(&self, payload: &str) -> StoreResult<Value> {
        let data = STANDARD.decode(payload).map_err(|e| StoreError::Decryption(e.to_string()))?;
        Ok(serde_json::from_slice(&self.decrypt(&data)?)?)
    }
}
