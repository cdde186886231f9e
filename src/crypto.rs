// ABOUTME: Cryptographic primitives for token generation, sealing, and secret hashing
// ABOUTME: Wraps ring randomness, AES-256-GCM, bcrypt, and constant-time comparison
//
// Licensed under either of Apache License, Version 2.0 or MIT License at your option.
// Copyright ©2025 Async-IO.org

//! Crypto utilities shared by the stores and the authorization engine.

use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::{aead::Aead, Aes256Gcm, KeyInit};
use base64::{engine::general_purpose, Engine as _};
use rand::RngCore;
use ring::rand::{SecureRandom, SystemRandom};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;
use zeroize::Zeroizing;

/// Length of the AES-GCM nonce prepended to every ciphertext.
const NONCE_LEN: usize = 12;

/// Failures from the crypto layer.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// The system RNG failed; the server cannot operate securely without it.
    #[error("system RNG failure")]
    Rng,
    /// Sealing a value failed.
    #[error("encryption failed")]
    Seal,
    /// Opening a sealed value failed (wrong key, truncation, or tampering).
    #[error("decryption failed: {0}")]
    Open(String),
    /// bcrypt hashing failed.
    #[error("secret hashing failed: {0}")]
    Hash(String),
}

/// Generate `len` random bytes and encode them base64url without padding.
///
/// # Errors
/// Returns an error if the system RNG fails; the caller must treat this as
/// fatal for the request since no secure token can be minted.
pub fn generate_token(len: usize) -> Result<String, CryptoError> {
    let rng = SystemRandom::new();
    let mut bytes = vec![0u8; len];
    rng.fill(&mut bytes).map_err(|e| {
        tracing::error!(error = ?e, "SystemRandom failed, cannot generate secure token");
        CryptoError::Rng
    })?;
    Ok(general_purpose::URL_SAFE_NO_PAD.encode(&bytes))
}

/// Compute the S256 PKCE challenge for a verifier:
/// `BASE64URL-UNPADDED(SHA256(verifier))`.
#[must_use]
pub fn s256_challenge(verifier: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(verifier.as_bytes());
    general_purpose::URL_SAFE_NO_PAD.encode(hasher.finalize())
}

/// Constant-time equality over two strings.
#[must_use]
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// SHA-256 hash of a user identifier truncated to 16 hex characters, the only
/// form in which user identifiers may appear in logs and audit records.
#[must_use]
pub fn audit_hash(identifier: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(identifier.as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..8])
}

/// Hash a client secret with bcrypt at the default cost.
///
/// Runs on the blocking pool so the CPU-bound hash does not stall the
/// async executor.
///
/// # Errors
/// Returns an error if bcrypt fails or the blocking task is cancelled.
pub async fn hash_secret(secret: &str) -> Result<String, CryptoError> {
    let secret = secret.to_owned();
    tokio::task::spawn_blocking(move || bcrypt::hash(&secret, bcrypt::DEFAULT_COST))
        .await
        .map_err(|e| CryptoError::Hash(e.to_string()))?
        .map_err(|e| CryptoError::Hash(e.to_string()))
}

/// Verify a client secret against its bcrypt hash.
///
/// Returns `false` on any failure; callers surface `invalid_client` without
/// distinguishing the cause.
pub async fn verify_secret(secret: &str, hash: &str) -> bool {
    let secret = secret.to_owned();
    let hash = hash.to_owned();
    tokio::task::spawn_blocking(move || bcrypt::verify(&secret, &hash).unwrap_or(false))
        .await
        .unwrap_or(false)
}

/// AES-256-GCM cipher for sealing upstream token material at rest.
///
/// When constructed without a key the cipher is a pass-through, matching the
/// plaintext-storage configuration.
#[derive(Clone)]
pub struct TokenCipher {
    key: Option<Zeroizing<[u8; 32]>>,
}

impl std::fmt::Debug for TokenCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCipher")
            .field("enabled", &self.key.is_some())
            .finish()
    }
}

impl TokenCipher {
    /// Create a cipher from an optional 32-byte key.
    #[must_use]
    pub fn new(key: Option<[u8; 32]>) -> Self {
        Self {
            key: key.map(Zeroizing::new),
        }
    }

    /// Pass-through cipher (no key configured).
    #[must_use]
    pub fn disabled() -> Self {
        Self { key: None }
    }

    /// Whether sealing is active.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.key.is_some()
    }

    /// Seal a value: `base64(nonce || ciphertext || tag)` with a fresh
    /// 12-byte nonce from the OS CSPRNG. Pass-through when no key is set.
    ///
    /// # Errors
    /// Returns an error if encryption fails.
    pub fn seal(&self, plaintext: &str) -> Result<String, CryptoError> {
        let Some(key) = &self.key else {
            return Ok(plaintext.to_owned());
        };

        let cipher = Aes256Gcm::new(GenericArray::from_slice(key.as_ref()));
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = GenericArray::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| CryptoError::Seal)?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);
        Ok(general_purpose::STANDARD.encode(sealed))
    }

    /// Open a sealed value, verifying the GCM tag. Pass-through when no key
    /// is set.
    ///
    /// # Errors
    /// Returns an error if the payload is malformed, truncated, or fails
    /// authentication.
    pub fn open(&self, sealed: &str) -> Result<String, CryptoError> {
        let Some(key) = &self.key else {
            return Ok(sealed.to_owned());
        };

        let raw = general_purpose::STANDARD
            .decode(sealed)
            .map_err(|e| CryptoError::Open(format!("invalid base64: {e}")))?;
        if raw.len() < NONCE_LEN {
            return Err(CryptoError::Open("payload too short".to_owned()));
        }

        let cipher = Aes256Gcm::new(GenericArray::from_slice(key.as_ref()));
        let nonce = GenericArray::from_slice(&raw[..NONCE_LEN]);
        let plaintext = cipher
            .decrypt(nonce, &raw[NONCE_LEN..])
            .map_err(|_| CryptoError::Open("authentication failed".to_owned()))?;

        String::from_utf8(plaintext).map_err(|e| CryptoError::Open(e.to_string()))
    }
}
