// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! Symmetric cipher and digest capabilities consumed by the content layer.

use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, KeyInit},
};
use rand::RngCore;
use sha2::{Digest, Sha256};

pub const NONCE_LEN: usize = 12;

/// 256-bit symmetric key used for chunk encryption.
#[derive(Clone, PartialEq, Eq)]
pub struct ContentKey([u8; 32]);

impl ContentKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Derive a key by hashing arbitrary secret material.
    pub fn derive(secret: &[u8]) -> Self {
        Self(Sha256::digest(secret).into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for ContentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ContentKey(..)")
    }
}

pub trait CryptoSuite: Send + Sync {
    fn digest(&self, bytes: &[u8]) -> [u8; 32];
    fn encrypt(
        &self,
        key: &ContentKey,
        nonce: &[u8; NONCE_LEN],
        plaintext: &[u8],
    ) -> anyhow::Result<Vec<u8>>;
    fn decrypt(
        &self,
        key: &ContentKey,
        nonce: &[u8; NONCE_LEN],
        ciphertext: &[u8],
    ) -> anyhow::Result<Vec<u8>>;
}

/// AES-256-GCM with SHA-256 digests.
#[derive(Debug, Default, Clone, Copy)]
pub struct Aes256GcmSuite;

impl CryptoSuite for Aes256GcmSuite {
    fn digest(&self, bytes: &[u8]) -> [u8; 32] {
        Sha256::digest(bytes).into()
    }

    fn encrypt(
        &self,
        key: &ContentKey,
        nonce: &[u8; NONCE_LEN],
        plaintext: &[u8],
    ) -> anyhow::Result<Vec<u8>> {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
        cipher
            .encrypt(Nonce::from_slice(nonce), plaintext)
            .map_err(|_| anyhow::anyhow!("chunk encryption failed"))
    }

    fn decrypt(
        &self,
        key: &ContentKey,
        nonce: &[u8; NONCE_LEN],
        ciphertext: &[u8],
    ) -> anyhow::Result<Vec<u8>> {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
        cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| anyhow::anyhow!("chunk decryption failed: wrong key or corrupted data"))
    }
}

/// Fresh random nonce from the OS CSPRNG.
pub fn generate_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    nonce
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let suite = Aes256GcmSuite;
        let key = ContentKey::derive(b"secret");
        let nonce = generate_nonce();
        let ciphertext = suite.encrypt(&key, &nonce, b"payload").expect("encrypt");
        assert_ne!(ciphertext, b"payload");
        let plaintext = suite.decrypt(&key, &nonce, &ciphertext).expect("decrypt");
        assert_eq!(plaintext, b"payload");
    }

    #[test]
    fn decrypt_with_wrong_nonce_fails() {
        let suite = Aes256GcmSuite;
        let key = ContentKey::derive(b"secret");
        let nonce = generate_nonce();
        let ciphertext = suite.encrypt(&key, &nonce, b"payload").expect("encrypt");
        assert!(suite.decrypt(&key, &[0u8; NONCE_LEN], &ciphertext).is_err());
    }

    #[test]
    fn digest_is_sha256() {
        let digest = Aes256GcmSuite.digest(b"abc");
        assert_eq!(
            hex::encode(digest),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
