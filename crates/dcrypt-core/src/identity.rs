// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! Local node identity: an ed25519 key persisted in the identity partition
//! and the peer address derived from it.

use anyhow::Context;
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::{Rng, distributions::Alphanumeric};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{
    crypto::ContentKey,
    error::NodeError,
    peer::{PeerAddr, SUPERNODE_PREFIX},
    store::{EncryptedSecret, Partition, Store, decrypt_secret, encrypt_secret},
};

const IDENTITY_KEY: &str = "node-key";
const ADDRESS_SUFFIX_LEN: usize = 5;

#[derive(Debug, Clone, Serialize, Deserialize)]
enum PersistedIdentity {
    Plain { secret: [u8; 32] },
    Encrypted(EncryptedSecret),
}

#[derive(Clone)]
pub struct Identity {
    signing_key: SigningKey,
    address: PeerAddr,
}

impl Identity {
    pub fn generate(supernode: bool) -> Self {
        let mut rng = rand::rngs::OsRng;
        Self::from_signing_key(SigningKey::generate(&mut rng), supernode)
    }

    pub fn from_secret(secret: [u8; 32], supernode: bool) -> Self {
        Self::from_signing_key(SigningKey::from_bytes(&secret), supernode)
    }

    fn from_signing_key(signing_key: SigningKey, supernode: bool) -> Self {
        let identity_key = identity_key_for(&signing_key.verifying_key());
        let suffix = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(ADDRESS_SUFFIX_LEN)
            .map(char::from)
            .collect::<String>();
        let prefix = if supernode { SUPERNODE_PREFIX } else { "" };
        Self {
            signing_key,
            address: PeerAddr::new(format!("{prefix}{identity_key}-{suffix}")),
        }
    }

    /// Load the persisted key, or generate and persist a fresh one.
    ///
    /// With a passphrase the secret is stored encrypted; a plain secret found
    /// on disk is re-written encrypted.
    pub async fn load_or_create(
        store: &dyn Store,
        supernode: bool,
        passphrase: Option<&str>,
    ) -> anyhow::Result<Self> {
        let existing = store
            .get(Partition::Identity, IDENTITY_KEY)
            .await
            .context("read identity")?;

        let Some(bytes) = existing else {
            let identity = Self::generate(supernode);
            identity.persist(store, passphrase).await?;
            return Ok(identity);
        };

        let persisted: PersistedIdentity = crate::cbor::from_slice(&bytes)
            .map_err(|err| NodeError::Storage(format!("corrupt identity record: {err}")))?;
        match persisted {
            PersistedIdentity::Plain { secret } => {
                let identity = Self::from_secret(secret, supernode);
                if passphrase.is_some() {
                    identity.persist(store, passphrase).await?;
                }
                Ok(identity)
            }
            PersistedIdentity::Encrypted(encrypted) => {
                let passphrase = passphrase.ok_or_else(|| {
                    NodeError::unavailable("identity is encrypted and no passphrase was given")
                })?;
                let secret = decrypt_secret(&encrypted, passphrase)?;
                let secret: [u8; 32] = secret
                    .try_into()
                    .map_err(|_| NodeError::Storage("identity secret must be 32 bytes".into()))?;
                Ok(Self::from_secret(secret, supernode))
            }
        }
    }

    async fn persist(&self, store: &dyn Store, passphrase: Option<&str>) -> anyhow::Result<()> {
        let secret = self.signing_key.to_bytes();
        let persisted = match passphrase {
            Some(passphrase) => PersistedIdentity::Encrypted(encrypt_secret(&secret, passphrase)?),
            None => PersistedIdentity::Plain { secret },
        };
        store
            .put(Partition::Identity, IDENTITY_KEY, crate::cbor::to_vec(&persisted)?)
            .await
    }

    pub fn address(&self) -> &PeerAddr {
        &self.address
    }

    pub fn is_supernode(&self) -> bool {
        self.address.is_supernode()
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn secret_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    /// Symmetric key for chunk encryption. A shared `content_secret` lets a
    /// swarm decrypt each other's content; otherwise the key is private to
    /// this identity.
    pub fn content_key(&self, content_secret: Option<&str>) -> ContentKey {
        match content_secret {
            Some(secret) => ContentKey::derive(secret.as_bytes()),
            None => ContentKey::derive(&self.signing_key.to_bytes()),
        }
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

/// First 16 hex characters of SHA-256 over the public key.
pub fn identity_key_for(verifying_key: &VerifyingKey) -> String {
    let digest = Sha256::digest(verifying_key.as_bytes());
    hex::encode(&digest[..8])
}
