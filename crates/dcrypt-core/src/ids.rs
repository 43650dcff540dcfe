// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use std::fmt;

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::NodeError;

/// Identifier of a published object: URL-safe base64 of a 32-byte digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentHash(String);

/// Identifier of one encrypted chunk, same encoding as [`ContentHash`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ChunkHash(String);

/// 160-bit Kademlia routing identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RoutingId(pub [u8; 20]);

pub fn encode_digest(digest: &[u8; 32]) -> String {
    URL_SAFE_NO_PAD.encode(digest)
}

fn validate_digest_string(kind: &str, value: &str) -> Result<(), NodeError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(NodeError::invalid(format!("empty {kind} hash")));
    }
    let bytes = URL_SAFE_NO_PAD
        .decode(trimmed)
        .map_err(|_| NodeError::invalid(format!("{kind} hash is not url-safe base64: {value}")))?;
    if bytes.len() != 32 {
        return Err(NodeError::invalid(format!(
            "{kind} hash must encode 32 bytes, got {}",
            bytes.len()
        )));
    }
    Ok(())
}

macro_rules! digest_id {
    ($name:ident, $kind:literal) => {
        impl $name {
            pub fn from_digest(digest: &[u8; 32]) -> Self {
                Self(encode_digest(digest))
            }

            pub fn parse(value: &str) -> Result<Self, NodeError> {
                validate_digest_string($kind, value)?;
                Ok(Self(value.trim().to_string()))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn routing_id(&self) -> RoutingId {
                RoutingId::for_key(&self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl TryFrom<String> for $name {
            type Error = NodeError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::parse(&value)
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.0
            }
        }
    };
}

digest_id!(ContentHash, "content");
digest_id!(ChunkHash, "chunk");

impl RoutingId {
    /// Routing identifier of an arbitrary DHT key or peer address.
    pub fn for_key(key: &str) -> Self {
        let digest = Sha256::digest(key.as_bytes());
        let mut id = [0u8; 20];
        id.copy_from_slice(&digest[..20]);
        Self(id)
    }

    pub fn random() -> Self {
        use rand::RngCore;
        let mut id = [0u8; 20];
        rand::rngs::OsRng.fill_bytes(&mut id);
        Self(id)
    }

    pub fn xor_distance(&self, other: &Self) -> [u8; 20] {
        let mut out = [0u8; 20];
        for (idx, byte) in out.iter_mut().enumerate() {
            *byte = self.0[idx] ^ other.0[idx];
        }
        out
    }

    pub fn distance_cmp(&self, target: &Self, other: &Self) -> std::cmp::Ordering {
        let a = self.xor_distance(target);
        let b = other.xor_distance(target);
        a.cmp(&b)
    }
}
