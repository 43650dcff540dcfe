// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use std::collections::HashSet;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::{
    crypto::{ContentKey, CryptoSuite, NONCE_LEN, generate_nonce},
    error::NodeError,
    ids::{ChunkHash, ContentHash},
    peer::PeerAddr,
};

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ContentMetadata {
    pub content_type: String,
    pub tags: Vec<String>,
    pub premium: bool,
    pub price: Option<f64>,
    pub creator: String,
    pub file_type: String,
}

impl ContentMetadata {
    /// Trim and deduplicate tags, drop empty ones, and fill in the default
    /// price for premium objects that carry none.
    pub fn normalized(mut self, default_price: f64) -> anyhow::Result<Self> {
        let mut seen = HashSet::new();
        self.tags = self
            .tags
            .into_iter()
            .map(|tag| tag.trim().to_string())
            .filter(|tag| !tag.is_empty() && seen.insert(tag.clone()))
            .collect();

        if let Some(price) = self.price
            && (!price.is_finite() || price < 0.0)
        {
            return Err(NodeError::invalid(format!("invalid price: {price}")).into());
        }
        if self.premium && self.price.is_none() {
            self.price = Some(default_price);
        }
        Ok(self)
    }

    /// Price a buyer pays; zero for free objects.
    pub fn effective_price(&self) -> f64 {
        if self.premium {
            self.price.unwrap_or(0.0)
        } else {
            0.0
        }
    }
}

/// One encrypted fragment of a published object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chunk {
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
    pub nonce: [u8; NONCE_LEN],
    pub index: u32,
    pub file_type: String,
}

impl Chunk {
    pub fn hash(&self, suite: &dyn CryptoSuite) -> ChunkHash {
        chunk_hash(suite, &self.data, &self.nonce, self.index)
    }
}

/// Everything a retriever needs to locate and reassemble an object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentRecord {
    pub content_hash: ContentHash,
    pub metadata: ContentMetadata,
    pub chunk_hashes: Vec<ChunkHash>,
    pub publisher: PeerAddr,
}

/// Digest over `ciphertext ‖ nonce ‖ index` (index little-endian).
pub fn chunk_hash(
    suite: &dyn CryptoSuite,
    data: &[u8],
    nonce: &[u8; NONCE_LEN],
    index: u32,
) -> ChunkHash {
    let mut material = Vec::with_capacity(data.len() + NONCE_LEN + 4);
    material.extend_from_slice(data);
    material.extend_from_slice(nonce);
    material.extend_from_slice(&index.to_le_bytes());
    ChunkHash::from_digest(&suite.digest(&material))
}

/// Content address of `plaintext` under `metadata`: digest of the canonical
/// CBOR encoding of both.
pub fn content_hash(
    suite: &dyn CryptoSuite,
    metadata: &ContentMetadata,
    plaintext: &[u8],
) -> anyhow::Result<ContentHash> {
    let canonical = crate::cbor::to_vec(&(metadata, serde_bytes::Bytes::new(plaintext)))
        .context("encode content for hashing")?;
    Ok(ContentHash::from_digest(&suite.digest(&canonical)))
}

const SMALL_CONTENT: usize = 1024 * 1024;
const LARGE_CONTENT: usize = 10 * 1024 * 1024;

/// Largest plaintext slice a chunk may carry. Keeps every `store-chunk` and
/// `chunk-response` frame well below `MAX_MESSAGE_BYTES`.
pub const MAX_CHUNK_BYTES: usize = 1024 * 1024;

/// Target plaintext slice for content of `len` bytes.
fn chunk_size_for(len: usize) -> usize {
    if len < SMALL_CONTENT {
        64 * 1024
    } else if len < LARGE_CONTENT {
        256 * 1024
    } else {
        MAX_CHUNK_BYTES
    }
}

/// At least one chunk per active supernode, and enough chunks that none
/// exceeds the size tier for `len`.
pub fn chunk_count(len: usize, active_supernodes: usize) -> usize {
    len.div_ceil(chunk_size_for(len))
        .max(active_supernodes)
        .max(1)
}

/// Split `plaintext` into exactly `count` pieces of `ceil(len / count)`
/// bytes (trailing pieces may be short or empty) and encrypt each under a
/// fresh nonce.
pub fn chunkify(
    suite: &dyn CryptoSuite,
    key: &ContentKey,
    plaintext: &[u8],
    count: usize,
    file_type: &str,
) -> anyhow::Result<Vec<(ChunkHash, Chunk)>> {
    if count == 0 {
        return Err(NodeError::invalid("chunk count must be at least 1").into());
    }
    let piece = plaintext.len().div_ceil(count);
    let mut out = Vec::with_capacity(count);
    for index in 0..count {
        let start = (index * piece).min(plaintext.len());
        let end = (start + piece).min(plaintext.len());
        let nonce = generate_nonce();
        let data = suite.encrypt(key, &nonce, &plaintext[start..end])?;
        let chunk = Chunk {
            data,
            nonce,
            index: u32::try_from(index).context("chunk index overflows u32")?,
            file_type: file_type.to_string(),
        };
        out.push((chunk.hash(suite), chunk));
    }
    Ok(out)
}

/// Order chunks by their embedded index, decrypt each with its own nonce and
/// concatenate. Returns the plaintext and the file type of the first chunk.
pub fn reassemble(
    suite: &dyn CryptoSuite,
    key: &ContentKey,
    mut chunks: Vec<Chunk>,
) -> anyhow::Result<(Vec<u8>, String)> {
    if chunks.is_empty() {
        return Err(NodeError::invalid("no chunks to reassemble").into());
    }
    chunks.sort_by_key(|chunk| chunk.index);
    for (expected, chunk) in chunks.iter().enumerate() {
        if chunk.index as usize != expected {
            return Err(NodeError::Mismatch {
                expected: format!("chunk index {expected}"),
                actual: format!("chunk index {}", chunk.index),
            }
            .into());
        }
    }

    let file_type = chunks[0].file_type.clone();
    let mut plaintext = Vec::new();
    for chunk in &chunks {
        let piece = suite
            .decrypt(key, &chunk.nonce, &chunk.data)
            .with_context(|| format!("chunk {} failed to decrypt", chunk.index))?;
        plaintext.extend_from_slice(&piece);
    }
    Ok((plaintext, file_type))
}

/// Reject a chunk whose recomputed hash differs from the one requested.
pub fn verify_chunk(
    suite: &dyn CryptoSuite,
    expected: &ChunkHash,
    chunk: &Chunk,
) -> Result<(), NodeError> {
    let actual = chunk.hash(suite);
    if &actual != expected {
        return Err(NodeError::Mismatch {
            expected: expected.to_string(),
            actual: actual.to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Aes256GcmSuite;

    fn key() -> ContentKey {
        ContentKey::derive(b"test-key")
    }

    #[test]
    fn reassembly_ignores_fetch_order() {
        let suite = Aes256GcmSuite;
        let plaintext = b"the quick brown fox jumps over the lazy dog".to_vec();
        let mut chunks = chunkify(&suite, &key(), &plaintext, 5, "text/plain")
            .expect("chunkify")
            .into_iter()
            .map(|(_, chunk)| chunk)
            .collect::<Vec<_>>();
        chunks.reverse();
        chunks.swap(1, 3);

        let (out, file_type) = reassemble(&suite, &key(), chunks).expect("reassemble");
        assert_eq!(out, plaintext);
        assert_eq!(file_type, "text/plain");
    }

    #[test]
    fn chunk_count_tracks_supernodes() {
        let suite = Aes256GcmSuite;
        assert_eq!(chunk_count(11, 0), 1);
        let single = chunkify(&suite, &key(), b"hello world", chunk_count(11, 0), "txt")
            .expect("chunkify");
        assert_eq!(single.len(), 1);

        let spread = chunkify(&suite, &key(), b"hello world", chunk_count(11, 4), "txt")
            .expect("chunkify");
        assert_eq!(spread.len(), 4);
        let mut joined = Vec::new();
        for (hash, chunk) in &spread {
            verify_chunk(&suite, hash, chunk).expect("hash matches");
            joined.extend(
                suite
                    .decrypt(&key(), &chunk.nonce, &chunk.data)
                    .expect("each chunk decrypts alone"),
            );
        }
        assert_eq!(joined, b"hello world");
    }

    #[test]
    fn chunk_count_bounds_chunk_size() {
        assert_eq!(chunk_count(0, 0), 1);
        assert_eq!(chunk_count(64 * 1024, 0), 1);
        assert_eq!(chunk_count(64 * 1024 + 1, 0), 2);
        assert_eq!(chunk_count(5 * 1024 * 1024, 1), 20);
        assert_eq!(chunk_count(5 * 1024 * 1024, 32), 32);
        assert_eq!(chunk_count(64 * 1024 * 1024, 0), 64);
        for len in [1usize, 900_000, 3 * 1024 * 1024, 40 * 1024 * 1024 + 7] {
            assert!(len.div_ceil(chunk_count(len, 0)) <= MAX_CHUNK_BYTES);
        }
    }

    #[test]
    fn more_chunks_than_bytes_yields_empty_tail() {
        let suite = Aes256GcmSuite;
        let chunks = chunkify(&suite, &key(), b"ab", 4, "bin").expect("chunkify");
        assert_eq!(chunks.len(), 4);
        let (out, _) = reassemble(
            &suite,
            &key(),
            chunks.into_iter().map(|(_, c)| c).collect(),
        )
        .expect("reassemble");
        assert_eq!(out, b"ab");
    }

    #[test]
    fn chunk_hash_depends_on_index() {
        let suite = Aes256GcmSuite;
        let nonce = [4u8; NONCE_LEN];
        assert_ne!(
            chunk_hash(&suite, b"cipher", &nonce, 0),
            chunk_hash(&suite, b"cipher", &nonce, 1)
        );
        assert_eq!(
            chunk_hash(&suite, b"cipher", &nonce, 2),
            chunk_hash(&suite, b"cipher", &nonce, 2)
        );
    }

    #[test]
    fn content_hash_is_pure() {
        let suite = Aes256GcmSuite;
        let meta = ContentMetadata {
            content_type: "note".into(),
            tags: vec!["a".into()],
            ..Default::default()
        };
        let a = content_hash(&suite, &meta, b"hello").expect("hash");
        let b = content_hash(&suite, &meta.clone(), b"hello").expect("hash");
        assert_eq!(a, b);
        let c = content_hash(&suite, &meta, b"hello!").expect("hash");
        assert_ne!(a, c);
    }

    #[test]
    fn metadata_normalization() {
        let meta = ContentMetadata {
            tags: vec![" rust ".into(), "".into(), "rust".into(), "p2p".into()],
            premium: true,
            ..Default::default()
        }
        .normalized(30.0)
        .expect("valid");
        assert_eq!(meta.tags, vec!["rust".to_string(), "p2p".to_string()]);
        assert_eq!(meta.price, Some(30.0));
        assert_eq!(meta.effective_price(), 30.0);

        let err = ContentMetadata {
            price: Some(-1.0),
            ..Default::default()
        }
        .normalized(30.0)
        .expect_err("negative price");
        assert_eq!(
            crate::error::error_kind(&err),
            Some(crate::error::ErrorKind::InputValidation)
        );
    }

    #[test]
    fn tampered_chunk_is_a_mismatch() {
        let suite = Aes256GcmSuite;
        let (hash, mut chunk) = chunkify(&suite, &key(), b"data", 1, "bin")
            .expect("chunkify")
            .remove(0);
        chunk.index = 7;
        let err = verify_chunk(&suite, &hash, &chunk).expect_err("mismatch");
        assert_eq!(err.kind(), crate::error::ErrorKind::Mismatch);
    }
}
