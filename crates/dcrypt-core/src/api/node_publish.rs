// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! Publishing and retrieval on `NodeHandle`: chunk, encrypt and replicate
//! content; locate, fetch and reassemble it again.

use anyhow::Context as _;
use rand::seq::SliceRandom;
use tracing::{debug, info, warn};

use crate::{
    content::{
        Chunk, ContentMetadata, ContentRecord, chunk_count, chunkify, content_hash, reassemble,
        verify_chunk,
    },
    dht_keys::{chunk_location_key, content_record_key},
    error::{ErrorKind, NodeError, error_kind},
    ids::{ChunkHash, ContentHash},
    offline::OfflineOperation,
    peer::PeerAddr,
    wire::Message,
};

use super::{
    NodeHandle,
    helpers::{cache_chunk, decode_holders, encode_holders, load_cached_chunk, merge_peer_lists},
};

/// Reassembled plaintext of a retrieved object.
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievedContent {
    pub data: Vec<u8>,
    /// File type recorded on the first chunk.
    pub file_type: String,
    pub record: ContentRecord,
}

fn is_unreachable(err: &anyhow::Error) -> bool {
    error_kind(err) == Some(ErrorKind::Unavailable)
}

impl NodeHandle {
    /// Chunk, encrypt and replicate `plaintext`, then announce it.
    ///
    /// Steps that find no reachable peer are queued offline instead of
    /// failing the call. Local storage errors are returned as is.
    pub async fn publish(
        &self,
        metadata: ContentMetadata,
        plaintext: &[u8],
        file_type: &str,
    ) -> anyhow::Result<ContentHash> {
        let mut metadata = metadata.normalized(self.inner.config.default_premium_price)?;
        if metadata.file_type.is_empty() {
            metadata.file_type = file_type.to_string();
        }
        if metadata.creator.is_empty() {
            metadata.creator = self.local_address().identity().to_string();
        }

        let suite = self.inner.crypto.as_ref();
        let content_hash = content_hash(suite, &metadata, plaintext)?;
        let count = chunk_count(plaintext.len(), self.active_supernodes().len());
        let chunks = chunkify(suite, &self.inner.content_key, plaintext, count, file_type)?;

        let mut chunk_hashes = Vec::with_capacity(chunks.len());
        for (chunk_hash, chunk) in chunks {
            cache_chunk(self.inner.store.as_ref(), &chunk_hash, &chunk).await?;
            match self.replicate_chunk(&chunk_hash, &chunk).await {
                Ok(replicas) => debug!(chunk = %chunk_hash, replicas, "chunk replicated"),
                Err(err) if is_unreachable(&err) => {
                    debug!(chunk = %chunk_hash, "no peers reachable, chunk queued");
                    self.queue_offline_operation(OfflineOperation::PublishChunk {
                        chunk_hash: chunk_hash.clone(),
                        chunk,
                    })
                    .await?;
                }
                Err(err) => return Err(err),
            }
            chunk_hashes.push(chunk_hash);
        }

        let record = ContentRecord {
            content_hash: content_hash.clone(),
            metadata,
            chunk_hashes,
            publisher: self.local_address().clone(),
        };
        self.remember_content(&record).await?;
        let _ = self.inner.announcements.send(record.clone());

        match self.announce_content(&record).await {
            Ok(_) => {}
            Err(err) if is_unreachable(&err) => {
                debug!(content = %content_hash, "no peers reachable, announcement queued");
                self.queue_offline_operation(OfflineOperation::AnnounceContent { record })
                    .await?;
            }
            Err(err) => return Err(err),
        }
        info!(content = %content_hash, chunks = count, "content published");
        Ok(content_hash)
    }

    /// Send one copy to the supernode at `index % supernodes` and one to a
    /// random regular peer, then announce the chunk. Fails as unavailable
    /// when no copy could be delivered.
    pub(super) async fn replicate_chunk(
        &self,
        chunk_hash: &ChunkHash,
        chunk: &Chunk,
    ) -> anyhow::Result<usize> {
        let supernodes = self.active_supernodes();
        let regular = self
            .active_peers()
            .into_iter()
            .filter(|peer| !peer.is_supernode())
            .collect::<Vec<_>>();
        let random_regular = regular.choose(&mut rand::thread_rng()).cloned();

        let mut targets = Vec::with_capacity(2);
        if !supernodes.is_empty() {
            targets.push(supernodes[chunk.index as usize % supernodes.len()].clone());
        }
        targets.extend(random_regular);
        if targets.is_empty() {
            return Err(NodeError::unavailable("no peers connected").into());
        }

        let local = self.local_address().clone();
        let store = Message::StoreChunk {
            chunk_hash: chunk_hash.clone(),
            chunk_data: chunk.clone(),
            peer_address: local.clone(),
        };
        let mut holders = Vec::with_capacity(targets.len() + 1);
        for target in targets {
            match self.inner.peers.send(&target, &store).await {
                Ok(()) => holders.push(target),
                Err(err) if error_kind(&err) == Some(ErrorKind::InputValidation) => {
                    return Err(err.context(format!("chunk {chunk_hash} cannot be sent")));
                }
                Err(err) => debug!(peer = %target, error = %err, "chunk replica not delivered"),
            }
        }
        if holders.is_empty() {
            return Err(NodeError::unavailable("no replica target reachable").into());
        }
        let replicas = holders.len();
        self.state
            .write()
            .await
            .chunk_index
            .record_many(chunk_hash, holders.iter().cloned());

        self.inner
            .peers
            .broadcast(&Message::ChunkAnnounce {
                chunk_hash: chunk_hash.clone(),
                peer_address: local.clone(),
            })
            .await;

        holders.push(local);
        let location = encode_holders(&holders)?;
        if let Err(err) = self
            .store_dht(
                &chunk_location_key(chunk_hash),
                location,
                self.inner.config.default_dht_ttl_ms,
            )
            .await
        {
            debug!(chunk = %chunk_hash, error = %err, "chunk location not stored");
        }
        Ok(replicas)
    }

    /// Broadcast the record and store it in the DHT under its content hash.
    /// Fails as unavailable when no peer received the announcement.
    pub(super) async fn announce_content(&self, record: &ContentRecord) -> anyhow::Result<usize> {
        let announce = Message::ContentAnnounce {
            content_hash: record.content_hash.clone(),
            metadata: record.metadata.clone(),
            chunk_hashes: record.chunk_hashes.clone(),
            peer_address: self.local_address().clone(),
        };
        let delivered = self.inner.peers.broadcast(&announce).await;
        if delivered == 0 {
            return Err(NodeError::unavailable("no peers connected").into());
        }

        let encoded = crate::cbor::to_vec(record).context("encode content record")?;
        if let Err(err) = self
            .store_dht(
                &content_record_key(&record.content_hash),
                encoded,
                self.inner.config.default_dht_ttl_ms,
            )
            .await
        {
            debug!(content = %record.content_hash, error = %err, "content record not stored in dht");
        }
        Ok(delivered)
    }

    pub(super) async fn replay_offline(&self, op: OfflineOperation) -> anyhow::Result<()> {
        match op {
            OfflineOperation::PublishChunk { chunk_hash, chunk } => {
                self.replicate_chunk(&chunk_hash, &chunk).await?;
            }
            OfflineOperation::AnnounceContent { record } => {
                self.announce_content(&record).await?;
            }
        }
        Ok(())
    }

    /// Fetch, decrypt and reassemble the object named by `content_hash`.
    ///
    /// Chunks already in the local cache are never requested again, so a
    /// fully cached object is served without touching the network.
    pub async fn retrieve(&self, content_hash: &str) -> anyhow::Result<RetrievedContent> {
        let content_hash = ContentHash::parse(content_hash)?;
        let record = self.lookup_content(&content_hash).await?;
        if record.chunk_hashes.is_empty() {
            return Err(NodeError::invalid(format!("{content_hash} lists no chunks")).into());
        }

        let mut chunks = Vec::with_capacity(record.chunk_hashes.len());
        for chunk_hash in &record.chunk_hashes {
            chunks.push(self.fetch_chunk(chunk_hash, &record).await?);
        }

        let suite = self.inner.crypto.as_ref();
        let (data, file_type) = reassemble(suite, &self.inner.content_key, chunks)?;
        let actual = crate::content::content_hash(suite, &record.metadata, &data)?;
        if actual != content_hash {
            return Err(NodeError::Mismatch {
                expected: content_hash.to_string(),
                actual: actual.to_string(),
            }
            .into());
        }
        info!(content = %content_hash, bytes = data.len(), "content retrieved");
        Ok(RetrievedContent {
            data,
            file_type,
            record,
        })
    }

    /// Known record for `content_hash`: local first, then a metadata request
    /// to each connected supernode, then the DHT.
    pub(super) async fn lookup_content(
        &self,
        content_hash: &ContentHash,
    ) -> anyhow::Result<ContentRecord> {
        let known = self
            .state
            .read()
            .await
            .known_content
            .get(content_hash)
            .cloned();
        if let Some(record) = known {
            return Ok(record);
        }

        for supernode in self.active_supernodes() {
            let reply = self
                .request(
                    &supernode,
                    "metadata",
                    Some(content_hash.to_string()),
                    self.inner.config.request_timeout(),
                    |correlation_id| Message::MetadataRequest {
                        correlation_id,
                        content_hash: content_hash.clone(),
                    },
                )
                .await;
            match reply {
                Ok(Message::MetadataResponse {
                    record: Some(record),
                    ..
                }) if record.content_hash == *content_hash => {
                    self.remember_content(&record).await?;
                    return Ok(record);
                }
                Ok(_) => {}
                Err(err) => debug!(peer = %supernode, error = %err, "metadata request failed"),
            }
        }

        match self.find_dht(&content_record_key(content_hash)).await {
            Ok(bytes) => {
                let record = crate::cbor::from_slice::<ContentRecord>(&bytes)
                    .map_err(|err| NodeError::invalid(format!("malformed content record: {err}")))?;
                if record.content_hash != *content_hash {
                    return Err(NodeError::Mismatch {
                        expected: content_hash.to_string(),
                        actual: record.content_hash.to_string(),
                    }
                    .into());
                }
                self.remember_content(&record).await?;
                Ok(record)
            }
            Err(err) => {
                debug!(content = %content_hash, error = %err, "dht content lookup failed");
                Err(NodeError::not_found(format!("content {content_hash} is unknown")).into())
            }
        }
    }

    /// Cached chunk, or the first verified copy from a candidate holder.
    async fn fetch_chunk(
        &self,
        chunk_hash: &ChunkHash,
        record: &ContentRecord,
    ) -> anyhow::Result<Chunk> {
        if let Some(chunk) = load_cached_chunk(self.inner.store.as_ref(), chunk_hash).await? {
            return Ok(chunk);
        }

        let mut candidates = self.state.read().await.chunk_index.candidates(chunk_hash);
        let reachable = |peer: &PeerAddr| {
            peer != self.local_address() && self.inner.peers.is_connected(peer)
        };
        if !candidates.iter().any(reachable) {
            match self.find_dht(&chunk_location_key(chunk_hash)).await {
                Ok(bytes) => {
                    let holders = decode_holders(&bytes);
                    let mut state = self.state.write().await;
                    state.chunk_index.record_many(chunk_hash, holders);
                    candidates = state.chunk_index.candidates(chunk_hash);
                }
                Err(err) => debug!(chunk = %chunk_hash, error = %err, "chunk location lookup failed"),
            }
        }
        let (mut candidates, offline): (Vec<_>, Vec<_>) = merge_peer_lists(
            self.local_address(),
            [candidates, vec![record.publisher.clone()]],
        )
        .into_iter()
        .partition(|peer| self.inner.peers.is_connected(peer));
        self.inner.peers.discover(offline.iter().cloned());
        candidates.extend(offline);

        let mut last_error = None;
        for peer in &candidates {
            match self.request_chunk(peer, chunk_hash).await {
                Ok(chunk) => {
                    cache_chunk(self.inner.store.as_ref(), chunk_hash, &chunk).await?;
                    self.state
                        .write()
                        .await
                        .chunk_index
                        .record(chunk_hash.clone(), peer.clone());
                    return Ok(chunk);
                }
                Err(err) => {
                    warn!(%peer, chunk = %chunk_hash, error = %err, "chunk fetch failed");
                    last_error = Some(err);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| {
            NodeError::not_found(format!("no holder known for chunk {chunk_hash}")).into()
        }))
    }

    async fn request_chunk(&self, peer: &PeerAddr, chunk_hash: &ChunkHash) -> anyhow::Result<Chunk> {
        let reply = self
            .request(
                peer,
                "chunk",
                Some(chunk_hash.to_string()),
                self.inner.config.request_timeout(),
                |correlation_id| Message::ChunkRequest {
                    correlation_id,
                    chunk_hash: chunk_hash.clone(),
                },
            )
            .await?;
        match reply {
            Message::ChunkResponse {
                chunk_data: Some(chunk),
                ..
            } => {
                verify_chunk(self.inner.crypto.as_ref(), chunk_hash, &chunk)?;
                Ok(chunk)
            }
            Message::ChunkResponse { .. } => {
                Err(NodeError::not_found(format!("{peer} does not hold chunk {chunk_hash}")).into())
            }
            other => Err(NodeError::Mismatch {
                expected: "chunk-response".into(),
                actual: other.type_name().into(),
            }
            .into()),
        }
    }
}
