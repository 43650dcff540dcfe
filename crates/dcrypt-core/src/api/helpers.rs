// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! Free helper functions used across the `api` module.

use std::collections::HashSet;

use anyhow::Context;

use crate::{
    content::{Chunk, ContentRecord},
    dht::DhtRecord,
    error::NodeError,
    ids::ChunkHash,
    peer::PeerAddr,
    store::{Partition, Store},
};

pub(super) async fn persist_content_record(
    store: &dyn Store,
    record: &ContentRecord,
) -> anyhow::Result<()> {
    let bytes = crate::cbor::to_vec(record).context("encode content record")?;
    store
        .put(Partition::Content, record.content_hash.as_str(), bytes)
        .await
}

pub(super) async fn load_cached_chunk(
    store: &dyn Store,
    chunk_hash: &ChunkHash,
) -> anyhow::Result<Option<Chunk>> {
    let Some(bytes) = store.get(Partition::ChunkCache, chunk_hash.as_str()).await? else {
        return Ok(None);
    };
    let chunk = crate::cbor::from_slice::<Chunk>(&bytes)
        .map_err(|err| NodeError::Storage(format!("corrupt cached chunk {chunk_hash}: {err}")))?;
    Ok(Some(chunk))
}

pub(super) async fn cache_chunk(
    store: &dyn Store,
    chunk_hash: &ChunkHash,
    chunk: &Chunk,
) -> anyhow::Result<()> {
    let bytes = crate::cbor::to_vec(chunk).context("encode chunk")?;
    store
        .put(Partition::ChunkCache, chunk_hash.as_str(), bytes)
        .await
}

pub(super) async fn load_dht_record(
    store: &dyn Store,
    key: &str,
) -> anyhow::Result<Option<DhtRecord>> {
    let Some(bytes) = store.get(Partition::DhtRecords, key).await? else {
        return Ok(None);
    };
    let record = crate::cbor::from_slice::<DhtRecord>(&bytes)
        .map_err(|err| NodeError::Storage(format!("corrupt dht record {key}: {err}")))?;
    Ok(Some(record))
}

pub(super) async fn persist_dht_record(store: &dyn Store, record: &DhtRecord) -> anyhow::Result<()> {
    let bytes = crate::cbor::to_vec(record).context("encode dht record")?;
    store.put(Partition::DhtRecords, &record.key, bytes).await
}

pub(super) async fn all_dht_records(store: &dyn Store) -> anyhow::Result<Vec<DhtRecord>> {
    store
        .get_all(Partition::DhtRecords)
        .await?
        .into_iter()
        .map(|(key, bytes)| {
            crate::cbor::from_slice::<DhtRecord>(&bytes).map_err(|err| {
                anyhow::Error::from(NodeError::Storage(format!("corrupt dht record {key}: {err}")))
            })
        })
        .collect()
}

/// Concatenate peer lists, dropping duplicates and `local`; first
/// occurrence wins.
pub(super) fn merge_peer_lists<I>(local: &PeerAddr, lists: I) -> Vec<PeerAddr>
where
    I: IntoIterator<Item = Vec<PeerAddr>>,
{
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for peer in lists.into_iter().flatten() {
        if &peer != local && seen.insert(peer.clone()) {
            out.push(peer);
        }
    }
    out
}

/// Chunk holder lists are stored in the DHT as CBOR arrays of addresses.
pub(super) fn decode_holders(bytes: &[u8]) -> Vec<PeerAddr> {
    crate::cbor::from_slice::<Vec<PeerAddr>>(bytes).unwrap_or_default()
}

pub(super) fn encode_holders(holders: &[PeerAddr]) -> anyhow::Result<Vec<u8>> {
    crate::cbor::to_vec(&holders).context("encode chunk holders")
}

pub(super) fn mean(samples: &[f64]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    samples.iter().sum::<f64>() / samples.len() as f64
}
