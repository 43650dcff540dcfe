// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! Peer events, wire dispatch and peer-level operations on `NodeHandle`.
//!
//! Dispatch runs on the node's event loop, so no handler here waits for a
//! correlated response. Work that must do so is spawned.

use std::time::{Duration, Instant};

use futures_util::future::join_all;
use rand::seq::SliceRandom;
use serde_bytes::ByteBuf;
use tracing::{debug, info, warn};

use crate::{
    content::{ContentRecord, verify_chunk},
    correlation::PendingRequests,
    dht::K,
    dht_keys::content_record_key,
    error::NodeError,
    ids::RoutingId,
    now_unix_ms,
    offline::DrainReport,
    peer::PeerAddr,
    peer_manager::PeerEvent,
    wire::Message,
};

use super::{
    NodeHandle,
    helpers::{
        cache_chunk, load_cached_chunk, load_dht_record, mean, merge_peer_lists,
        persist_content_record, persist_dht_record,
    },
};

impl NodeHandle {
    pub(super) async fn handle_event(&self, event: PeerEvent) {
        match event {
            PeerEvent::Connected {
                peer, first_active, ..
            } => {
                if peer.is_supernode() {
                    self.note_supernode(&peer).await;
                }
                if first_active && !self.inner.offline.is_empty() {
                    let node = self.clone();
                    tokio::spawn(async move {
                        if let Err(err) = node.drain_offline_queue().await {
                            warn!(error = %err, "offline queue drain failed");
                        }
                    });
                }
            }
            PeerEvent::Disconnected { peer } => {
                self.state.write().await.routing.remove(&peer);
            }
            PeerEvent::Message { peer, message } => {
                let kind = message.type_name();
                if let Err(err) = self.dispatch(&peer, message).await {
                    warn!(%peer, message = kind, error = %err, "message handling failed");
                }
            }
        }
    }

    async fn note_supernode(&self, peer: &PeerAddr) {
        let mut state = self.state.write().await;
        state.routing.upsert(peer.clone(), now_unix_ms());
        if !state.known_supernodes.contains(peer) {
            state.known_supernodes.push(peer.clone());
        }
    }

    async fn dispatch(&self, from: &PeerAddr, message: Message) -> anyhow::Result<()> {
        match message {
            Message::Handshake { peer_address } => {
                debug!(peer = %from, announced = %peer_address, "handshake");
                if peer_address.is_supernode() {
                    self.note_supernode(&peer_address).await;
                }
            }
            Message::ChunkAnnounce {
                chunk_hash,
                peer_address,
            } => {
                self.state
                    .write()
                    .await
                    .chunk_index
                    .record(chunk_hash, peer_address);
            }
            Message::ContentAnnounce {
                content_hash,
                metadata,
                chunk_hashes,
                peer_address,
            } => {
                let record = ContentRecord {
                    content_hash,
                    metadata,
                    chunk_hashes,
                    publisher: peer_address,
                };
                self.remember_content(&record).await?;
                debug!(peer = %from, content = %record.content_hash, "content announced");
                let _ = self.inner.announcements.send(record);
            }
            Message::ChunkRequest {
                correlation_id,
                chunk_hash,
            } => {
                let chunk_data =
                    match load_cached_chunk(self.inner.store.as_ref(), &chunk_hash).await {
                        Ok(chunk) => chunk,
                        Err(err) => {
                            warn!(chunk = %chunk_hash, error = %err, "chunk cache unreadable");
                            None
                        }
                    };
                self.inner
                    .peers
                    .send(
                        from,
                        &Message::ChunkResponse {
                            correlation_id,
                            chunk_hash,
                            chunk_data,
                        },
                    )
                    .await?;
            }
            Message::StoreChunk {
                chunk_hash,
                chunk_data,
                peer_address,
            } => {
                verify_chunk(self.inner.crypto.as_ref(), &chunk_hash, &chunk_data)?;
                cache_chunk(self.inner.store.as_ref(), &chunk_hash, &chunk_data).await?;
                self.state
                    .write()
                    .await
                    .chunk_index
                    .record(chunk_hash, peer_address);
            }
            Message::Ping { correlation_id } => {
                self.inner
                    .peers
                    .send(from, &Message::Pong { correlation_id })
                    .await?;
            }
            Message::StoreDht {
                key,
                value,
                ttl,
                peer_address,
            } => self.accept_dht_store(from, key, value, ttl, peer_address).await?,
            Message::FindDht {
                correlation_id,
                key,
            } => self.answer_find_dht(from, correlation_id, key).await?,
            Message::GetKnownPeers { correlation_id } => {
                let peers = {
                    let state = self.state.read().await;
                    merge_peer_lists(
                        from,
                        [
                            state.known_supernodes.clone(),
                            self.active_supernodes(),
                            self.inner.peers.known_peers(self.inner.config.max_peers),
                        ],
                    )
                };
                self.inner
                    .peers
                    .send(
                        from,
                        &Message::KnownPeers {
                            correlation_id,
                            peers,
                        },
                    )
                    .await?;
            }
            Message::Commission {
                amount,
                new_balance,
                peer_address,
            } => {
                info!(payer = %peer_address, amount, new_balance, "commission credited");
            }
            Message::MetadataRequest {
                correlation_id,
                content_hash,
            } => {
                let mut record = self
                    .state
                    .read()
                    .await
                    .known_content
                    .get(&content_hash)
                    .cloned();
                if record.is_none() && self.is_supernode() {
                    record = self
                        .local_dht_value(&content_record_key(&content_hash))
                        .await?
                        .and_then(|bytes| crate::cbor::from_slice::<ContentRecord>(&bytes).ok())
                        .filter(|found| found.content_hash == content_hash);
                }
                self.inner
                    .peers
                    .send(
                        from,
                        &Message::MetadataResponse {
                            correlation_id,
                            content_hash,
                            record,
                        },
                    )
                    .await?;
            }
            response @ (Message::ChunkResponse { .. }
            | Message::Pong { .. }
            | Message::FindDhtResponse { .. }
            | Message::KnownPeers { .. }
            | Message::MetadataResponse { .. }) => {
                if !self.inner.pending.resolve(response) {
                    debug!(peer = %from, "late or unsolicited response dropped");
                }
            }
            Message::Unknown => {
                warn!(peer = %from, "dropping message of unknown type");
            }
        }
        Ok(())
    }

    /// Supernodes persist the record. A store sent by a regular peer is
    /// also forwarded to the closest supernodes this node knows.
    async fn accept_dht_store(
        &self,
        from: &PeerAddr,
        key: String,
        value: Vec<u8>,
        ttl: u64,
        writer: PeerAddr,
    ) -> anyhow::Result<()> {
        if !self.is_supernode() {
            debug!(peer = %from, %key, "ignoring dht store on a regular peer");
            return Ok(());
        }
        let record = crate::dht::DhtRecord::new(key, value, ttl, now_unix_ms())?;
        persist_dht_record(self.inner.store.as_ref(), &record).await?;
        debug!(peer = %from, key = %record.key, ttl, "stored dht record");

        if from.is_supernode() {
            return Ok(());
        }
        let targets = self
            .state
            .read()
            .await
            .routing
            .closest(&RoutingId::for_key(&record.key), K);
        let forward = Message::StoreDht {
            key: record.key,
            value: record.value,
            ttl,
            peer_address: writer,
        };
        for target in targets.iter().filter(|t| *t != from && *t != self.local_address()) {
            if let Err(err) = self.inner.peers.send(target, &forward).await {
                debug!(peer = %target, error = %err, "dht store forward failed");
            }
        }
        Ok(())
    }

    async fn answer_find_dht(
        &self,
        from: &PeerAddr,
        correlation_id: String,
        key: String,
    ) -> anyhow::Result<()> {
        let value = if self.is_supernode() {
            self.local_dht_value(&key).await?
        } else {
            None
        };
        if value.is_none() && self.is_supernode() && !from.is_supernode() {
            // A regular peer delegates the whole lookup to its bootstrap
            // supernode; the walk waits on responses, so it leaves the loop.
            let node = self.clone();
            let from = from.clone();
            tokio::spawn(async move {
                let value = node.find_dht(&key).await.ok();
                node.reply_find_dht(&from, correlation_id, key, value).await;
            });
            return Ok(());
        }
        self.reply_find_dht(from, correlation_id, key, value).await;
        Ok(())
    }

    async fn reply_find_dht(
        &self,
        to: &PeerAddr,
        correlation_id: String,
        key: String,
        value: Option<Vec<u8>>,
    ) {
        let closest_peers = self
            .state
            .read()
            .await
            .routing
            .closest(&RoutingId::for_key(&key), K)
            .into_iter()
            .filter(|peer| peer != to)
            .collect();
        let response = Message::FindDhtResponse {
            correlation_id,
            key,
            value: value.map(ByteBuf::from),
            closest_peers,
        };
        if let Err(err) = self.inner.peers.send(to, &response).await {
            debug!(peer = %to, error = %err, "find response not delivered");
        }
    }

    /// Unexpired value held in this node's own DHT partition.
    pub(super) async fn local_dht_value(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(load_dht_record(self.inner.store.as_ref(), key)
            .await?
            .filter(|record| !record.is_expired(now_unix_ms()))
            .map(|record| record.value))
    }

    /// Track and persist a content record so it survives restarts.
    pub(super) async fn remember_content(&self, record: &ContentRecord) -> anyhow::Result<()> {
        {
            let mut state = self.state.write().await;
            state
                .known_content
                .insert(record.content_hash.clone(), record.clone());
            for chunk_hash in &record.chunk_hashes {
                state
                    .chunk_index
                    .record(chunk_hash.clone(), record.publisher.clone());
            }
        }
        persist_content_record(self.inner.store.as_ref(), record).await
    }

    /// Send a correlated request and wait for the matching response.
    pub(super) async fn request<F>(
        &self,
        peer: &PeerAddr,
        purpose: &str,
        guard: Option<String>,
        timeout: Duration,
        build: F,
    ) -> anyhow::Result<Message>
    where
        F: FnOnce(String) -> Message,
    {
        let id = PendingRequests::new_id(peer, purpose);
        let pending = self.inner.pending.register(id.clone(), guard);
        if let Err(err) = self.inner.peers.send(peer, &build(id)).await {
            self.inner.pending.cancel(pending);
            return Err(err);
        }
        self.inner.pending.wait(pending, timeout).await
    }

    pub fn pending_requests(&self) -> usize {
        self.inner.pending.len()
    }

    /// Round-trip time of one ping.
    pub async fn ping(&self, peer: &PeerAddr) -> anyhow::Result<Duration> {
        let started = Instant::now();
        let reply = self
            .request(peer, "ping", None, self.inner.config.ping_timeout(), |correlation_id| {
                Message::Ping { correlation_id }
            })
            .await?;
        match reply {
            Message::Pong { .. } => Ok(started.elapsed()),
            other => Err(NodeError::Mismatch {
                expected: "pong".into(),
                actual: other.type_name().into(),
            }
            .into()),
        }
    }

    /// Ping a random sample of active peers. The mean of the answers becomes
    /// the advertised average latency; silent peers do not count.
    pub async fn sample_latency(&self) -> anyhow::Result<f64> {
        let active = self.active_peers();
        let sampled = active
            .choose_multiple(
                &mut rand::thread_rng(),
                self.inner.config.latency_sample_size,
            )
            .cloned()
            .collect::<Vec<_>>();
        let results = join_all(sampled.iter().map(|peer| self.ping(peer))).await;
        let samples = results
            .into_iter()
            .filter_map(Result::ok)
            .map(|rtt| rtt.as_secs_f64() * 1_000.0)
            .collect::<Vec<_>>();
        let average = mean(&samples);
        self.state.write().await.average_latency_ms = average;
        debug!(
            sampled = sampled.len(),
            answered = samples.len(),
            average_ms = average,
            "latency sampled"
        );
        Ok(average)
    }

    pub async fn average_latency_ms(&self) -> f64 {
        self.state.read().await.average_latency_ms
    }

    /// Feed every candidate source into the peer manager: the directory,
    /// known supernodes, the routing table and currently active peers.
    pub async fn discover(&self) -> anyhow::Result<usize> {
        let directory = match self.inner.directory.list_supernodes().await {
            Ok(listed) => listed,
            Err(err) => {
                debug!(error = %err, "directory unavailable during discovery");
                vec![]
            }
        };
        let (known, closest) = {
            let state = self.state.read().await;
            (
                state.known_supernodes.clone(),
                state.routing.closest(&self.local_address().routing_id(), K),
            )
        };
        let candidates = merge_peer_lists(
            self.local_address(),
            [directory, known, closest, self.active_peers()],
        );
        let fresh = self.inner.peers.discover(candidates);
        if fresh > 0 {
            debug!(fresh, "discovered new peers");
        }
        Ok(fresh)
    }

    /// Pull the current supernode list from the directory service.
    pub async fn refresh_directory(&self) -> anyhow::Result<usize> {
        let listed = self.inner.directory.list_supernodes().await?;
        let known = {
            let mut state = self.state.write().await;
            let mut merged = merge_peer_lists(
                self.local_address(),
                [listed, std::mem::take(&mut state.known_supernodes)],
            );
            merged.truncate(self.inner.config.max_peers);
            state.known_supernodes = merged.clone();
            merged
        };
        let fresh = self.inner.peers.discover(known.iter().cloned());
        debug!(known = known.len(), fresh, "directory refreshed");
        Ok(known.len())
    }

    pub async fn known_supernodes(&self) -> Vec<PeerAddr> {
        self.state.read().await.known_supernodes.clone()
    }

    /// Ask `peer` for the supernodes it knows and start connecting to them.
    pub async fn exchange_known_peers(&self, peer: &PeerAddr) -> anyhow::Result<Vec<PeerAddr>> {
        let reply = self
            .request(peer, "peers", None, self.inner.config.request_timeout(), |correlation_id| {
                Message::GetKnownPeers { correlation_id }
            })
            .await?;
        let Message::KnownPeers { peers, .. } = reply else {
            return Err(NodeError::Mismatch {
                expected: "known-peers".into(),
                actual: reply.type_name().into(),
            }
            .into());
        };
        let peers = merge_peer_lists(self.local_address(), [peers]);
        {
            let mut state = self.state.write().await;
            let merged = merge_peer_lists(
                self.local_address(),
                [std::mem::take(&mut state.known_supernodes), peers.clone()],
            );
            state.known_supernodes = merged
                .into_iter()
                .filter(PeerAddr::is_supernode)
                .take(self.inner.config.max_peers)
                .collect();
        }
        self.inner.peers.discover(peers.iter().cloned());
        Ok(peers)
    }

    /// Replay everything queued while no peer was reachable.
    pub async fn drain_offline_queue(&self) -> anyhow::Result<DrainReport> {
        self.inner
            .offline
            .drain(|op| self.replay_offline(op))
            .await
    }
}
