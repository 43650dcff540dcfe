// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use std::collections::HashMap;
use std::collections::hash_map::Entry;

use serde::{Deserialize, Serialize};

use crate::{error::NodeError, ids::RoutingId, peer::PeerAddr};

pub const K: usize = 20;
pub const MAX_VALUE_SIZE: usize = 64 * 1024;
const BUCKETS: usize = 160;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhtNodeRecord {
    pub id: RoutingId,
    pub addr: PeerAddr,
    pub last_seen_ms: u64,
}

/// Kademlia routing table of supernodes, bucketed by XOR distance from the
/// local routing id. Buckets hold at most [`K`] nodes; a full bucket evicts
/// its least recently seen entry.
#[derive(Debug, Clone)]
pub struct RoutingTable {
    local: RoutingId,
    buckets: Vec<Vec<[u8; 20]>>,
    nodes: HashMap<[u8; 20], DhtNodeRecord>,
}

impl RoutingTable {
    pub fn new(local: RoutingId) -> Self {
        Self {
            local,
            buckets: vec![Vec::new(); BUCKETS],
            nodes: HashMap::new(),
        }
    }

    pub fn upsert(&mut self, addr: PeerAddr, now_ms: u64) {
        let id = addr.routing_id();
        let Some(bucket_idx) = bucket_index(&self.local, &id) else {
            return;
        };
        let record = DhtNodeRecord {
            id,
            addr,
            last_seen_ms: now_ms,
        };

        if let Entry::Occupied(mut occupied) = self.nodes.entry(id.0) {
            occupied.insert(record);
            return;
        }

        let bucket = &mut self.buckets[bucket_idx];
        if bucket.len() >= K {
            let oldest = bucket
                .iter()
                .enumerate()
                .min_by_key(|(_, node_id)| {
                    self.nodes
                        .get(*node_id)
                        .map(|existing| existing.last_seen_ms)
                        .unwrap_or(0)
                })
                .map(|(idx, _)| idx);
            if let Some(idx) = oldest {
                let evicted = bucket.remove(idx);
                self.nodes.remove(&evicted);
            }
        }
        bucket.push(id.0);
        self.nodes.insert(id.0, record);
    }

    pub fn remove(&mut self, addr: &PeerAddr) {
        let id = addr.routing_id();
        if self.nodes.remove(&id.0).is_some()
            && let Some(idx) = bucket_index(&self.local, &id)
        {
            self.buckets[idx].retain(|node_id| *node_id != id.0);
        }
    }

    /// Up to `limit` (at most [`K`]) known nodes ordered by distance to
    /// `target`.
    pub fn closest(&self, target: &RoutingId, limit: usize) -> Vec<PeerAddr> {
        let mut entries = self.nodes.values().collect::<Vec<_>>();
        entries.sort_by(|a, b| a.id.distance_cmp(target, &b.id));
        entries
            .into_iter()
            .take(limit.min(K))
            .map(|record| record.addr.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Position (MSB first) of the first differing bit; `None` for self.
fn bucket_index(local: &RoutingId, node: &RoutingId) -> Option<usize> {
    let distance = local.xor_distance(node);
    for (byte_idx, byte) in distance.iter().copied().enumerate() {
        if byte != 0 {
            return Some(byte_idx * 8 + byte.leading_zeros() as usize);
        }
    }
    None
}

/// A stored key-value entry. Expired once `timestamp_ms + ttl_ms <= now`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DhtRecord {
    pub key: String,
    #[serde(with = "serde_bytes")]
    pub value: Vec<u8>,
    pub ttl_ms: u64,
    pub timestamp_ms: u64,
}

impl DhtRecord {
    pub fn new(
        key: impl Into<String>,
        value: Vec<u8>,
        ttl_ms: u64,
        now_ms: u64,
    ) -> Result<Self, NodeError> {
        let key = key.into();
        validate_entry(&key, &value)?;
        Ok(Self {
            key,
            value,
            ttl_ms,
            timestamp_ms: now_ms,
        })
    }

    pub fn expires_at_ms(&self) -> u64 {
        self.timestamp_ms.saturating_add(self.ttl_ms)
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.expires_at_ms() <= now_ms
    }

    /// Remaining lifetime, used when re-storing a held record.
    pub fn remaining_ttl_ms(&self, now_ms: u64) -> u64 {
        self.expires_at_ms().saturating_sub(now_ms)
    }
}

pub fn validate_entry(key: &str, value: &[u8]) -> Result<(), NodeError> {
    if key.trim().is_empty() {
        return Err(NodeError::invalid("empty dht key"));
    }
    if value.len() > MAX_VALUE_SIZE {
        return Err(NodeError::invalid(format!(
            "dht value exceeds {MAX_VALUE_SIZE} bytes"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(idx: usize) -> PeerAddr {
        PeerAddr::new(format!("node-{idx:016x}-abcde"))
    }

    #[test]
    fn closest_is_sorted_and_capped_by_k() {
        let mut table = RoutingTable::new(RoutingId([0u8; 20]));
        for idx in 0..60 {
            table.upsert(addr(idx), idx as u64);
        }
        let target = RoutingId::for_key("some key");
        let closest = table.closest(&target, 99);
        assert_eq!(closest.len(), K);
        for pair in closest.windows(2) {
            assert!(
                pair[0]
                    .routing_id()
                    .distance_cmp(&target, &pair[1].routing_id())
                    .is_le()
            );
        }
    }

    #[test]
    fn upsert_refreshes_and_remove_forgets() {
        let mut table = RoutingTable::new(RoutingId::for_key("local"));
        table.upsert(addr(1), 1);
        table.upsert(addr(1), 2);
        assert_eq!(table.len(), 1);
        table.remove(&addr(1));
        assert!(table.is_empty());
    }

    #[test]
    fn self_is_never_routed() {
        let me = addr(7);
        let mut table = RoutingTable::new(me.routing_id());
        table.upsert(me, 1);
        assert!(table.is_empty());
    }

    #[test]
    fn record_expiry_boundary() {
        let record = DhtRecord::new("k", vec![1], 0, 1_000).expect("valid");
        assert!(record.is_expired(1_000), "ttl 0 expires immediately");

        let record = DhtRecord::new("k", vec![1], 500, 1_000).expect("valid");
        assert!(!record.is_expired(1_499));
        assert!(record.is_expired(1_500));
        assert_eq!(record.remaining_ttl_ms(1_200), 300);
    }

    #[test]
    fn rejects_empty_keys_and_oversized_values() {
        assert!(DhtRecord::new("", vec![], 10, 1).is_err());
        let err = DhtRecord::new("k", vec![0u8; MAX_VALUE_SIZE + 1], 10, 1)
            .expect_err("oversized");
        assert_eq!(err.kind(), crate::error::ErrorKind::InputValidation);
    }
}
