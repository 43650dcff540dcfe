// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use std::collections::HashMap;

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use crate::peer::{PeerAddr, PeerState};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub addr: PeerAddr,
    pub state: PeerState,
    /// Consecutive failed connection attempts; reset on success.
    pub attempts: u32,
    pub last_success_ms: Option<u64>,
    pub discovered_at_ms: u64,
}

/// Tracked peers keyed by address.
#[derive(Debug, Default, Clone)]
pub struct PeerDb {
    records: HashMap<PeerAddr, PeerRecord>,
}

impl PeerDb {
    /// Track `addr` in `Discovered` state. Returns `false` if it was known.
    pub fn upsert_discovered(&mut self, addr: PeerAddr, now_ms: u64) -> bool {
        if self.records.contains_key(&addr) {
            return false;
        }
        self.records.insert(
            addr.clone(),
            PeerRecord {
                addr,
                state: PeerState::Discovered,
                attempts: 0,
                last_success_ms: None,
                discovered_at_ms: now_ms,
            },
        );
        true
    }

    pub fn get(&self, addr: &PeerAddr) -> Option<&PeerRecord> {
        self.records.get(addr)
    }

    pub fn contains(&self, addr: &PeerAddr) -> bool {
        self.records.contains_key(addr)
    }

    pub fn set_state(&mut self, addr: &PeerAddr, state: PeerState) {
        if let Some(record) = self.records.get_mut(addr) {
            record.state = state;
        }
    }

    pub fn mark_connected(&mut self, addr: &PeerAddr, now_ms: u64) {
        let record = self
            .records
            .entry(addr.clone())
            .or_insert_with(|| PeerRecord {
                addr: addr.clone(),
                state: PeerState::Discovered,
                attempts: 0,
                last_success_ms: None,
                discovered_at_ms: now_ms,
            });
        record.state = PeerState::Connected;
        record.attempts = 0;
        record.last_success_ms = Some(now_ms);
    }

    /// Count one failed attempt and return the new consecutive total.
    pub fn record_failure(&mut self, addr: &PeerAddr) -> u32 {
        match self.records.get_mut(addr) {
            Some(record) => {
                record.attempts = record.attempts.saturating_add(1);
                record.state = PeerState::Disconnected;
                record.attempts
            }
            None => 0,
        }
    }

    pub fn remove(&mut self, addr: &PeerAddr) -> Option<PeerRecord> {
        self.records.remove(addr)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn in_state(&self, state: PeerState) -> Vec<PeerAddr> {
        self.records
            .values()
            .filter(|record| record.state == state)
            .map(|record| record.addr.clone())
            .collect()
    }

    /// Drop peers beyond `cap`, never touching connected ones. Peers that
    /// never succeeded go first, then the least recently successful.
    pub fn evict_over_capacity(&mut self, cap: usize) -> Vec<PeerAddr> {
        if self.records.len() <= cap {
            return vec![];
        }
        let mut candidates = self
            .records
            .values()
            .filter(|record| record.state != PeerState::Connected)
            .map(|record| {
                (
                    record.last_success_ms.unwrap_or(0),
                    record.discovered_at_ms,
                    record.addr.clone(),
                )
            })
            .collect::<Vec<_>>();
        candidates.sort();

        let excess = self.records.len() - cap;
        let evicted = candidates
            .into_iter()
            .take(excess)
            .map(|(_, _, addr)| addr)
            .collect::<Vec<_>>();
        for addr in &evicted {
            self.records.remove(addr);
        }
        evicted
    }

    /// Up to `max` random addresses, for answering known-peer queries.
    pub fn sample(&self, max: usize) -> Vec<PeerAddr> {
        let mut addrs = self.records.keys().cloned().collect::<Vec<_>>();
        addrs.shuffle(&mut rand::thread_rng());
        addrs.truncate(max);
        addrs
    }
}
