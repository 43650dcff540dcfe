// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use std::collections::{BTreeSet, HashMap};

use crate::{ids::ChunkHash, peer::PeerAddr};

/// In-memory map of chunk hash to the peers believed to hold it.
#[derive(Debug, Default, Clone)]
pub struct ChunkPeerIndex {
    holders: HashMap<ChunkHash, BTreeSet<PeerAddr>>,
}

impl ChunkPeerIndex {
    pub fn record(&mut self, chunk: ChunkHash, peer: PeerAddr) {
        self.holders.entry(chunk).or_default().insert(peer);
    }

    pub fn record_many(&mut self, chunk: &ChunkHash, peers: impl IntoIterator<Item = PeerAddr>) {
        let entry = self.holders.entry(chunk.clone()).or_default();
        entry.extend(peers);
    }

    /// Known holders, supernodes first.
    pub fn candidates(&self, chunk: &ChunkHash) -> Vec<PeerAddr> {
        let Some(peers) = self.holders.get(chunk) else {
            return vec![];
        };
        let (mut supernodes, regular): (Vec<_>, Vec<_>) =
            peers.iter().cloned().partition(PeerAddr::is_supernode);
        supernodes.extend(regular);
        supernodes
    }

    pub fn len(&self) -> usize {
        self.holders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.holders.is_empty()
    }
}
