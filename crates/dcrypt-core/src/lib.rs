// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
pub mod api;
pub mod cbor;
pub mod chunk_index;
pub mod config;
pub mod content;
pub mod correlation;
pub mod crypto;
pub mod dht;
pub mod dht_keys;
pub mod directory;
pub mod error;
pub mod identity;
pub mod ids;
pub mod ledger;
pub mod offline;
pub mod peer;
pub mod peer_db;
pub mod peer_manager;
pub mod store;
pub mod transport;
pub mod wire;

pub use api::{Node, NodeHandle, RetrievedContent};
pub use chunk_index::ChunkPeerIndex;
pub use config::NodeConfig;
pub use content::{
    Chunk, ContentMetadata, ContentRecord, MAX_CHUNK_BYTES, chunk_count, chunk_hash, chunkify,
    content_hash, reassemble, verify_chunk,
};
pub use correlation::{Pending, PendingRequests};
pub use crypto::{Aes256GcmSuite, ContentKey, CryptoSuite};
pub use dht::{DhtRecord, K, MAX_VALUE_SIZE, RoutingTable};
pub use dht_keys::{chunk_location_key, content_record_key};
pub use directory::{Directory, StaticDirectory};
pub use error::{ErrorKind, NodeError, error_kind};
pub use identity::Identity;
pub use ids::{ChunkHash, ContentHash, RoutingId};
pub use ledger::{CommissionPayout, Ledger, Transaction, TransactionKind};
pub use offline::{DrainReport, OfflineOperation, OfflineQueue};
pub use peer::{Direction, PeerAddr, PeerState};
pub use peer_db::{PeerDb, PeerRecord};
pub use peer_manager::{ConnectionPolicy, PeerEvent, PeerManager};
pub use store::{
    EncryptedSecret, MemoryStore, Partition, SqliteStore, Store, decrypt_secret, encrypt_secret,
};
pub use transport::{
    Channel, ChannelEvent, MemoryNetwork, MemoryTransport, TcpTransport, Transport,
};
pub use wire::{MAX_MESSAGE_BYTES, Message};

/// Wall-clock milliseconds since the Unix epoch.
pub fn now_unix_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
