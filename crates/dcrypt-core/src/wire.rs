// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! Peer-to-peer message set.
//!
//! Every frame is a CBOR map with a `type` tag and camelCase fields. Tags
//! this build does not know decode to [`Message::Unknown`] so that newer
//! peers never break dispatch on older ones.

use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

use crate::{
    content::{Chunk, ContentMetadata, ContentRecord},
    error::NodeError,
    ids::{ChunkHash, ContentHash},
    peer::PeerAddr,
};

pub const MAX_MESSAGE_BYTES: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum Message {
    Handshake {
        peer_address: PeerAddr,
    },
    ChunkAnnounce {
        chunk_hash: ChunkHash,
        peer_address: PeerAddr,
    },
    ContentAnnounce {
        content_hash: ContentHash,
        metadata: ContentMetadata,
        chunk_hashes: Vec<ChunkHash>,
        peer_address: PeerAddr,
    },
    ChunkRequest {
        correlation_id: String,
        chunk_hash: ChunkHash,
    },
    ChunkResponse {
        correlation_id: String,
        chunk_hash: ChunkHash,
        #[serde(default)]
        chunk_data: Option<Chunk>,
    },
    StoreChunk {
        chunk_hash: ChunkHash,
        chunk_data: Chunk,
        peer_address: PeerAddr,
    },
    Ping {
        correlation_id: String,
    },
    Pong {
        correlation_id: String,
    },
    StoreDht {
        key: String,
        #[serde(with = "serde_bytes")]
        value: Vec<u8>,
        ttl: u64,
        peer_address: PeerAddr,
    },
    FindDht {
        correlation_id: String,
        key: String,
    },
    FindDhtResponse {
        correlation_id: String,
        key: String,
        #[serde(default)]
        value: Option<ByteBuf>,
        #[serde(default)]
        closest_peers: Vec<PeerAddr>,
    },
    GetKnownPeers {
        correlation_id: String,
    },
    KnownPeers {
        correlation_id: String,
        peers: Vec<PeerAddr>,
    },
    Commission {
        amount: f64,
        new_balance: f64,
        peer_address: PeerAddr,
    },
    MetadataRequest {
        correlation_id: String,
        content_hash: ContentHash,
    },
    MetadataResponse {
        correlation_id: String,
        content_hash: ContentHash,
        #[serde(default)]
        record: Option<ContentRecord>,
    },
    #[serde(other)]
    Unknown,
}

impl Message {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Handshake { .. } => "handshake",
            Self::ChunkAnnounce { .. } => "chunk-announce",
            Self::ContentAnnounce { .. } => "content-announce",
            Self::ChunkRequest { .. } => "chunk-request",
            Self::ChunkResponse { .. } => "chunk-response",
            Self::StoreChunk { .. } => "store-chunk",
            Self::Ping { .. } => "ping",
            Self::Pong { .. } => "pong",
            Self::StoreDht { .. } => "store-dht",
            Self::FindDht { .. } => "find-dht",
            Self::FindDhtResponse { .. } => "find-dht-response",
            Self::GetKnownPeers { .. } => "get-known-peers",
            Self::KnownPeers { .. } => "known-peers",
            Self::Commission { .. } => "commission",
            Self::MetadataRequest { .. } => "metadata-request",
            Self::MetadataResponse { .. } => "metadata-response",
            Self::Unknown => "unknown",
        }
    }

    /// Correlation id carried by response variants.
    pub fn response_correlation_id(&self) -> Option<&str> {
        match self {
            Self::ChunkResponse { correlation_id, .. }
            | Self::Pong { correlation_id }
            | Self::FindDhtResponse { correlation_id, .. }
            | Self::KnownPeers { correlation_id, .. }
            | Self::MetadataResponse { correlation_id, .. } => Some(correlation_id),
            _ => None,
        }
    }

    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        let bytes = crate::cbor::to_vec(self)?;
        if bytes.len() > MAX_MESSAGE_BYTES {
            return Err(NodeError::invalid(format!(
                "{} message exceeds {MAX_MESSAGE_BYTES} bytes",
                self.type_name()
            ))
            .into());
        }
        Ok(bytes)
    }

    pub fn decode(bytes: &[u8]) -> anyhow::Result<Self> {
        if bytes.len() > MAX_MESSAGE_BYTES {
            return Err(NodeError::invalid("message exceeds max size").into());
        }
        crate::cbor::from_slice(bytes)
            .map_err(|err| NodeError::invalid(format!("malformed message: {err}")).into())
    }
}
