// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! Pending request table pairing outbound requests with their responses.

use std::{
    collections::HashMap,
    sync::{
        Mutex,
        atomic::{AtomicU32, Ordering},
    },
    time::{Duration, SystemTime},
};

use tokio::sync::oneshot;
use tracing::debug;

use crate::{error::NodeError, peer::PeerAddr, wire::Message};

type Resolution = Result<Message, NodeError>;

struct PendingEntry {
    tx: oneshot::Sender<Resolution>,
    guard: Option<String>,
}

/// Receiving half of a registered request.
#[derive(Debug)]
pub struct Pending {
    id: String,
    rx: oneshot::Receiver<Resolution>,
}

impl Pending {
    pub fn id(&self) -> &str {
        &self.id
    }
}

#[derive(Default)]
pub struct PendingRequests {
    entries: Mutex<HashMap<String, PendingEntry>>,
}

fn next_seq() -> u32 {
    static NEXT_SEQ: AtomicU32 = AtomicU32::new(1);
    NEXT_SEQ.fetch_add(1, Ordering::Relaxed)
}

/// Value a response must carry to satisfy a guarded request.
pub fn guard_value(message: &Message) -> Option<&str> {
    match message {
        Message::ChunkResponse { chunk_hash, .. } => Some(chunk_hash.as_str()),
        Message::MetadataResponse { content_hash, .. } => Some(content_hash.as_str()),
        Message::FindDhtResponse { key, .. } => Some(key.as_str()),
        _ => None,
    }
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// `<peer>-<purpose>-<unix millis>-<seq>`
    pub fn new_id(peer: &PeerAddr, purpose: &str) -> String {
        let millis = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        format!("{peer}-{purpose}-{millis}-{}", next_seq())
    }

    pub fn register(&self, id: String, guard: Option<String>) -> Pending {
        let (tx, rx) = oneshot::channel();
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(id.clone(), PendingEntry { tx, guard });
        }
        Pending { id, rx }
    }

    /// Hand a response to its waiter. Returns `false` when nothing was
    /// waiting, which is the normal fate of late responses.
    pub fn resolve(&self, message: Message) -> bool {
        let Some(id) = message.response_correlation_id() else {
            return false;
        };
        let entry = match self.entries.lock() {
            Ok(mut entries) => entries.remove(id),
            Err(_) => None,
        };
        let Some(entry) = entry else {
            debug!(correlation_id = id, "dropping response without pending request");
            return false;
        };

        let mismatch = entry.guard.as_ref().and_then(|expected| {
            let actual = guard_value(&message);
            (actual != Some(expected.as_str())).then(|| NodeError::Mismatch {
                expected: expected.clone(),
                actual: actual.unwrap_or("<none>").to_string(),
            })
        });
        let resolution = match mismatch {
            Some(err) => Err(err),
            None => Ok(message),
        };
        let _ = entry.tx.send(resolution);
        true
    }

    fn remove(&self, id: &str) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.remove(id);
        }
    }

    /// Wait for the response, removing the entry on timeout.
    pub async fn wait(&self, pending: Pending, timeout: Duration) -> anyhow::Result<Message> {
        let Pending { id, rx } = pending;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(message))) => Ok(message),
            Ok(Ok(Err(err))) => Err(err.into()),
            Ok(Err(_)) => {
                self.remove(&id);
                Err(NodeError::Network(format!("request {id} was abandoned")).into())
            }
            Err(_) => {
                self.remove(&id);
                Err(NodeError::Timeout {
                    correlation_id: id,
                    timeout_ms: timeout.as_millis() as u64,
                }
                .into())
            }
        }
    }

    /// Drop a registered request, e.g. when sending it failed.
    pub fn cancel(&self, pending: Pending) {
        self.remove(&pending.id);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::{ErrorKind, error_kind},
        ids::ChunkHash,
    };

    fn peer() -> PeerAddr {
        PeerAddr::from("node-abcd-00001")
    }

    #[test]
    fn ids_embed_peer_and_purpose_and_are_unique() {
        let a = PendingRequests::new_id(&peer(), "ping");
        let b = PendingRequests::new_id(&peer(), "ping");
        assert!(a.starts_with("node-abcd-00001-ping-"));
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn matching_response_resolves_and_clears_entry() {
        let table = PendingRequests::new();
        let id = PendingRequests::new_id(&peer(), "ping");
        let pending = table.register(id.clone(), None);
        assert_eq!(table.len(), 1);

        assert!(table.resolve(Message::Pong {
            correlation_id: id.clone()
        }));
        let msg = table
            .wait(pending, Duration::from_secs(1))
            .await
            .expect("resolved");
        assert_eq!(msg, Message::Pong { correlation_id: id });
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn unanswered_request_times_out_without_leaking() {
        let table = PendingRequests::new();
        let pending = table.register(PendingRequests::new_id(&peer(), "ping"), None);
        let err = table
            .wait(pending, Duration::from_millis(20))
            .await
            .expect_err("timeout");
        assert_eq!(error_kind(&err), Some(ErrorKind::Timeout));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn guard_mismatch_rejects() {
        let table = PendingRequests::new();
        let requested = ChunkHash::from_digest(&[1u8; 32]);
        let id = PendingRequests::new_id(&peer(), "chunk");
        let pending = table.register(id.clone(), Some(requested.to_string()));

        table.resolve(Message::ChunkResponse {
            correlation_id: id,
            chunk_hash: ChunkHash::from_digest(&[2u8; 32]),
            chunk_data: None,
        });
        let err = table
            .wait(pending, Duration::from_secs(1))
            .await
            .expect_err("mismatch");
        assert_eq!(error_kind(&err), Some(ErrorKind::Mismatch));
        assert!(table.is_empty());
    }

    #[test]
    fn late_response_is_a_noop() {
        let table = PendingRequests::new();
        assert!(!table.resolve(Message::Pong {
            correlation_id: "gone".into()
        }));
        assert!(!table.resolve(Message::Ping {
            correlation_id: "not-a-response".into()
        }));
    }
}
