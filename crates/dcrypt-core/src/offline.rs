// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! Durable queue of publish steps attempted while no peer was reachable.

use std::{future::Future, sync::Arc, sync::Mutex};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{
    content::{Chunk, ContentRecord},
    error::NodeError,
    ids::ChunkHash,
    store::{Partition, Store},
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "kind",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum OfflineOperation {
    PublishChunk { chunk_hash: ChunkHash, chunk: Chunk },
    AnnounceContent { record: ContentRecord },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub replayed: usize,
    pub requeued: usize,
}

pub struct OfflineQueue {
    store: Arc<dyn Store>,
    pending: Mutex<Vec<OfflineOperation>>,
    drain_guard: tokio::sync::Mutex<()>,
}

impl OfflineQueue {
    /// Restore whatever was queued before the last shutdown.
    pub async fn load(store: Arc<dyn Store>) -> anyhow::Result<Self> {
        let mut pending = Vec::new();
        for (key, bytes) in store.get_all(Partition::OfflineQueue).await? {
            match crate::cbor::from_slice::<OfflineOperation>(&bytes) {
                Ok(op) => pending.push(op),
                Err(err) => warn!(%key, error = %err, "skipping undecodable offline operation"),
            }
        }
        if !pending.is_empty() {
            info!(count = pending.len(), "restored offline operations");
        }
        Ok(Self {
            store,
            pending: Mutex::new(pending),
            drain_guard: tokio::sync::Mutex::new(()),
        })
    }

    fn pending(&self) -> Result<std::sync::MutexGuard<'_, Vec<OfflineOperation>>, NodeError> {
        self.pending
            .lock()
            .map_err(|_| NodeError::unavailable("offline queue lock poisoned"))
    }

    pub async fn enqueue(&self, op: OfflineOperation) -> anyhow::Result<()> {
        let bytes = crate::cbor::to_vec(&op).context("encode offline operation")?;
        self.store.add(Partition::OfflineQueue, bytes).await?;
        self.pending()?.push(op);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.pending().map(|p| p.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<OfflineOperation> {
        self.pending().map(|p| p.clone()).unwrap_or_default()
    }

    /// Swap the queue out, clear the backing partition and replay every
    /// operation in order. Failed replays are queued again; they do not stop
    /// the rest of the pass.
    pub async fn drain<F, Fut>(&self, mut replay: F) -> anyhow::Result<DrainReport>
    where
        F: FnMut(OfflineOperation) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        let _guard = self.drain_guard.lock().await;
        let ops = std::mem::take(&mut *self.pending()?);
        if ops.is_empty() {
            return Ok(DrainReport::default());
        }
        self.store.clear(Partition::OfflineQueue).await?;

        let mut report = DrainReport::default();
        for op in ops {
            match replay(op.clone()).await {
                Ok(()) => report.replayed += 1,
                Err(err) => {
                    warn!(error = %err, "offline replay failed, requeueing");
                    self.enqueue(op).await?;
                    report.requeued += 1;
                }
            }
        }
        info!(
            replayed = report.replayed,
            requeued = report.requeued,
            "drained offline queue"
        );
        Ok(report)
    }
}
