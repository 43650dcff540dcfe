// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
mod helpers;
mod node_dht;
mod node_ledger;
mod node_net;
mod node_publish;
#[cfg(test)]
mod tests;

use std::{
    collections::HashMap,
    future::Future,
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::{
    sync::{RwLock, broadcast, mpsc},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    chunk_index::ChunkPeerIndex,
    config::NodeConfig,
    content::ContentRecord,
    correlation::PendingRequests,
    crypto::{Aes256GcmSuite, ContentKey, CryptoSuite},
    dht::RoutingTable,
    directory::Directory,
    identity::Identity,
    ids::ContentHash,
    ledger::Ledger,
    offline::{OfflineOperation, OfflineQueue},
    peer::PeerAddr,
    peer_manager::{PeerEvent, PeerManager},
    store::{Partition, Store},
    transport::Transport,
};

pub use node_publish::RetrievedContent;

const EVENT_BUFFER: usize = 1024;
const ANNOUNCEMENT_BUFFER: usize = 256;

/// Shared handle to a running node. Cheap to clone.
#[derive(Clone)]
pub struct NodeHandle {
    inner: Arc<NodeInner>,
    state: Arc<RwLock<NodeState>>,
}

struct NodeInner {
    config: NodeConfig,
    identity: Identity,
    content_key: ContentKey,
    crypto: Arc<dyn CryptoSuite>,
    store: Arc<dyn Store>,
    directory: Arc<dyn Directory>,
    peers: PeerManager,
    pending: PendingRequests,
    offline: OfflineQueue,
    ledger: Ledger,
    announcements: broadcast::Sender<ContentRecord>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

struct NodeState {
    routing: RoutingTable,
    chunk_index: ChunkPeerIndex,
    known_content: HashMap<ContentHash, ContentRecord>,
    known_supernodes: Vec<PeerAddr>,
    bootstrap: Option<PeerAddr>,
    average_latency_ms: f64,
}

pub struct Node;

impl Node {
    /// Load identity and persisted state, start listening, and launch the
    /// event loop and every periodic task.
    pub async fn start(
        config: NodeConfig,
        transport: Arc<dyn Transport>,
        directory: Arc<dyn Directory>,
        store: Arc<dyn Store>,
    ) -> anyhow::Result<NodeHandle> {
        config.validate()?;
        let identity = Identity::load_or_create(
            store.as_ref(),
            config.supernode,
            config.identity_passphrase.as_deref(),
        )
        .await?;
        let local = identity.address().clone();
        let content_key = identity.content_key(config.content_secret.as_deref());

        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let peers = PeerManager::new(
            local.clone(),
            transport.clone(),
            config.connection_policy(),
            events_tx,
        );
        let offline = OfflineQueue::load(store.clone()).await?;
        let known_content = load_known_content(store.as_ref()).await?;
        let (announcements, _) = broadcast::channel(ANNOUNCEMENT_BUFFER);

        let known_supernodes = config
            .bootstrap_supernodes
            .iter()
            .map(|addr| PeerAddr::new(addr.as_str()))
            .filter(|addr| addr.is_supernode() && *addr != local)
            .collect();

        let handle = NodeHandle {
            inner: Arc::new(NodeInner {
                config,
                identity,
                content_key,
                crypto: Arc::new(Aes256GcmSuite),
                store: store.clone(),
                directory,
                peers,
                pending: PendingRequests::new(),
                offline,
                ledger: Ledger::new(store.clone()),
                announcements,
                tasks: Mutex::new(Vec::new()),
            }),
            state: Arc::new(RwLock::new(NodeState {
                routing: RoutingTable::new(local.routing_id()),
                chunk_index: ChunkPeerIndex::default(),
                known_content,
                known_supernodes,
                bootstrap: None,
                average_latency_ms: 0.0,
            })),
        };

        let incoming = transport.listen(&local).await?;
        handle.spawn_listener(incoming);
        handle.spawn_event_loop(events_rx);

        if let Err(err) = handle.refresh_directory().await {
            warn!(error = %err, "initial directory refresh failed");
        }
        handle.start_periodic_tasks();
        info!(address = %local, supernode = handle.is_supernode(), "node started");
        Ok(handle)
    }
}

async fn load_known_content(
    store: &dyn Store,
) -> anyhow::Result<HashMap<ContentHash, ContentRecord>> {
    let mut known = HashMap::new();
    for (key, bytes) in store.get_all(Partition::Content).await? {
        match crate::cbor::from_slice::<ContentRecord>(&bytes) {
            Ok(record) => {
                known.insert(record.content_hash.clone(), record);
            }
            Err(err) => warn!(%key, error = %err, "skipping undecodable content record"),
        }
    }
    Ok(known)
}

impl NodeHandle {
    pub fn local_address(&self) -> &PeerAddr {
        self.inner.identity.address()
    }

    pub fn is_supernode(&self) -> bool {
        self.inner.identity.is_supernode()
    }

    pub fn config(&self) -> &NodeConfig {
        &self.inner.config
    }

    pub fn active_peers(&self) -> Vec<PeerAddr> {
        self.inner.peers.active_peers()
    }

    pub fn active_supernodes(&self) -> Vec<PeerAddr> {
        self.inner.peers.active_supernodes()
    }

    pub fn peer_manager(&self) -> &PeerManager {
        &self.inner.peers
    }

    /// Live feed of content announcements, own publications included.
    pub fn subscribe_announcements(&self) -> broadcast::Receiver<ContentRecord> {
        self.inner.announcements.subscribe()
    }

    pub async fn known_content(&self) -> Vec<ContentRecord> {
        let state = self.state.read().await;
        let mut records = state.known_content.values().cloned().collect::<Vec<_>>();
        records.sort_by(|a, b| a.content_hash.cmp(&b.content_hash));
        records
    }

    pub async fn queue_offline_operation(&self, op: OfflineOperation) -> anyhow::Result<()> {
        self.inner.offline.enqueue(op).await
    }

    pub fn offline_queue_len(&self) -> usize {
        self.inner.offline.len()
    }

    pub fn offline_operations(&self) -> Vec<OfflineOperation> {
        self.inner.offline.snapshot()
    }

    /// Stop every background task and close all peer channels.
    pub fn shutdown(&self) {
        let tasks = match self.inner.tasks.lock() {
            Ok(mut tasks) => std::mem::take(&mut *tasks),
            Err(_) => vec![],
        };
        for task in tasks {
            task.abort();
        }
        self.inner.peers.shutdown();
        info!(address = %self.local_address(), "node stopped");
    }

    fn track_task(&self, task: JoinHandle<()>) {
        match self.inner.tasks.lock() {
            Ok(mut tasks) => tasks.push(task),
            Err(_) => task.abort(),
        }
    }

    fn spawn_listener(&self, mut incoming: mpsc::Receiver<crate::transport::Channel>) {
        let peers = self.inner.peers.clone();
        self.track_task(tokio::spawn(async move {
            while let Some(channel) = incoming.recv().await {
                peers.handle_inbound(channel).await;
            }
        }));
    }

    fn spawn_event_loop(&self, mut events: mpsc::Receiver<PeerEvent>) {
        let node = self.clone();
        self.track_task(tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                node.handle_event(event).await;
            }
        }));
    }

    /// Run `task` every `interval`, first after one full interval when
    /// `delay_first` is set.
    fn spawn_periodic<F, Fut>(&self, name: &'static str, interval: Duration, delay_first: bool, task: F)
    where
        F: Fn(NodeHandle) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let node = self.clone();
        self.track_task(tokio::spawn(async move {
            if delay_first {
                tokio::time::sleep(interval).await;
            }
            loop {
                if let Err(err) = task(node.clone()).await {
                    debug!(task = name, error = %err, "periodic task failed");
                }
                tokio::time::sleep(interval).await;
            }
        }));
    }

    fn start_periodic_tasks(&self) {
        let config = &self.inner.config;
        self.spawn_periodic(
            "discover",
            Duration::from_millis(config.discover_interval_ms),
            false,
            |node| async move { node.discover().await.map(|_| ()) },
        );
        self.spawn_periodic(
            "directory-refresh",
            Duration::from_millis(config.directory_refresh_ms),
            true,
            |node| async move { node.refresh_directory().await.map(|_| ()) },
        );
        self.spawn_periodic(
            "latency",
            Duration::from_millis(config.latency_interval_ms),
            true,
            |node| async move { node.sample_latency().await.map(|_| ()) },
        );
        if !self.is_supernode() {
            return;
        }
        self.spawn_periodic(
            "routing-refresh",
            Duration::from_millis(config.routing_refresh_ms),
            true,
            |node| async move { node.refresh_routing_table().await.map(|_| ()) },
        );
        self.spawn_periodic(
            "dht-republish",
            Duration::from_millis(config.republish_interval_ms),
            true,
            |node| async move { node.republish_dht().await.map(|_| ()) },
        );
        self.spawn_periodic(
            "dht-cleanup",
            Duration::from_millis(config.cleanup_interval_ms),
            true,
            |node| async move { node.cleanup_dht().await.map(|_| ()) },
        );
    }
}
