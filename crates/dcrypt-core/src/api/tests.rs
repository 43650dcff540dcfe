// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use super::*;
use crate::{
    content::{Chunk, ContentMetadata, MAX_CHUNK_BYTES, chunkify, content_hash},
    crypto::{Aes256GcmSuite, ContentKey},
    directory::StaticDirectory,
    dht::MAX_VALUE_SIZE,
    error::{ErrorKind, NodeError, error_kind},
    ids::ChunkHash,
    ledger::TransactionKind,
    store::{MemoryStore, Partition, Store},
    transport::{Channel, ChannelEvent, MemoryNetwork},
    wire::{MAX_MESSAGE_BYTES, Message},
};
use async_trait::async_trait;
use std::{
    sync::{
        Arc, Mutex as StdMutex,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

const SWARM_SECRET: &str = "swarm-secret";

fn test_config(supernode: bool) -> NodeConfig {
    NodeConfig {
        supernode,
        connection_retry_base_ms: 20,
        request_timeout_ms: 1_000,
        ping_timeout_ms: 500,
        discover_interval_ms: 25,
        content_secret: Some(SWARM_SECRET.into()),
        ..NodeConfig::default()
    }
}

struct Swarm {
    network: MemoryNetwork,
    directory: Arc<StaticDirectory>,
    supernodes: StdMutex<Vec<PeerAddr>>,
}

impl Swarm {
    fn new() -> Self {
        Self {
            network: MemoryNetwork::new(),
            directory: Arc::new(StaticDirectory::default()),
            supernodes: StdMutex::new(vec![]),
        }
    }

    fn add_supernode(&self, addr: PeerAddr) {
        let mut list = self.supernodes.lock().expect("lock");
        list.push(addr);
        self.directory.set(list.clone());
    }

    async fn spawn(&self, supernode: bool) -> NodeHandle {
        self.spawn_with(test_config(supernode), MemoryStore::new())
            .await
    }

    async fn spawn_with(&self, config: NodeConfig, store: Arc<dyn Store>) -> NodeHandle {
        let node = Node::start(
            config,
            self.network.transport(),
            self.directory.clone(),
            store,
        )
        .await
        .expect("start node");
        if node.is_supernode() {
            self.add_supernode(node.local_address().clone());
        }
        node
    }

    /// Listen on `addr` without running a node, to script a peer by hand.
    async fn scripted_peer(&self, addr: &str) -> (PeerAddr, mpsc::Receiver<Channel>) {
        let addr = PeerAddr::from(addr);
        let incoming = self
            .network
            .transport()
            .listen(&addr)
            .await
            .expect("listen");
        (addr, incoming)
    }
}

/// Poll `$check` (which may `.await`) until it holds or five seconds pass.
macro_rules! eventually {
    ($what:expr, $check:expr) => {{
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if $check {
                break;
            }
            assert!(Instant::now() < deadline, "timed out waiting for {}", $what);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }};
}

async fn wait_linked(a: &NodeHandle, b: &NodeHandle) {
    eventually!("nodes to connect", {
        a.active_peers().contains(b.local_address()) && b.active_peers().contains(a.local_address())
    });
}

async fn wait_known(node: &NodeHandle, hash: &ContentHash) {
    eventually!("content record to arrive", {
        node.known_content()
            .await
            .iter()
            .any(|record| &record.content_hash == hash)
    });
}

async fn accept(incoming: &mut mpsc::Receiver<Channel>) -> Channel {
    tokio::time::timeout(Duration::from_secs(5), incoming.recv())
        .await
        .expect("dial in time")
        .expect("inbound channel")
}

/// Answer every frame on `channel` with whatever `reply` returns.
fn serve<F>(mut channel: Channel, reply: F)
where
    F: Fn(Message) -> Option<Message> + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(event) = channel.inbound.recv().await {
            let ChannelEvent::Data(bytes) = event else {
                return;
            };
            let Ok(message) = Message::decode(&bytes) else {
                continue;
            };
            if let Some(response) = reply(message) {
                let bytes = response.encode().expect("encode");
                if channel.outbound.send(bytes).await.is_err() {
                    return;
                }
            }
        }
    });
}

fn note(tags: &[&str]) -> ContentMetadata {
    ContentMetadata {
        content_type: "note".into(),
        tags: tags.iter().map(|tag| tag.to_string()).collect(),
        ..ContentMetadata::default()
    }
}

#[tokio::test]
async fn publish_and_retrieve_across_nodes() {
    let swarm = Swarm::new();
    let supernode = swarm.spawn(true).await;
    let publisher = swarm.spawn(false).await;
    let reader = swarm.spawn(false).await;
    wait_linked(&publisher, &supernode).await;
    wait_linked(&reader, &supernode).await;

    let mut feed = supernode.subscribe_announcements();
    let hash = publisher
        .publish(note(&[" intro ", "intro", ""]), b"hello world", "text/plain")
        .await
        .expect("publish");

    let announced = tokio::time::timeout(Duration::from_secs(5), feed.recv())
        .await
        .expect("announcement in time")
        .expect("announcement");
    assert_eq!(announced.content_hash, hash);
    assert_eq!(announced.metadata.tags, vec!["intro".to_string()]);
    assert_eq!(announced.chunk_hashes.len(), 1);
    assert_eq!(publisher.offline_queue_len(), 0);

    let retrieved = reader.retrieve(hash.as_str()).await.expect("retrieve");
    assert_eq!(retrieved.data, b"hello world");
    assert_eq!(retrieved.file_type, "text/plain");
    assert_eq!(retrieved.record.publisher, *publisher.local_address());
    assert_eq!(reader.pending_requests(), 0);
}

#[tokio::test]
async fn chunk_count_follows_active_supernodes() {
    let swarm = Swarm::new();
    let mut supernodes = Vec::new();
    for _ in 0..4 {
        supernodes.push(swarm.spawn(true).await);
    }
    let publisher = swarm.spawn(false).await;
    let reader = swarm.spawn(false).await;
    eventually!("full mesh", {
        publisher.active_supernodes().len() == 4
            && reader.active_supernodes().len() == 4
            && supernodes
                .iter()
                .all(|node| node.active_supernodes().len() == 3)
    });

    let hash = publisher
        .publish(note(&[]), b"hello world", "text/plain")
        .await
        .expect("publish");
    for node in &supernodes {
        wait_known(node, &hash).await;
    }
    let record = publisher
        .known_content()
        .await
        .into_iter()
        .find(|record| record.content_hash == hash)
        .expect("own record");
    assert_eq!(record.chunk_hashes.len(), 4);

    let retrieved = reader.retrieve(hash.as_str()).await.expect("retrieve");
    assert_eq!(retrieved.data, b"hello world");
}

#[tokio::test]
async fn content_larger_than_a_frame_is_split_and_retrieved() {
    let swarm = Swarm::new();
    let supernode = swarm.spawn(true).await;
    let publisher = swarm.spawn(false).await;
    let reader = swarm.spawn(false).await;
    wait_linked(&publisher, &supernode).await;
    wait_linked(&reader, &supernode).await;

    let payload = (0..MAX_MESSAGE_BYTES + MAX_MESSAGE_BYTES / 4)
        .map(|idx| (idx % 251) as u8)
        .collect::<Vec<_>>();
    let hash = publisher
        .publish(note(&["bulk"]), &payload, "application/octet-stream")
        .await
        .expect("publish");
    assert_eq!(publisher.offline_queue_len(), 0);

    let record = publisher
        .known_content()
        .await
        .into_iter()
        .find(|record| record.content_hash == hash)
        .expect("own record");
    assert!(record.chunk_hashes.len() > 1);
    assert!(payload.len().div_ceil(record.chunk_hashes.len()) <= MAX_CHUNK_BYTES);

    let retrieved = reader.retrieve(hash.as_str()).await.expect("retrieve");
    assert_eq!(retrieved.data.len(), payload.len());
    assert!(retrieved.data == payload);
}

#[tokio::test]
async fn lone_publish_is_queued_and_served_from_cache() {
    let swarm = Swarm::new();
    let node = swarm.spawn(false).await;

    let hash = node
        .publish(note(&["solo"]), b"hello world", "text/plain")
        .await
        .expect("publish offline");
    let ops = node.offline_operations();
    assert_eq!(ops.len(), 2);
    assert!(matches!(ops[0], OfflineOperation::PublishChunk { .. }));
    assert!(matches!(ops[1], OfflineOperation::AnnounceContent { .. }));

    let again = node
        .publish(note(&["solo"]), b"hello world", "text/plain")
        .await
        .expect("publish twice");
    assert_eq!(again, hash);

    let retrieved = node.retrieve(hash.as_str()).await.expect("cached retrieve");
    assert_eq!(retrieved.data, b"hello world");
    assert!(node.active_peers().is_empty());
    assert_eq!(node.pending_requests(), 0);
}

#[tokio::test]
async fn offline_queue_replays_once_a_peer_connects() {
    let swarm = Swarm::new();
    let publisher = swarm.spawn(false).await;
    let hash = publisher
        .publish(note(&[]), b"queued while alone", "text/plain")
        .await
        .expect("publish offline");
    assert_eq!(publisher.offline_queue_len(), 2);
    let chunk_hash = match &publisher.offline_operations()[0] {
        OfflineOperation::PublishChunk { chunk_hash, .. } => chunk_hash.clone(),
        other => panic!("unexpected operation {other:?}"),
    };

    let supernode_store = MemoryStore::new();
    let supernode = swarm
        .spawn_with(test_config(true), supernode_store.clone())
        .await;
    wait_linked(&publisher, &supernode).await;

    eventually!("offline queue to drain", {
        publisher.offline_queue_len() == 0
    });
    wait_known(&supernode, &hash).await;
    eventually!("replicated chunk", {
        supernode_store
            .get(Partition::ChunkCache, chunk_hash.as_str())
            .await
            .expect("get")
            .is_some()
    });
}

#[tokio::test]
async fn dht_values_route_through_bootstrap_supernode() {
    let swarm = Swarm::new();
    let supernode = swarm.spawn(true).await;
    let client = swarm.spawn(false).await;
    wait_linked(&client, &supernode).await;

    let delivered = client
        .store_dht("greeting", b"hi".to_vec(), 60_000)
        .await
        .expect("store");
    assert_eq!(delivered, 1);
    assert_eq!(
        client.bootstrap_supernode().await.expect("bootstrap"),
        *supernode.local_address()
    );

    eventually!("record on supernode", {
        supernode.find_dht("greeting").await.ok() == Some(b"hi".to_vec())
    });
    assert_eq!(client.find_dht("greeting").await.expect("find"), b"hi");

    let err = client.find_dht("missing").await.expect_err("absent");
    assert_eq!(error_kind(&err), Some(ErrorKind::NotFound));

    let err = client
        .store_dht("big", vec![0u8; MAX_VALUE_SIZE + 1], 60_000)
        .await
        .expect_err("oversized");
    assert_eq!(error_kind(&err), Some(ErrorKind::InputValidation));
}

#[tokio::test]
async fn cleanup_drops_expired_and_republish_keeps_values() {
    let swarm = Swarm::new();
    let supernode = swarm.spawn(true).await;

    supernode
        .store_dht("ephemeral", b"gone".to_vec(), 0)
        .await
        .expect("store ephemeral");
    supernode
        .store_dht("durable", b"kept".to_vec(), 3_600_000)
        .await
        .expect("store durable");

    assert_eq!(supernode.cleanup_dht().await.expect("cleanup"), 1);
    let err = supernode.find_dht("ephemeral").await.expect_err("expired");
    assert_eq!(error_kind(&err), Some(ErrorKind::NotFound));

    assert_eq!(supernode.republish_dht().await.expect("republish"), 1);
    assert_eq!(supernode.find_dht("durable").await.expect("find"), b"kept");
    assert_eq!(supernode.cleanup_dht().await.expect("cleanup"), 0);
}

#[tokio::test]
async fn tampered_chunk_is_rejected_and_not_cached() {
    let swarm = Swarm::new();
    let (rogue, mut incoming) = swarm.scripted_peer("node-badc0ffee0ddf00d-rogue").await;
    swarm.add_supernode(rogue.clone());

    let store = MemoryStore::new();
    let node = swarm.spawn_with(test_config(false), store.clone()).await;
    let channel = accept(&mut incoming).await;

    let suite = Aes256GcmSuite;
    let key = ContentKey::derive(SWARM_SECRET.as_bytes());
    let metadata = note(&[]);
    let hash = content_hash(&suite, &metadata, b"genuine").expect("hash");
    let (chunk_hash, chunk) = chunkify(&suite, &key, b"genuine", 1, "text/plain")
        .expect("chunkify")
        .remove(0);
    let tampered = Chunk {
        data: chunk.data.iter().map(|byte| byte ^ 0xff).collect(),
        ..chunk
    };

    let announce = Message::ContentAnnounce {
        content_hash: hash.clone(),
        metadata,
        chunk_hashes: vec![chunk_hash.clone()],
        peer_address: rogue.clone(),
    };
    channel
        .outbound
        .send(announce.encode().expect("encode"))
        .await
        .expect("send");
    wait_known(&node, &hash).await;

    serve(channel, move |message| match message {
        Message::ChunkRequest {
            correlation_id,
            chunk_hash,
        } => Some(Message::ChunkResponse {
            correlation_id,
            chunk_hash,
            chunk_data: Some(tampered.clone()),
        }),
        _ => None,
    });

    let err = node.retrieve(hash.as_str()).await.expect_err("tampered");
    assert_eq!(error_kind(&err), Some(ErrorKind::Mismatch));
    assert!(
        store
            .get(Partition::ChunkCache, chunk_hash.as_str())
            .await
            .expect("get")
            .is_none()
    );
}

#[tokio::test]
async fn response_for_another_chunk_is_a_mismatch() {
    let swarm = Swarm::new();
    let (rogue, mut incoming) = swarm.scripted_peer("node-0123456789abcdef-cross").await;
    swarm.add_supernode(rogue.clone());
    let node = swarm.spawn(false).await;
    let channel = accept(&mut incoming).await;

    let wanted = ChunkHash::from_digest(&[1u8; 32]);
    let other = ChunkHash::from_digest(&[2u8; 32]);
    let hash = ContentHash::from_digest(&[9u8; 32]);
    let announce = Message::ContentAnnounce {
        content_hash: hash.clone(),
        metadata: note(&[]),
        chunk_hashes: vec![wanted],
        peer_address: rogue,
    };
    channel
        .outbound
        .send(announce.encode().expect("encode"))
        .await
        .expect("send");
    wait_known(&node, &hash).await;

    serve(channel, move |message| match message {
        Message::ChunkRequest { correlation_id, .. } => Some(Message::ChunkResponse {
            correlation_id,
            chunk_hash: other.clone(),
            chunk_data: None,
        }),
        _ => None,
    });

    let err = node.retrieve(hash.as_str()).await.expect_err("cross talk");
    assert_eq!(error_kind(&err), Some(ErrorKind::Mismatch));
    assert_eq!(node.pending_requests(), 0);
}

#[tokio::test]
async fn silent_peer_times_out_without_leaking() {
    let swarm = Swarm::new();
    let (rogue, mut incoming) = swarm.scripted_peer("node-feedfacecafebeef-quiet").await;
    swarm.add_supernode(rogue.clone());
    let node = swarm.spawn(false).await;
    let channel = accept(&mut incoming).await;
    serve(channel, |_| None);

    let err = node.ping(&rogue).await.expect_err("no pong");
    assert_eq!(error_kind(&err), Some(ErrorKind::Timeout));
    assert_eq!(node.pending_requests(), 0);
    assert_eq!(node.sample_latency().await.expect("sample"), 0.0);
}

#[tokio::test]
async fn unknown_message_types_are_dropped() {
    let swarm = Swarm::new();
    let (rogue, mut incoming) = swarm.scripted_peer("node-00000000deadbeef-odd00").await;
    swarm.add_supernode(rogue.clone());
    let node = swarm.spawn(false).await;
    let mut channel = accept(&mut incoming).await;

    let mystery = crate::cbor::to_vec(&crate::cbor::Value::Map(vec![(
        crate::cbor::Value::Text("type".into()),
        crate::cbor::Value::Text("mystery".into()),
    )]))
    .expect("encode");
    channel.outbound.send(mystery).await.expect("send");
    let ping = Message::Ping {
        correlation_id: "probe-1".into(),
    };
    channel
        .outbound
        .send(ping.encode().expect("encode"))
        .await
        .expect("send");

    let pong = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match channel.inbound.recv().await {
                Some(ChannelEvent::Data(bytes)) => {
                    if let Ok(message @ Message::Pong { .. }) = Message::decode(&bytes) {
                        return message;
                    }
                }
                other => panic!("channel ended: {other:?}"),
            }
        }
    })
    .await
    .expect("pong in time");
    assert_eq!(
        pong,
        Message::Pong {
            correlation_id: "probe-1".into()
        }
    );
    assert!(node.active_peers().contains(&rogue));
}

#[tokio::test]
async fn purchase_splits_commission_and_debits_buyer() {
    let swarm = Swarm::new();
    let supernode = swarm.spawn(true).await;
    let publisher = swarm.spawn(false).await;
    let buyer = swarm.spawn(false).await;
    wait_linked(&publisher, &supernode).await;
    wait_linked(&buyer, &supernode).await;

    let premium = ContentMetadata {
        premium: true,
        ..note(&["paid"])
    };
    let paid = publisher
        .publish(premium, b"premium bytes", "application/octet-stream")
        .await
        .expect("publish premium");
    let free = publisher
        .publish(note(&["free"]), b"free bytes", "text/plain")
        .await
        .expect("publish free");
    wait_known(&supernode, &paid).await;
    wait_known(&supernode, &free).await;

    assert_eq!(buyer.deposit(50.0).await.expect("deposit"), 50.0);
    let bought = buyer.purchase(paid.as_str()).await.expect("purchase");
    assert_eq!(bought.data, b"premium bytes");
    assert_eq!(bought.record.metadata.price, Some(30.0));
    assert_eq!(buyer.own_balance().await.expect("balance"), 20.0);
    assert_eq!(
        buyer
            .get_balance(supernode.ledger_identity())
            .await
            .expect("commission"),
        1.5
    );

    let err = buyer.purchase(paid.as_str()).await.expect_err("short");
    assert_eq!(error_kind(&err), Some(ErrorKind::InputValidation));
    assert!(err.to_string().contains("insufficient balance"));
    assert_eq!(buyer.own_balance().await.expect("balance"), 20.0);

    let gift = buyer.purchase(free.as_str()).await.expect("free purchase");
    assert_eq!(gift.data, b"free bytes");
    assert_eq!(buyer.own_balance().await.expect("balance"), 20.0);

    let log = buyer.transactions().await.expect("log");
    let kinds = log.iter().map(|tx| tx.kind).collect::<Vec<_>>();
    assert_eq!(
        kinds,
        vec![
            TransactionKind::Deposit,
            TransactionKind::Commission,
            TransactionKind::Buy,
            TransactionKind::Buy,
        ]
    );
    assert_eq!(log[2].amount, 30.0);
    assert_eq!(log[3].amount, 0.0);
}

struct FailingStore {
    inner: Arc<MemoryStore>,
    fail_writes: AtomicBool,
    fail_reads: AtomicBool,
}

impl FailingStore {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: MemoryStore::new(),
            fail_writes: AtomicBool::new(false),
            fail_reads: AtomicBool::new(false),
        })
    }

    fn check(&self) -> anyhow::Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(NodeError::Storage("disk full".into()).into());
        }
        Ok(())
    }

    fn check_read(&self) -> anyhow::Result<()> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(NodeError::Storage("read error".into()).into());
        }
        Ok(())
    }
}

#[async_trait]
impl Store for FailingStore {
    async fn get(&self, partition: Partition, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        self.check_read()?;
        self.inner.get(partition, key).await
    }

    async fn put(&self, partition: Partition, key: &str, value: Vec<u8>) -> anyhow::Result<()> {
        self.check()?;
        self.inner.put(partition, key, value).await
    }

    async fn add(&self, partition: Partition, value: Vec<u8>) -> anyhow::Result<u64> {
        self.check()?;
        self.inner.add(partition, value).await
    }

    async fn get_all(&self, partition: Partition) -> anyhow::Result<Vec<(String, Vec<u8>)>> {
        self.check_read()?;
        self.inner.get_all(partition).await
    }

    async fn delete(&self, partition: Partition, key: &str) -> anyhow::Result<()> {
        self.check()?;
        self.inner.delete(partition, key).await
    }

    async fn clear(&self, partition: Partition) -> anyhow::Result<()> {
        self.check()?;
        self.inner.clear(partition).await
    }
}

#[tokio::test]
async fn storage_failures_reach_the_caller() {
    let swarm = Swarm::new();
    let store = FailingStore::new();
    let node = swarm.spawn_with(test_config(false), store.clone()).await;

    store.fail_writes.store(true, Ordering::SeqCst);
    let err = node
        .publish(note(&[]), b"never stored", "text/plain")
        .await
        .expect_err("store down");
    assert_eq!(error_kind(&err), Some(ErrorKind::Storage));
    let err = node.deposit(5.0).await.expect_err("store down");
    assert_eq!(error_kind(&err), Some(ErrorKind::Storage));
    assert_eq!(node.offline_queue_len(), 0);
}

#[tokio::test]
async fn restart_restores_identity_queue_and_catalog() {
    let swarm = Swarm::new();
    let store = MemoryStore::new();
    let first = swarm.spawn_with(test_config(false), store.clone()).await;
    let hash = first
        .publish(note(&[]), b"persisted", "text/plain")
        .await
        .expect("publish");
    let identity = first.ledger_identity().to_string();
    first.shutdown();

    let second = swarm.spawn_with(test_config(false), store).await;
    assert_eq!(second.ledger_identity(), identity);
    assert_eq!(second.offline_queue_len(), 2);
    assert!(
        second
            .known_content()
            .await
            .iter()
            .any(|record| record.content_hash == hash)
    );
    assert_eq!(
        second.retrieve(hash.as_str()).await.expect("retrieve").data,
        b"persisted"
    );
}

#[tokio::test]
async fn bootstrap_selection_needs_a_connected_supernode() {
    let swarm = Swarm::new();
    let loner = swarm.spawn(false).await;
    let err = loner.select_bootstrap().await.expect_err("nobody around");
    assert_eq!(error_kind(&err), Some(ErrorKind::Unavailable));

    let first = swarm.spawn(true).await;
    let second = swarm.spawn(true).await;
    let client = swarm.spawn(false).await;
    wait_linked(&client, &first).await;
    wait_linked(&client, &second).await;

    let chosen = client.select_bootstrap().await.expect("bootstrap");
    assert!(chosen == *first.local_address() || chosen == *second.local_address());
    assert!(client.sample_latency().await.expect("sample") >= 0.0);
    eventually!("peer exchange", {
        client.known_supernodes().await.len() == 2
    });
}

#[tokio::test]
async fn routing_refresh_dials_newly_learned_supernodes() {
    let swarm = Swarm::new();
    let (router, mut router_incoming) = swarm.scripted_peer("node-1111222233334444-route").await;
    let (fresh, mut fresh_incoming) = swarm.scripted_peer("node-5555666677778888-fresh").await;
    swarm.add_supernode(router.clone());

    let node = swarm.spawn(true).await;
    let channel = accept(&mut router_incoming).await;
    let learned = fresh.clone();
    serve(channel, move |message| match message {
        Message::FindDht {
            correlation_id,
            key,
        } => Some(Message::FindDhtResponse {
            correlation_id,
            key,
            value: None,
            closest_peers: vec![learned.clone()],
        }),
        _ => None,
    });

    eventually!("refresh to learn a supernode", {
        node.refresh_routing_table().await.expect("refresh") == 1
    });
    let dialed = accept(&mut fresh_incoming).await;
    assert_eq!(dialed.remote, *node.local_address());

    let client = swarm.spawn(false).await;
    assert_eq!(client.refresh_routing_table().await.expect("regular peer"), 0);
}

#[tokio::test]
async fn unreadable_chunk_cache_answers_without_data() {
    let swarm = Swarm::new();
    let (asker, mut incoming) = swarm.scripted_peer("node-99990000aaaabbbb-asker").await;
    swarm.add_supernode(asker.clone());
    let store = FailingStore::new();
    let _node = swarm.spawn_with(test_config(false), store.clone()).await;
    let mut channel = accept(&mut incoming).await;
    store.fail_reads.store(true, Ordering::SeqCst);

    let wanted = ChunkHash::from_digest(&[4u8; 32]);
    let request = Message::ChunkRequest {
        correlation_id: "fetch-1".into(),
        chunk_hash: wanted.clone(),
    };
    channel
        .outbound
        .send(request.encode().expect("encode"))
        .await
        .expect("send");

    let response = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match channel.inbound.recv().await {
                Some(ChannelEvent::Data(bytes)) => {
                    if let Ok(message @ Message::ChunkResponse { .. }) = Message::decode(&bytes) {
                        return message;
                    }
                }
                other => panic!("channel ended: {other:?}"),
            }
        }
    })
    .await
    .expect("response in time");
    assert_eq!(
        response,
        Message::ChunkResponse {
            correlation_id: "fetch-1".into(),
            chunk_hash: wanted,
            chunk_data: None,
        }
    );
}

#[tokio::test]
async fn malformed_hashes_are_rejected_up_front() {
    let swarm = Swarm::new();
    let node = swarm.spawn(false).await;
    let err = node.retrieve("not a hash").await.expect_err("invalid");
    assert_eq!(error_kind(&err), Some(ErrorKind::InputValidation));
    let err = node
        .retrieve(ContentHash::from_digest(&[7u8; 32]).as_str())
        .await
        .expect_err("unknown");
    assert_eq!(error_kind(&err), Some(ErrorKind::NotFound));
}
