// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! Connection lifecycle for the peer overlay.
//!
//! [`PeerManager`] owns every live channel. Incoming frames are decoded
//! and forwarded as [`PeerEvent`]s to the node's event loop; nothing here
//! interprets message contents beyond the handshake.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{
    error::NodeError,
    now_unix_ms,
    peer::{Direction, PeerAddr, PeerState},
    peer_db::{PeerDb, PeerRecord},
    transport::{Channel, ChannelEvent, Transport},
    wire::Message,
};

#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    Connected {
        peer: PeerAddr,
        direction: Direction,
        /// No other peer was connected before this one.
        first_active: bool,
    },
    Message {
        peer: PeerAddr,
        message: Message,
    },
    Disconnected {
        peer: PeerAddr,
    },
}

#[derive(Debug, Clone, Copy)]
pub struct ConnectionPolicy {
    pub max_peers: usize,
    pub max_attempts: u32,
    pub retry_base: Duration,
}

struct Link {
    outbound: mpsc::Sender<Vec<u8>>,
    generation: u64,
}

#[derive(Default)]
struct PeerTable {
    db: PeerDb,
    links: HashMap<PeerAddr, Link>,
    next_generation: u64,
}

struct Inner {
    local: PeerAddr,
    transport: Arc<dyn Transport>,
    policy: ConnectionPolicy,
    table: Mutex<PeerTable>,
    events: mpsc::Sender<PeerEvent>,
}

#[derive(Clone)]
pub struct PeerManager {
    inner: Arc<Inner>,
}

impl PeerManager {
    pub fn new(
        local: PeerAddr,
        transport: Arc<dyn Transport>,
        policy: ConnectionPolicy,
        events: mpsc::Sender<PeerEvent>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                local,
                transport,
                policy,
                table: Mutex::new(PeerTable::default()),
                events,
            }),
        }
    }

    fn table(&self) -> Result<MutexGuard<'_, PeerTable>, NodeError> {
        self.inner
            .table
            .lock()
            .map_err(|_| NodeError::unavailable("peer table lock poisoned"))
    }

    /// Track every previously unknown candidate and start connecting to it.
    /// Returns how many peers were new.
    pub fn discover(&self, candidates: impl IntoIterator<Item = PeerAddr>) -> usize {
        let now = now_unix_ms();
        let mut fresh = Vec::new();
        {
            let Ok(mut table) = self.table() else {
                return 0;
            };
            for addr in candidates {
                if addr == self.inner.local {
                    continue;
                }
                if table.db.upsert_discovered(addr.clone(), now) {
                    fresh.push(addr);
                }
            }
            let evicted = table.db.evict_over_capacity(self.inner.policy.max_peers);
            if !evicted.is_empty() {
                debug!(count = evicted.len(), "evicted peers over capacity");
                fresh.retain(|addr| !evicted.contains(addr));
            }
        }
        for addr in &fresh {
            debug!(peer = %addr, "discovered peer");
            self.schedule_connect(addr.clone(), 1, Duration::ZERO);
        }
        fresh.len()
    }

    /// Connect after `delay` on a detached task.
    pub fn schedule_connect(&self, addr: PeerAddr, attempt: u32, delay: Duration) {
        let manager = self.clone();
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if let Err(err) = manager.connect(addr.clone(), attempt).await {
                debug!(peer = %addr, error = %err, "connect attempt failed");
            }
        });
    }

    pub async fn connect(&self, addr: PeerAddr, attempt: u32) -> anyhow::Result<()> {
        {
            let mut table = self.table()?;
            let Some(record) = table.db.get(&addr) else {
                // Removed or evicted meanwhile; rediscovery starts over.
                return Ok(());
            };
            if record.state == PeerState::Connected && table.links.contains_key(&addr) {
                return Ok(());
            }
            if !self.inner.transport.is_available() {
                drop(table);
                let delay = self.inner.policy.retry_base * attempt.max(1);
                debug!(peer = %addr, ?delay, "transport unavailable, retry scheduled");
                self.schedule_connect(addr, attempt, delay);
                return Ok(());
            }
            table.db.set_state(&addr, PeerState::Connecting);
        }

        match self.inner.transport.dial(&self.inner.local, &addr).await {
            Ok(channel) => {
                self.attach(channel, Direction::Outbound).await;
                Ok(())
            }
            Err(err) => {
                self.handle_failure(&addr);
                Err(err)
            }
        }
    }

    /// Count a failure; retry with linear backoff below the cap, otherwise
    /// forget the peer.
    fn handle_failure(&self, addr: &PeerAddr) {
        let attempts = {
            let Ok(mut table) = self.table() else {
                return;
            };
            let attempts = table.db.record_failure(addr);
            if attempts >= self.inner.policy.max_attempts {
                table.db.remove(addr);
                table.links.remove(addr);
            }
            attempts
        };
        if attempts == 0 {
            return;
        }
        if attempts >= self.inner.policy.max_attempts {
            warn!(peer = %addr, attempts, "giving up on peer");
            return;
        }
        let delay = self.inner.policy.retry_base * attempts;
        debug!(peer = %addr, attempts, ?delay, "retrying peer");
        self.schedule_connect(addr.clone(), attempts + 1, delay);
    }

    /// Accept an unsolicited channel. The remote sends its own handshake.
    pub async fn handle_inbound(&self, channel: Channel) {
        if channel.remote == self.inner.local {
            return;
        }
        self.attach(channel, Direction::Inbound).await;
    }

    /// Install `channel` as the peer's link. When both sides dialed each
    /// other, the channel opened by the lower address wins on both ends.
    async fn attach(&self, channel: Channel, direction: Direction) {
        let Channel {
            remote,
            outbound,
            inbound,
        } = channel;

        let (generation, first_active) = {
            let Ok(mut table) = self.table() else {
                return;
            };
            if table.links.contains_key(&remote) {
                let dialer = match direction {
                    Direction::Outbound => &self.inner.local,
                    Direction::Inbound => &remote,
                };
                let other = match direction {
                    Direction::Outbound => &remote,
                    Direction::Inbound => &self.inner.local,
                };
                if dialer > other {
                    debug!(peer = %remote, "dropping duplicate channel");
                    table.db.mark_connected(&remote, now_unix_ms());
                    return;
                }
            }
            table.next_generation += 1;
            let generation = table.next_generation;
            let first_active = table.links.is_empty();
            table.links.insert(
                remote.clone(),
                Link {
                    outbound: outbound.clone(),
                    generation,
                },
            );
            table.db.mark_connected(&remote, now_unix_ms());
            (generation, first_active)
        };

        info!(peer = %remote, ?direction, "peer connected");
        let _ = self
            .inner
            .events
            .send(PeerEvent::Connected {
                peer: remote.clone(),
                direction,
                first_active,
            })
            .await;
        self.spawn_reader(remote, inbound, generation);

        if direction == Direction::Outbound {
            let handshake = Message::Handshake {
                peer_address: self.inner.local.clone(),
            };
            if let Ok(bytes) = handshake.encode() {
                let _ = outbound.send(bytes).await;
            }
        }
    }

    fn spawn_reader(
        &self,
        remote: PeerAddr,
        mut inbound: mpsc::Receiver<ChannelEvent>,
        generation: u64,
    ) {
        let manager = self.clone();
        tokio::spawn(async move {
            let reason = loop {
                match inbound.recv().await {
                    Some(ChannelEvent::Data(bytes)) => match Message::decode(&bytes) {
                        Ok(message) => {
                            let event = PeerEvent::Message {
                                peer: remote.clone(),
                                message,
                            };
                            if manager.inner.events.send(event).await.is_err() {
                                return;
                            }
                        }
                        Err(err) => warn!(peer = %remote, error = %err, "undecodable frame"),
                    },
                    Some(ChannelEvent::Error(err)) => break err,
                    Some(ChannelEvent::Closed) | None => break "closed".to_string(),
                }
            };
            manager.on_channel_closed(&remote, generation, &reason).await;
        });
    }

    async fn on_channel_closed(&self, remote: &PeerAddr, generation: u64, reason: &str) {
        {
            let Ok(mut table) = self.table() else {
                return;
            };
            let current = table
                .links
                .get(remote)
                .is_some_and(|link| link.generation == generation);
            if !current {
                return;
            }
            table.links.remove(remote);
        }
        info!(peer = %remote, reason, "peer channel closed");
        let _ = self
            .inner
            .events
            .send(PeerEvent::Disconnected {
                peer: remote.clone(),
            })
            .await;
        self.handle_failure(remote);
    }

    pub async fn send(&self, addr: &PeerAddr, message: &Message) -> anyhow::Result<()> {
        let sender = {
            let table = self.table()?;
            table
                .links
                .get(addr)
                .map(|link| link.outbound.clone())
                .ok_or_else(|| NodeError::unavailable(format!("no open channel to {addr}")))?
        };
        let bytes = message.encode()?;
        sender
            .send(bytes)
            .await
            .map_err(|_| NodeError::Network(format!("channel to {addr} is closed")))?;
        Ok(())
    }

    /// Send to every connected peer; returns how many sends succeeded.
    pub async fn broadcast(&self, message: &Message) -> usize {
        let mut delivered = 0;
        for addr in self.active_peers() {
            match self.send(&addr, message).await {
                Ok(()) => delivered += 1,
                Err(err) => debug!(peer = %addr, error = %err, "broadcast send failed"),
            }
        }
        delivered
    }

    pub fn active_peers(&self) -> Vec<PeerAddr> {
        let Ok(table) = self.table() else {
            return vec![];
        };
        let mut peers = table
            .links
            .keys()
            .filter(|addr| **addr != self.inner.local)
            .cloned()
            .collect::<Vec<_>>();
        peers.sort();
        peers
    }

    pub fn active_supernodes(&self) -> Vec<PeerAddr> {
        self.active_peers()
            .into_iter()
            .filter(PeerAddr::is_supernode)
            .collect()
    }

    pub fn is_connected(&self, addr: &PeerAddr) -> bool {
        self.table()
            .map(|table| table.links.contains_key(addr))
            .unwrap_or(false)
    }

    pub fn peer_record(&self, addr: &PeerAddr) -> Option<PeerRecord> {
        self.table().ok()?.db.get(addr).cloned()
    }

    pub fn known_peers(&self, max: usize) -> Vec<PeerAddr> {
        self.table()
            .map(|table| table.db.sample(max))
            .unwrap_or_default()
    }

    /// Close every channel and forget all peers.
    pub fn shutdown(&self) {
        if let Ok(mut table) = self.table() {
            table.links.clear();
            table.db = PeerDb::default();
        }
    }
}
