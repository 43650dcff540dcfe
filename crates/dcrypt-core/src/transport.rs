// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! Point-to-point channel substrate.
//!
//! A [`Channel`] is a reliable, ordered, bidirectional byte pipe to one
//! peer. Dropping the outbound sender closes the channel; the remote then
//! observes [`ChannelEvent::Closed`].

use std::{
    collections::{HashMap, HashSet},
    net::SocketAddr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
};

use anyhow::Context;
use async_trait::async_trait;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::mpsc,
};
use tracing::{debug, warn};

use crate::{error::NodeError, peer::PeerAddr, wire::MAX_MESSAGE_BYTES};

const CHANNEL_BUFFER: usize = 256;
const ADDRESS_FRAME_MAX_BYTES: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Data(Vec<u8>),
    Closed,
    Error(String),
}

#[derive(Debug)]
pub struct Channel {
    pub remote: PeerAddr,
    pub outbound: mpsc::Sender<Vec<u8>>,
    pub inbound: mpsc::Receiver<ChannelEvent>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Whether the substrate can currently create channels at all.
    fn is_available(&self) -> bool;

    async fn dial(&self, local: &PeerAddr, remote: &PeerAddr) -> anyhow::Result<Channel>;

    /// Start accepting channels addressed to `local`.
    async fn listen(&self, local: &PeerAddr) -> anyhow::Result<mpsc::Receiver<Channel>>;
}

/// Forward raw bytes from one side's sender as data events to the other
/// side, then signal close once the sender is dropped.
fn spawn_pump(mut from: mpsc::Receiver<Vec<u8>>, to: mpsc::Sender<ChannelEvent>) {
    tokio::spawn(async move {
        while let Some(bytes) = from.recv().await {
            if to.send(ChannelEvent::Data(bytes)).await.is_err() {
                return;
            }
        }
        let _ = to.send(ChannelEvent::Closed).await;
    });
}

#[derive(Default)]
struct MemoryNetworkInner {
    listeners: HashMap<PeerAddr, mpsc::Sender<Channel>>,
    unreachable: HashSet<PeerAddr>,
}

/// In-process hub connecting any number of [`MemoryTransport`]s.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<Mutex<MemoryNetworkInner>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transport(&self) -> Arc<MemoryTransport> {
        Arc::new(MemoryTransport {
            network: self.clone(),
            available: Arc::new(AtomicBool::new(true)),
        })
    }

    /// Make dials to `addr` fail until [`MemoryNetwork::set_reachable`] is
    /// called with `true`.
    pub fn set_reachable(&self, addr: &PeerAddr, reachable: bool) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        if reachable {
            inner.unreachable.remove(addr);
        } else {
            inner.unreachable.insert(addr.clone());
        }
    }

    fn listener_for(&self, addr: &PeerAddr) -> Result<mpsc::Sender<Channel>, NodeError> {
        let inner = self
            .inner
            .lock()
            .map_err(|_| NodeError::Network("memory network poisoned".into()))?;
        if inner.unreachable.contains(addr) {
            return Err(NodeError::Network(format!("{addr} is unreachable")));
        }
        inner
            .listeners
            .get(addr)
            .cloned()
            .ok_or_else(|| NodeError::Network(format!("no listener at {addr}")))
    }
}

pub struct MemoryTransport {
    network: MemoryNetwork,
    available: Arc<AtomicBool>,
}

impl MemoryTransport {
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    async fn dial(&self, local: &PeerAddr, remote: &PeerAddr) -> anyhow::Result<Channel> {
        if !self.is_available() {
            return Err(NodeError::unavailable("memory transport is offline").into());
        }
        let listener = self.network.listener_for(remote)?;

        let (local_out_tx, local_out_rx) = mpsc::channel(CHANNEL_BUFFER);
        let (remote_out_tx, remote_out_rx) = mpsc::channel(CHANNEL_BUFFER);
        let (local_in_tx, local_in_rx) = mpsc::channel(CHANNEL_BUFFER);
        let (remote_in_tx, remote_in_rx) = mpsc::channel(CHANNEL_BUFFER);
        spawn_pump(local_out_rx, remote_in_tx);
        spawn_pump(remote_out_rx, local_in_tx);

        listener
            .send(Channel {
                remote: local.clone(),
                outbound: remote_out_tx,
                inbound: remote_in_rx,
            })
            .await
            .map_err(|_| NodeError::Network(format!("{remote} stopped listening")))?;

        Ok(Channel {
            remote: remote.clone(),
            outbound: local_out_tx,
            inbound: local_in_rx,
        })
    }

    async fn listen(&self, local: &PeerAddr) -> anyhow::Result<mpsc::Receiver<Channel>> {
        let (tx, rx) = mpsc::channel(CHANNEL_BUFFER);
        let mut inner = self
            .network
            .inner
            .lock()
            .map_err(|_| NodeError::Network("memory network poisoned".into()))?;
        inner.listeners.insert(local.clone(), tx);
        Ok(rx)
    }
}

/// Length-prefixed frames over TCP. The dialer's first frame carries its
/// peer address; socket addresses come from a static address book.
pub struct TcpTransport {
    bind: Option<SocketAddr>,
    address_book: HashMap<PeerAddr, SocketAddr>,
}

impl TcpTransport {
    pub fn new(bind: Option<SocketAddr>, address_book: HashMap<PeerAddr, SocketAddr>) -> Self {
        Self { bind, address_book }
    }

    fn wrap_stream(stream: TcpStream, remote: PeerAddr) -> Channel {
        let (mut reader, mut writer) = stream.into_split();
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(CHANNEL_BUFFER);
        let (in_tx, in_rx) = mpsc::channel(CHANNEL_BUFFER);

        tokio::spawn(async move {
            while let Some(bytes) = out_rx.recv().await {
                if let Err(err) = write_frame(&mut writer, &bytes).await {
                    debug!(error = %err, "tcp write failed");
                    return;
                }
            }
            let _ = writer.shutdown().await;
        });

        tokio::spawn(async move {
            loop {
                match read_frame(&mut reader, MAX_MESSAGE_BYTES).await {
                    Ok(bytes) => {
                        if in_tx.send(ChannelEvent::Data(bytes)).await.is_err() {
                            return;
                        }
                    }
                    Err(err) => {
                        let eof = err
                            .downcast_ref::<std::io::Error>()
                            .is_some_and(|io| io.kind() == std::io::ErrorKind::UnexpectedEof);
                        let event = if eof {
                            ChannelEvent::Closed
                        } else {
                            ChannelEvent::Error(err.to_string())
                        };
                        let _ = in_tx.send(event).await;
                        return;
                    }
                }
            }
        });

        Channel {
            remote,
            outbound: out_tx,
            inbound: in_rx,
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn is_available(&self) -> bool {
        true
    }

    async fn dial(&self, local: &PeerAddr, remote: &PeerAddr) -> anyhow::Result<Channel> {
        let socket = self
            .address_book
            .get(remote)
            .copied()
            .ok_or_else(|| NodeError::Network(format!("no socket address known for {remote}")))?;
        let mut stream = TcpStream::connect(socket)
            .await
            .map_err(|err| NodeError::Network(format!("connect {socket}: {err}")))?;
        write_frame(&mut stream, local.as_str().as_bytes()).await?;
        Ok(Self::wrap_stream(stream, remote.clone()))
    }

    async fn listen(&self, local: &PeerAddr) -> anyhow::Result<mpsc::Receiver<Channel>> {
        let bind = self
            .bind
            .ok_or_else(|| NodeError::unavailable("tcp transport has no bind address"))?;
        let listener = TcpListener::bind(bind)
            .await
            .with_context(|| format!("bind {bind}"))?;
        let (tx, rx) = mpsc::channel(CHANNEL_BUFFER);
        let local = local.clone();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, socket)) = listener.accept().await else {
                    continue;
                };
                let remote = match read_frame(&mut stream, ADDRESS_FRAME_MAX_BYTES).await {
                    Ok(bytes) => match String::from_utf8(bytes) {
                        Ok(addr) => PeerAddr::new(addr),
                        Err(_) => {
                            warn!(%socket, "peer sent a non-utf8 address frame");
                            continue;
                        }
                    },
                    Err(err) => {
                        warn!(%socket, error = %err, "peer did not identify itself");
                        continue;
                    }
                };
                debug!(%local, %remote, %socket, "accepted tcp channel");
                if tx.send(Self::wrap_stream(stream, remote)).await.is_err() {
                    return;
                }
            }
        });
        Ok(rx)
    }
}

/// Write a length-prefixed frame: 4-byte big-endian length, then payload.
pub async fn write_frame<S>(io: &mut S, data: &[u8]) -> anyhow::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let len = u32::try_from(data.len()).context("frame too large for u32 length prefix")?;
    io.write_u32(len).await?;
    io.write_all(data).await?;
    io.flush().await?;
    Ok(())
}

/// Read a length-prefixed frame, rejecting lengths above `max_len`.
pub async fn read_frame<S>(io: &mut S, max_len: usize) -> anyhow::Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let len = io.read_u32().await? as usize;
    if len > max_len {
        anyhow::bail!("frame exceeds max size");
    }
    let mut data = vec![0u8; len];
    io.read_exact(&mut data).await?;
    Ok(data)
}
