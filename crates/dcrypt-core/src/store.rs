// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use chacha20poly1305::{
    Key, XChaCha20Poly1305, XNonce,
    aead::{Aead, KeyInit},
};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::NodeError;

const KEY_KDF_ITERATIONS: u32 = 120_000;

/// Bump when making schema changes; migrations are applied in order.
const CURRENT_SCHEMA_VERSION: u32 = 1;

/// Named key-value partitions of the local store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Partition {
    Identity,
    Balances,
    Transactions,
    OfflineQueue,
    ChunkCache,
    DhtRecords,
    Content,
}

impl Partition {
    pub const ALL: [Self; 7] = [
        Self::Identity,
        Self::Balances,
        Self::Transactions,
        Self::OfflineQueue,
        Self::ChunkCache,
        Self::DhtRecords,
        Self::Content,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Identity => "identity",
            Self::Balances => "balances",
            Self::Transactions => "transactions",
            Self::OfflineQueue => "offline_queue",
            Self::ChunkCache => "chunk_cache",
            Self::DhtRecords => "dht_records",
            Self::Content => "content",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedSecret {
    pub salt: [u8; 16],
    pub nonce: [u8; 24],
    pub ciphertext: Vec<u8>,
}

/// Durable key-value store over named partitions.
///
/// `get_all` returns entries in insertion order; overwriting a key with
/// `put` keeps its original position. `add` appends under a generated,
/// monotonically increasing key and returns the sequence number used.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get(&self, partition: Partition, key: &str) -> anyhow::Result<Option<Vec<u8>>>;
    async fn put(&self, partition: Partition, key: &str, value: Vec<u8>) -> anyhow::Result<()>;
    async fn add(&self, partition: Partition, value: Vec<u8>) -> anyhow::Result<u64>;
    async fn get_all(&self, partition: Partition) -> anyhow::Result<Vec<(String, Vec<u8>)>>;
    async fn delete(&self, partition: Partition, key: &str) -> anyhow::Result<()>;
    async fn clear(&self, partition: Partition) -> anyhow::Result<()>;
}

fn sequence_key(seq: u64) -> String {
    format!("{seq:020}")
}

#[derive(Default)]
struct MemoryPartition {
    next_seq: u64,
    entries: HashMap<String, (u64, Vec<u8>)>,
}

#[derive(Default)]
pub struct MemoryStore {
    partitions: RwLock<HashMap<Partition, MemoryPartition>>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, partition: Partition, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        let partitions = self.partitions.read().await;
        Ok(partitions
            .get(&partition)
            .and_then(|p| p.entries.get(key))
            .map(|(_, value)| value.clone()))
    }

    async fn put(&self, partition: Partition, key: &str, value: Vec<u8>) -> anyhow::Result<()> {
        let mut partitions = self.partitions.write().await;
        let part = partitions.entry(partition).or_default();
        let seq = match part.entries.get(key) {
            Some((seq, _)) => *seq,
            None => {
                part.next_seq += 1;
                part.next_seq
            }
        };
        part.entries.insert(key.to_string(), (seq, value));
        Ok(())
    }

    async fn add(&self, partition: Partition, value: Vec<u8>) -> anyhow::Result<u64> {
        let mut partitions = self.partitions.write().await;
        let part = partitions.entry(partition).or_default();
        part.next_seq += 1;
        let seq = part.next_seq;
        part.entries.insert(sequence_key(seq), (seq, value));
        Ok(seq)
    }

    async fn get_all(&self, partition: Partition) -> anyhow::Result<Vec<(String, Vec<u8>)>> {
        let partitions = self.partitions.read().await;
        let Some(part) = partitions.get(&partition) else {
            return Ok(vec![]);
        };
        let mut entries = part
            .entries
            .iter()
            .map(|(key, (seq, value))| (*seq, key.clone(), value.clone()))
            .collect::<Vec<_>>();
        entries.sort_by_key(|(seq, _, _)| *seq);
        Ok(entries
            .into_iter()
            .map(|(_, key, value)| (key, value))
            .collect())
    }

    async fn delete(&self, partition: Partition, key: &str) -> anyhow::Result<()> {
        let mut partitions = self.partitions.write().await;
        if let Some(part) = partitions.get_mut(&partition) {
            part.entries.remove(key);
        }
        Ok(())
    }

    async fn clear(&self, partition: Partition) -> anyhow::Result<()> {
        let mut partitions = self.partitions.write().await;
        if let Some(part) = partitions.get_mut(&partition) {
            part.entries.clear();
        }
        Ok(())
    }
}

pub struct SqliteStore {
    path: PathBuf,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Arc<Self>> {
        let store = Arc::new(Self {
            path: path.as_ref().to_path_buf(),
        });
        store.ensure_schema()?;
        Ok(store)
    }

    fn open_connection(path: &Path) -> anyhow::Result<Connection> {
        Ok(Connection::open(path)?)
    }

    fn ensure_schema(&self) -> anyhow::Result<()> {
        let conn = Self::open_connection(&self.path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS records (
                partition TEXT NOT NULL,
                key TEXT NOT NULL,
                seq INTEGER NOT NULL,
                payload BLOB NOT NULL,
                PRIMARY KEY (partition, key)
            );
            CREATE INDEX IF NOT EXISTS records_by_seq ON records(partition, seq);
            CREATE TABLE IF NOT EXISTS metadata (
                key TEXT PRIMARY KEY,
                payload BLOB NOT NULL
            );",
        )?;

        let current_version: u32 = conn
            .query_row(
                "SELECT payload FROM metadata WHERE key = 'schema_version'",
                [],
                |row| {
                    let blob: Vec<u8> = row.get(0)?;
                    Ok(u32::from_le_bytes(blob.try_into().unwrap_or([0, 0, 0, 0])))
                },
            )
            .optional()?
            .unwrap_or(0);

        if current_version != CURRENT_SCHEMA_VERSION {
            conn.execute(
                "INSERT INTO metadata(key, payload) VALUES('schema_version', ?1)
                 ON CONFLICT(key) DO UPDATE SET payload = excluded.payload",
                params![CURRENT_SCHEMA_VERSION.to_le_bytes().to_vec()],
            )?;
        }
        Ok(())
    }

    /// Run `op` against a fresh connection on a blocking thread.
    async fn with_connection<T, F>(&self, op: F) -> anyhow::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> anyhow::Result<T> + Send + 'static,
    {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = Self::open_connection(&path)?;
            op(&mut conn)
        })
        .await?
        .map_err(|err| NodeError::Storage(format!("{err:#}")).into())
    }
}

fn next_seq(conn: &Connection, partition: &str) -> anyhow::Result<u64> {
    let max: Option<i64> = conn.query_row(
        "SELECT MAX(seq) FROM records WHERE partition = ?1",
        params![partition],
        |row| row.get(0),
    )?;
    Ok(max.map(|m| m as u64 + 1).unwrap_or(1))
}

#[async_trait]
impl Store for SqliteStore {
    async fn get(&self, partition: Partition, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        let key = key.to_string();
        self.with_connection(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT payload FROM records WHERE partition = ?1 AND key = ?2",
                    params![partition.name(), key],
                    |row| row.get::<_, Vec<u8>>(0),
                )
                .optional()?)
        })
        .await
    }

    async fn put(&self, partition: Partition, key: &str, value: Vec<u8>) -> anyhow::Result<()> {
        let key = key.to_string();
        self.with_connection(move |conn| {
            let tx = conn.transaction()?;
            let seq = next_seq(&tx, partition.name())?;
            tx.execute(
                "INSERT INTO records(partition, key, seq, payload) VALUES(?1, ?2, ?3, ?4)
                 ON CONFLICT(partition, key) DO UPDATE SET payload = excluded.payload",
                params![partition.name(), key, seq as i64, value],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn add(&self, partition: Partition, value: Vec<u8>) -> anyhow::Result<u64> {
        self.with_connection(move |conn| {
            let tx = conn.transaction()?;
            let seq = next_seq(&tx, partition.name())?;
            tx.execute(
                "INSERT INTO records(partition, key, seq, payload) VALUES(?1, ?2, ?3, ?4)",
                params![partition.name(), sequence_key(seq), seq as i64, value],
            )?;
            tx.commit()?;
            Ok(seq)
        })
        .await
    }

    async fn get_all(&self, partition: Partition) -> anyhow::Result<Vec<(String, Vec<u8>)>> {
        self.with_connection(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT key, payload FROM records WHERE partition = ?1 ORDER BY seq ASC",
            )?;
            let rows = stmt.query_map(params![partition.name()], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
            })?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await
    }

    async fn delete(&self, partition: Partition, key: &str) -> anyhow::Result<()> {
        let key = key.to_string();
        self.with_connection(move |conn| {
            conn.execute(
                "DELETE FROM records WHERE partition = ?1 AND key = ?2",
                params![partition.name(), key],
            )?;
            Ok(())
        })
        .await
    }

    async fn clear(&self, partition: Partition) -> anyhow::Result<()> {
        self.with_connection(move |conn| {
            conn.execute(
                "DELETE FROM records WHERE partition = ?1",
                params![partition.name()],
            )?;
            Ok(())
        })
        .await
    }
}

pub fn encrypt_secret(secret: &[u8], passphrase: &str) -> anyhow::Result<EncryptedSecret> {
    let mut salt = [0u8; 16];
    let mut nonce = [0u8; 24];
    let mut rng = rand::rngs::OsRng;
    rng.fill_bytes(&mut salt);
    rng.fill_bytes(&mut nonce);

    let mut key_bytes = [0u8; 32];
    pbkdf2_hmac::<sha2::Sha256>(
        passphrase.as_bytes(),
        &salt,
        KEY_KDF_ITERATIONS,
        &mut key_bytes,
    );
    let cipher = XChaCha20Poly1305::new(Key::from_slice(&key_bytes));
    let ciphertext = cipher
        .encrypt(XNonce::from_slice(&nonce), secret)
        .map_err(|_| anyhow::anyhow!("failed to encrypt secret"))?;

    Ok(EncryptedSecret {
        salt,
        nonce,
        ciphertext,
    })
}

pub fn decrypt_secret(secret: &EncryptedSecret, passphrase: &str) -> anyhow::Result<Vec<u8>> {
    let mut key_bytes = [0u8; 32];
    pbkdf2_hmac::<sha2::Sha256>(
        passphrase.as_bytes(),
        &secret.salt,
        KEY_KDF_ITERATIONS,
        &mut key_bytes,
    );
    let cipher = XChaCha20Poly1305::new(Key::from_slice(&key_bytes));
    let plaintext = cipher
        .decrypt(
            XNonce::from_slice(&secret.nonce),
            secret.ciphertext.as_ref(),
        )
        .map_err(|_| anyhow::anyhow!("failed to decrypt secret"))?;
    Ok(plaintext)
}
