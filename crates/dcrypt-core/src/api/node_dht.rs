//! DHT operations on `NodeHandle`: store/find, republish, cleanup and
//! bootstrap supernode selection.

use rand::seq::SliceRandom;
use tracing::{debug, info};

use crate::{
    dht::{DhtRecord, K, validate_entry},
    error::NodeError,
    ids::RoutingId,
    now_unix_ms,
    peer::PeerAddr,
    store::Partition,
    wire::Message,
};

use super::{
    NodeHandle,
    helpers::{all_dht_records, merge_peer_lists, persist_dht_record},
};

impl NodeHandle {
    /// Store `value` under `key` with a lifetime of `ttl_ms`.
    ///
    /// A supernode keeps the record itself and pushes it to the closest
    /// supernodes it routes to. A regular peer hands it to its bootstrap
    /// supernode, which fans it out. Returns how many peers were sent the
    /// record.
    pub async fn store_dht(&self, key: &str, value: Vec<u8>, ttl_ms: u64) -> anyhow::Result<usize> {
        validate_entry(key, &value)?;
        let targets = if self.is_supernode() {
            let record = DhtRecord::new(key, value.clone(), ttl_ms, now_unix_ms())?;
            persist_dht_record(self.inner.store.as_ref(), &record).await?;
            self.state
                .read()
                .await
                .routing
                .closest(&RoutingId::for_key(key), K)
        } else {
            vec![self.bootstrap_supernode().await?]
        };

        let message = Message::StoreDht {
            key: key.to_string(),
            value,
            ttl: ttl_ms,
            peer_address: self.local_address().clone(),
        };
        let mut delivered = 0;
        for target in &targets {
            match self.inner.peers.send(target, &message).await {
                Ok(()) => delivered += 1,
                Err(err) => debug!(peer = %target, error = %err, "dht store not delivered"),
            }
        }
        if delivered == 0 && !self.is_supernode() {
            return Err(NodeError::unavailable("no supernode accepted the dht store").into());
        }
        debug!(%key, ttl_ms, delivered, "dht store");
        Ok(delivered)
    }

    /// Look `key` up. Supernodes answer from their own records first and
    /// then ask the closest supernodes in turn; regular peers delegate the
    /// lookup to their bootstrap supernode.
    pub async fn find_dht(&self, key: &str) -> anyhow::Result<Vec<u8>> {
        if key.trim().is_empty() {
            return Err(NodeError::invalid("empty dht key").into());
        }
        let candidates = if self.is_supernode() {
            if let Some(value) = self.local_dht_value(key).await? {
                return Ok(value);
            }
            self.state
                .read()
                .await
                .routing
                .closest(&RoutingId::for_key(key), K)
        } else {
            vec![self.bootstrap_supernode().await?]
        };

        for peer in candidates.iter().filter(|peer| *peer != self.local_address()) {
            match self.query_find_dht(peer, key).await {
                Ok((Some(value), _)) => return Ok(value),
                Ok((None, _)) => {}
                Err(err) => debug!(%peer, %key, error = %err, "dht find failed"),
            }
        }
        Err(NodeError::not_found(format!("no dht value for {key}")).into())
    }

    /// One find round trip. Returns the value, if any, and the peer's view
    /// of the closest supernodes.
    async fn query_find_dht(
        &self,
        peer: &PeerAddr,
        key: &str,
    ) -> anyhow::Result<(Option<Vec<u8>>, Vec<PeerAddr>)> {
        let reply = self
            .request(
                peer,
                "find",
                Some(key.to_string()),
                self.inner.config.request_timeout(),
                |correlation_id| Message::FindDht {
                    correlation_id,
                    key: key.to_string(),
                },
            )
            .await?;
        match reply {
            Message::FindDhtResponse {
                value,
                closest_peers,
                ..
            } => Ok((value.map(|bytes| bytes.into_vec()), closest_peers)),
            other => Err(NodeError::Mismatch {
                expected: "find-dht-response".into(),
                actual: other.type_name().into(),
            }
            .into()),
        }
    }

    /// Re-store every unexpired local record with its remaining lifetime.
    pub async fn republish_dht(&self) -> anyhow::Result<usize> {
        if !self.is_supernode() {
            return Ok(0);
        }
        let now = now_unix_ms();
        let mut republished = 0;
        for record in all_dht_records(self.inner.store.as_ref()).await? {
            if record.is_expired(now) {
                continue;
            }
            self.store_dht(&record.key, record.value.clone(), record.remaining_ttl_ms(now))
                .await?;
            republished += 1;
        }
        info!(republished, "dht records republished");
        Ok(republished)
    }

    /// Delete local records whose lifetime has elapsed.
    pub async fn cleanup_dht(&self) -> anyhow::Result<usize> {
        if !self.is_supernode() {
            return Ok(0);
        }
        let now = now_unix_ms();
        let mut removed = 0;
        for record in all_dht_records(self.inner.store.as_ref()).await? {
            if record.is_expired(now) {
                self.inner
                    .store
                    .delete(Partition::DhtRecords, &record.key)
                    .await?;
                removed += 1;
            }
        }
        if removed > 0 {
            info!(removed, "expired dht records deleted");
        }
        Ok(removed)
    }

    /// Query the closest peers of a random key to keep routing entries warm.
    /// Returns how many previously unknown peers were learned.
    pub async fn refresh_routing_table(&self) -> anyhow::Result<usize> {
        if !self.is_supernode() {
            return Ok(0);
        }
        let key = hex::encode(RoutingId::random().0);
        let closest = self
            .state
            .read()
            .await
            .routing
            .closest(&RoutingId::for_key(&key), K);
        let Some(peer) = closest
            .iter()
            .find(|peer| self.inner.peers.is_connected(peer))
        else {
            return Ok(0);
        };
        let (_, learned) = self.query_find_dht(peer, &key).await?;
        let learned = merge_peer_lists(self.local_address(), [learned]);
        {
            let mut state = self.state.write().await;
            let now = now_unix_ms();
            for addr in learned.iter().filter(|addr| addr.is_supernode()) {
                state.routing.upsert(addr.clone(), now);
            }
        }
        let fresh = self.inner.peers.discover(learned);
        debug!(fresh, "routing table refreshed");
        Ok(fresh)
    }

    /// Current bootstrap supernode, selecting one when none is connected.
    pub async fn bootstrap_supernode(&self) -> anyhow::Result<PeerAddr> {
        let current = self.state.read().await.bootstrap.clone();
        if let Some(current) = current
            && self.inner.peers.is_connected(&current)
        {
            return Ok(current);
        }
        self.select_bootstrap().await
    }

    /// Ping up to `latency_sample_size` connected supernodes and keep the
    /// fastest responder; with no responder pick one at random.
    pub async fn select_bootstrap(&self) -> anyhow::Result<PeerAddr> {
        let known = self.known_supernodes().await;
        let mut candidates = merge_peer_lists(self.local_address(), [self.active_supernodes(), known]);
        candidates.retain(|addr| self.inner.peers.is_connected(addr));
        if candidates.is_empty() {
            return Err(NodeError::unavailable("no connected supernode to bootstrap from").into());
        }
        candidates.truncate(self.inner.config.latency_sample_size.max(1));

        let mut best: Option<(std::time::Duration, PeerAddr)> = None;
        for candidate in &candidates {
            match self.ping(candidate).await {
                Ok(rtt) if best.as_ref().is_none_or(|(fastest, _)| rtt < *fastest) => {
                    best = Some((rtt, candidate.clone()));
                }
                Ok(_) => {}
                Err(err) => debug!(peer = %candidate, error = %err, "bootstrap candidate silent"),
            }
        }
        let chosen = match best {
            Some((_, addr)) => addr,
            None => candidates
                .choose(&mut rand::thread_rng())
                .cloned()
                .ok_or_else(|| NodeError::unavailable("no bootstrap candidate"))?,
        };
        self.state.write().await.bootstrap = Some(chosen.clone());
        info!(bootstrap = %chosen, "bootstrap supernode selected");

        let node = self.clone();
        let peer = chosen.clone();
        tokio::spawn(async move {
            if let Err(err) = node.exchange_known_peers(&peer).await {
                debug!(%peer, error = %err, "known peer exchange failed");
            }
        });
        Ok(chosen)
    }
}
