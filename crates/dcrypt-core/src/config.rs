// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{error::NodeError, peer_manager::ConnectionPolicy};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Run as a supernode: store DHT records and route lookups.
    pub supernode: bool,
    pub max_peers: usize,
    pub max_connection_attempts: u32,
    pub connection_retry_base_ms: u64,
    pub request_timeout_ms: u64,
    pub ping_timeout_ms: u64,
    pub latency_sample_size: usize,
    pub discover_interval_ms: u64,
    pub directory_refresh_ms: u64,
    pub latency_interval_ms: u64,
    pub routing_refresh_ms: u64,
    pub republish_interval_ms: u64,
    pub cleanup_interval_ms: u64,
    pub default_dht_ttl_ms: u64,
    pub default_premium_price: f64,
    pub commission_rate: f64,
    pub identity_passphrase: Option<String>,
    /// Shared secret for chunk encryption; without it the key is derived
    /// from this node's identity and only this node can decrypt.
    pub content_secret: Option<String>,
    pub bootstrap_supernodes: Vec<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            supernode: false,
            max_peers: 50,
            max_connection_attempts: 3,
            connection_retry_base_ms: 5_000,
            request_timeout_ms: 10_000,
            ping_timeout_ms: 2_000,
            latency_sample_size: 5,
            discover_interval_ms: 5_000,
            directory_refresh_ms: 5 * 60 * 1_000,
            latency_interval_ms: 60_000,
            routing_refresh_ms: 10 * 60 * 1_000,
            republish_interval_ms: 6 * 60 * 60 * 1_000,
            cleanup_interval_ms: 24 * 60 * 60 * 1_000,
            default_dht_ttl_ms: 24 * 60 * 60 * 1_000,
            default_premium_price: 30.0,
            commission_rate: 0.05,
            identity_passphrase: None,
            content_secret: None,
            bootstrap_supernodes: vec![],
        }
    }
}

impl NodeConfig {
    pub fn validate(&self) -> Result<(), NodeError> {
        if self.max_peers == 0 {
            return Err(NodeError::invalid("max_peers must be at least 1"));
        }
        if self.max_connection_attempts == 0 {
            return Err(NodeError::invalid(
                "max_connection_attempts must be at least 1",
            ));
        }
        if !(0.0..=1.0).contains(&self.commission_rate) {
            return Err(NodeError::invalid("commission_rate must be within 0..=1"));
        }
        if !self.default_premium_price.is_finite() || self.default_premium_price < 0.0 {
            return Err(NodeError::invalid(
                "default_premium_price must be a non-negative number",
            ));
        }
        let intervals = [
            self.discover_interval_ms,
            self.directory_refresh_ms,
            self.latency_interval_ms,
            self.routing_refresh_ms,
            self.republish_interval_ms,
            self.cleanup_interval_ms,
        ];
        if intervals.contains(&0) {
            return Err(NodeError::invalid("periodic intervals must be non-zero"));
        }
        Ok(())
    }

    pub fn connection_policy(&self) -> ConnectionPolicy {
        ConnectionPolicy {
            max_peers: self.max_peers,
            max_attempts: self.max_connection_attempts,
            retry_base: Duration::from_millis(self.connection_retry_base_ms),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = NodeConfig::default();
        config.validate().expect("defaults validate");
        assert_eq!(config.connection_policy().max_attempts, 3);
        assert_eq!(config.request_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn rejects_out_of_range_values() {
        let config = NodeConfig {
            commission_rate: 1.5,
            ..NodeConfig::default()
        };
        assert!(config.validate().is_err());
        let config = NodeConfig {
            cleanup_interval_ms: 0,
            ..NodeConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn partial_documents_fall_back_to_defaults() {
        let config: NodeConfig =
            crate::cbor::from_slice(&crate::cbor::to_vec(&crate::cbor::Value::Map(vec![(
                crate::cbor::Value::Text("supernode".into()),
                crate::cbor::Value::Bool(true),
            )]))
            .expect("encode"))
            .expect("decode");
        assert!(config.supernode);
        assert_eq!(config.max_peers, 50);
    }
}
