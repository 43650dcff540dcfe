// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use std::sync::RwLock;

use async_trait::async_trait;

use crate::{error::NodeError, peer::PeerAddr};

/// Source of currently known supernode addresses.
#[async_trait]
pub trait Directory: Send + Sync {
    async fn list_supernodes(&self) -> anyhow::Result<Vec<PeerAddr>>;
}

/// Fixed supernode list, replaceable at runtime.
#[derive(Debug, Default)]
pub struct StaticDirectory {
    supernodes: RwLock<Vec<PeerAddr>>,
}

impl StaticDirectory {
    pub fn new(supernodes: impl IntoIterator<Item = PeerAddr>) -> Self {
        Self {
            supernodes: RwLock::new(supernodes.into_iter().collect()),
        }
    }

    pub fn set(&self, supernodes: impl IntoIterator<Item = PeerAddr>) {
        if let Ok(mut current) = self.supernodes.write() {
            *current = supernodes.into_iter().collect();
        }
    }
}

#[async_trait]
impl Directory for StaticDirectory {
    async fn list_supernodes(&self) -> anyhow::Result<Vec<PeerAddr>> {
        let supernodes = self
            .supernodes
            .read()
            .map_err(|_| NodeError::unavailable("directory lock poisoned"))?;
        Ok(supernodes
            .iter()
            .filter(|addr| addr.is_supernode())
            .cloned()
            .collect())
    }
}
