// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! Balance and purchase operations on `NodeHandle`.

use tracing::{debug, info};

use crate::{
    ids::ContentHash,
    ledger::{Transaction, TransactionKind},
    wire::Message,
};

use super::{NodeHandle, RetrievedContent};

impl NodeHandle {
    pub async fn get_balance(&self, identity: &str) -> anyhow::Result<f64> {
        self.inner.ledger.balance(identity).await
    }

    pub async fn put_balance(&self, identity: &str, amount: f64) -> anyhow::Result<()> {
        self.inner.ledger.put_balance(identity, amount).await
    }

    /// Identity this node's own balance is kept under.
    pub fn ledger_identity(&self) -> &str {
        self.local_address().identity()
    }

    pub async fn own_balance(&self) -> anyhow::Result<f64> {
        self.get_balance(self.ledger_identity()).await
    }

    pub async fn deposit(&self, amount: f64) -> anyhow::Result<f64> {
        self.inner.ledger.deposit(self.ledger_identity(), amount).await
    }

    pub async fn withdraw(&self, amount: f64) -> anyhow::Result<f64> {
        self.inner.ledger.withdraw(self.ledger_identity(), amount).await
    }

    pub async fn transactions(&self) -> anyhow::Result<Vec<Transaction>> {
        self.inner.ledger.transactions().await
    }

    /// Buy and retrieve an object.
    ///
    /// Funds are checked before anything is fetched; the commission split
    /// and the debit only happen once the content is in hand.
    pub async fn purchase(&self, content_hash: &str) -> anyhow::Result<RetrievedContent> {
        let hash = ContentHash::parse(content_hash)?;
        let record = self.lookup_content(&hash).await?;
        let price = record.metadata.effective_price();
        let buyer = self.ledger_identity().to_string();
        if price > 0.0 {
            self.inner.ledger.ensure_funds(&buyer, price).await?;
        }

        let content = self.retrieve(content_hash).await?;

        if price > 0.0 {
            let commission = price * self.inner.config.commission_rate;
            let supernodes = self.active_supernodes();
            let payouts = self
                .inner
                .ledger
                .distribute_commission(commission, &supernodes, &hash)
                .await?;
            for payout in &payouts {
                let notice = Message::Commission {
                    amount: payout.amount,
                    new_balance: payout.new_balance,
                    peer_address: self.local_address().clone(),
                };
                if let Err(err) = self.inner.peers.send(&payout.supernode, &notice).await {
                    debug!(peer = %payout.supernode, error = %err, "commission notice not delivered");
                }
            }
            self.inner.ledger.debit(&buyer, price).await?;
        }
        self.inner
            .ledger
            .record(
                TransactionKind::Buy,
                &buyer,
                price,
                Some(hash.clone()),
                Some(record.publisher.clone()),
            )
            .await?;
        info!(content = %hash, price, "content purchased");
        Ok(content)
    }
}
