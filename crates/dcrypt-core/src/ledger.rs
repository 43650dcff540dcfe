// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! Balance bookkeeping and the transaction log.
//!
//! Balances are keyed by the identity part of a peer address so that a
//! node keeps its balance across address suffix changes.

use std::sync::Arc;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::{
    error::NodeError,
    ids::ContentHash,
    now_unix_ms,
    peer::PeerAddr,
    store::{Partition, Store},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionKind {
    Buy,
    Deposit,
    Withdraw,
    Commission,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub kind: TransactionKind,
    pub amount: f64,
    /// Identity whose balance moved.
    pub identity: String,
    #[serde(default)]
    pub content_hash: Option<ContentHash>,
    #[serde(default)]
    pub counterparty: Option<PeerAddr>,
    pub timestamp_ms: u64,
}

/// One supernode's cut of a commission.
#[derive(Debug, Clone, PartialEq)]
pub struct CommissionPayout {
    pub supernode: PeerAddr,
    pub amount: f64,
    pub new_balance: f64,
}

pub fn validate_amount(amount: f64) -> Result<(), NodeError> {
    if !amount.is_finite() || amount <= 0.0 {
        return Err(NodeError::invalid(format!(
            "amount must be a positive number, got {amount}"
        )));
    }
    Ok(())
}

pub struct Ledger {
    store: Arc<dyn Store>,
}

impl Ledger {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Current balance; identities never seen hold zero.
    pub async fn balance(&self, identity: &str) -> anyhow::Result<f64> {
        match self.store.get(Partition::Balances, identity).await? {
            Some(bytes) => Ok(crate::cbor::from_slice::<f64>(&bytes)
                .map_err(|err| NodeError::Storage(format!("corrupt balance record: {err}")))?),
            None => Ok(0.0),
        }
    }

    pub async fn put_balance(&self, identity: &str, amount: f64) -> anyhow::Result<()> {
        if identity.trim().is_empty() {
            return Err(NodeError::invalid("empty identity").into());
        }
        if !amount.is_finite() || amount < 0.0 {
            return Err(NodeError::invalid(format!("invalid balance: {amount}")).into());
        }
        let bytes = crate::cbor::to_vec(&amount).context("encode balance")?;
        self.store.put(Partition::Balances, identity, bytes).await
    }

    pub async fn credit(&self, identity: &str, amount: f64) -> anyhow::Result<f64> {
        let next = self.balance(identity).await? + amount;
        self.put_balance(identity, next).await?;
        Ok(next)
    }

    /// Fails with an input-validation error when the balance is short.
    pub async fn debit(&self, identity: &str, amount: f64) -> anyhow::Result<f64> {
        let current = self.balance(identity).await?;
        if current < amount {
            return Err(NodeError::invalid(format!(
                "insufficient balance: have {current}, need {amount}"
            ))
            .into());
        }
        let next = current - amount;
        self.put_balance(identity, next).await?;
        Ok(next)
    }

    pub async fn ensure_funds(&self, identity: &str, amount: f64) -> anyhow::Result<()> {
        let current = self.balance(identity).await?;
        if current < amount {
            return Err(NodeError::invalid(format!(
                "insufficient balance: have {current}, need {amount}"
            ))
            .into());
        }
        Ok(())
    }

    pub async fn deposit(&self, identity: &str, amount: f64) -> anyhow::Result<f64> {
        validate_amount(amount)?;
        let balance = self.credit(identity, amount).await?;
        self.record(TransactionKind::Deposit, identity, amount, None, None)
            .await?;
        Ok(balance)
    }

    pub async fn withdraw(&self, identity: &str, amount: f64) -> anyhow::Result<f64> {
        validate_amount(amount)?;
        let balance = self.debit(identity, amount).await?;
        self.record(TransactionKind::Withdraw, identity, amount, None, None)
            .await?;
        Ok(balance)
    }

    /// Split `total` evenly across `supernodes`, crediting each.
    pub async fn distribute_commission(
        &self,
        total: f64,
        supernodes: &[PeerAddr],
        content_hash: &ContentHash,
    ) -> anyhow::Result<Vec<CommissionPayout>> {
        if supernodes.is_empty() || total <= 0.0 {
            return Ok(vec![]);
        }
        let share = total / supernodes.len() as f64;
        let mut payouts = Vec::with_capacity(supernodes.len());
        for supernode in supernodes {
            let identity = supernode.identity();
            let new_balance = self.credit(identity, share).await?;
            self.record(
                TransactionKind::Commission,
                identity,
                share,
                Some(content_hash.clone()),
                Some(supernode.clone()),
            )
            .await?;
            payouts.push(CommissionPayout {
                supernode: supernode.clone(),
                amount: share,
                new_balance,
            });
        }
        Ok(payouts)
    }

    pub async fn record(
        &self,
        kind: TransactionKind,
        identity: &str,
        amount: f64,
        content_hash: Option<ContentHash>,
        counterparty: Option<PeerAddr>,
    ) -> anyhow::Result<()> {
        let tx = Transaction {
            kind,
            amount,
            identity: identity.to_string(),
            content_hash,
            counterparty,
            timestamp_ms: now_unix_ms(),
        };
        let bytes = crate::cbor::to_vec(&tx).context("encode transaction")?;
        self.store.add(Partition::Transactions, bytes).await?;
        Ok(())
    }

    /// Transaction log in insertion order.
    pub async fn transactions(&self) -> anyhow::Result<Vec<Transaction>> {
        self.store
            .get_all(Partition::Transactions)
            .await?
            .into_iter()
            .map(|(_, bytes)| {
                crate::cbor::from_slice::<Transaction>(&bytes).map_err(|err| {
                    anyhow::Error::from(NodeError::Storage(format!(
                        "corrupt transaction record: {err}"
                    )))
                })
            })
            .collect()
    }
}
