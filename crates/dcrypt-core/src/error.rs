// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! Failure taxonomy shared by every node operation.
//!
//! Public APIs return `anyhow::Result`; the concrete error inside is a
//! [`NodeError`] whenever the failure belongs to one of the categories
//! below, so callers can `downcast_ref::<NodeError>()` and branch on
//! [`NodeError::kind`].

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad hash, bad amount or malformed request. Never retried.
    InputValidation,
    /// A peer channel or store is not ready.
    Unavailable,
    /// Content, chunk or DHT key absent after every candidate was tried.
    NotFound,
    /// A correlated request exceeded its deadline.
    Timeout,
    /// A response matched a pending request but failed its identity guard.
    Mismatch,
    /// Connection-level failure; retried up to the attempt cap.
    Network,
    /// Local persistence failure. Always propagated.
    Storage,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NodeError {
    #[error("invalid input: {0}")]
    InputValidation(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("request {correlation_id} timed out after {timeout_ms} ms")]
    Timeout {
        correlation_id: String,
        timeout_ms: u64,
    },

    #[error("response mismatch: expected {expected}, got {actual}")]
    Mismatch { expected: String, actual: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl NodeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InputValidation(_) => ErrorKind::InputValidation,
            Self::Unavailable(_) => ErrorKind::Unavailable,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Mismatch { .. } => ErrorKind::Mismatch,
            Self::Network(_) => ErrorKind::Network,
            Self::Storage(_) => ErrorKind::Storage,
        }
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InputValidation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }
}

/// Classify an `anyhow` error produced by this crate.
pub fn error_kind(err: &anyhow::Error) -> Option<ErrorKind> {
    err.downcast_ref::<NodeError>().map(NodeError::kind)
}
