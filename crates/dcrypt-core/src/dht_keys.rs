// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use crate::ids::{ChunkHash, ContentHash};

const CHUNK_LOCATION_PREFIX: &str = "chunk:";

/// Key under which a published object's [`crate::content::ContentRecord`]
/// is stored.
pub fn content_record_key(content_hash: &ContentHash) -> String {
    content_hash.as_str().to_string()
}

/// Key under which the list of peers holding a chunk is stored.
pub fn chunk_location_key(chunk_hash: &ChunkHash) -> String {
    format!("{CHUNK_LOCATION_PREFIX}{chunk_hash}")
}
