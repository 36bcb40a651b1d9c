// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Token block serialization and hashing.
//!
//! The inference engine identifies each full block of prompt tokens by a
//! SHA-256 chain hash over a deterministic serialization of
//! `(parent_hash, block_tokens, extra_keys)`. Workers publish KV blocks into
//! the object locator under keys derived from these hashes, so the router's
//! hashes must be bit-identical to the engine's own — any divergence is a
//! silent cache miss.

use sha2::{Digest, Sha256};

pub mod blocks;
pub mod pickle;

pub use blocks::BlockHasher;

/// A token is a 64-bit signed integer, matching the engine's wire format.
pub type Token = i64;

/// A 32-byte SHA-256 block hash.
pub type BlockHash = [u8; 32];

/// Chain seed used in place of a parent hash for the first block.
pub const NONE_HASH: BlockHash = [0u8; 32];

/// Errors produced while serializing or hashing token blocks. Both are fatal
/// for the affected request, which falls back to load-only placement.
#[derive(Debug, thiserror::Error)]
pub enum TokensError {
    #[error("block serialization failed: {0}")]
    Serialization(String),

    #[error("block hashing failed: {0}")]
    Hash(String),
}

/// Computes the SHA-256 digest of `data`.
pub fn sha256(data: &[u8]) -> BlockHash {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}
