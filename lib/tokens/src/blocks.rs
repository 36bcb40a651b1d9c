// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Chained block hashing over prompt token sequences.

use crate::pickle;
use crate::{BlockHash, NONE_HASH, Token, TokensError, sha256};

/// Produces the engine-compatible hash chain for a token sequence.
///
/// Tokens are split into consecutive windows of `block_size`; a trailing
/// partial window is never hashed. Block `i` hashes the serialization of
/// `(hash(i-1), tokens(i), extra_keys)`, seeded with [`NONE_HASH`], which
/// makes the chain prefix-stable: appending tokens never changes the hashes
/// of earlier blocks.
#[derive(Debug, Clone)]
pub struct BlockHasher {
    block_size: usize,
    extra_keys: Option<Vec<Token>>,
}

impl BlockHasher {
    pub fn new(block_size: usize) -> Self {
        Self {
            block_size,
            extra_keys: None,
        }
    }

    /// Extra keys folded into every block payload (e.g. LoRA identifiers).
    pub fn with_extra_keys(mut self, extra_keys: Vec<Token>) -> Self {
        self.extra_keys = Some(extra_keys);
        self
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    fn check_block_size(&self) -> Result<(), TokensError> {
        if self.block_size == 0 {
            // The engine reports its block size; zero means the config reply
            // was garbage and no chain can be formed from it.
            return Err(TokensError::Hash(
                "cannot chain blocks of size 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Serializes each full block, threading the parent hash through the chain.
    pub fn serialize_blocks(&self, tokens: &[Token]) -> Result<Vec<Vec<u8>>, TokensError> {
        self.check_block_size()?;
        let mut payloads = Vec::with_capacity(tokens.len() / self.block_size);
        let mut prev = NONE_HASH;
        for block in tokens.chunks_exact(self.block_size) {
            let payload = pickle::dumps_block(&prev, block, self.extra_keys.as_deref())?;
            prev = sha256(&payload);
            payloads.push(payload);
        }
        Ok(payloads)
    }

    /// Computes the hash chain, one hash per full block.
    pub fn hash_chain(&self, tokens: &[Token]) -> Result<Vec<BlockHash>, TokensError> {
        self.check_block_size()?;
        let mut hashes = Vec::with_capacity(tokens.len() / self.block_size);
        let mut prev = NONE_HASH;
        for block in tokens.chunks_exact(self.block_size) {
            let payload = pickle::dumps_block(&prev, block, self.extra_keys.as_deref())?;
            prev = sha256(&payload);
            hashes.push(prev);
        }
        Ok(hashes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Conformance vectors pinned by the engine's own hasher: serialized block
    // payloads and their SHA-256 digests for block_size=5, tokens 1..=10.
    const BLOCK1_PAYLOAD_HEX: &str = "80059534000000000000004320\
        0000000000000000000000000000000000000000000000000000000000000000\
        94284b014b024b034b044b0574944e87942e";
    const BLOCK1_HASH_HEX: &str =
        "62a05fac03f5470c9e1e66b43447b1cb321ec98e3afb509f531d0781dde12d52";
    const BLOCK2_PAYLOAD_HEX: &str = "80059534000000000000004320\
        62a05fac03f5470c9e1e66b43447b1cb321ec98e3afb509f531d0781dde12d52\
        94284b064b074b084b094b0a74944e87942e";
    const BLOCK2_HASH_HEX: &str =
        "3b3f53cad691850fca841706606c71b1320e0515cca38dec3b48f3e3722052be";

    #[test]
    fn golden_payloads_hash_to_expected_digests() {
        let block1 = hex::decode(BLOCK1_PAYLOAD_HEX).unwrap();
        assert_eq!(hex::encode(sha256(&block1)), BLOCK1_HASH_HEX);

        let block2 = hex::decode(BLOCK2_PAYLOAD_HEX).unwrap();
        assert_eq!(hex::encode(sha256(&block2)), BLOCK2_HASH_HEX);
    }

    #[test]
    fn serialize_blocks_reproduces_golden_payloads() {
        let tokens: Vec<Token> = (1..=10).collect();
        let payloads = BlockHasher::new(5).serialize_blocks(&tokens).unwrap();
        assert_eq!(payloads.len(), 2);
        assert_eq!(hex::encode(&payloads[0]), BLOCK1_PAYLOAD_HEX);
        assert_eq!(hex::encode(&payloads[1]), BLOCK2_PAYLOAD_HEX);
    }

    #[test]
    fn hash_chain_reproduces_golden_hashes() {
        let tokens: Vec<Token> = (1..=10).collect();
        let hashes = BlockHasher::new(5).hash_chain(&tokens).unwrap();
        assert_eq!(hashes.len(), 2);
        assert_eq!(hex::encode(hashes[0]), BLOCK1_HASH_HEX);
        assert_eq!(hex::encode(hashes[1]), BLOCK2_HASH_HEX);
    }

    #[test]
    fn partial_trailing_block_is_not_hashed() {
        let tokens: Vec<Token> = (1..=12).collect();
        let hashes = BlockHasher::new(5).hash_chain(&tokens).unwrap();
        assert_eq!(hashes.len(), 2);
    }

    #[test]
    fn chain_is_prefix_stable() {
        let hasher = BlockHasher::new(16);
        let prefix: Vec<Token> = (0..64).collect();
        let extended: Vec<Token> = (0..131).collect();

        let short = hasher.hash_chain(&prefix).unwrap();
        let long = hasher.hash_chain(&extended).unwrap();
        assert_eq!(short.len(), 4);
        assert_eq!(&long[..4], &short[..]);
    }

    #[test]
    fn extra_keys_perturb_every_hash() {
        let tokens: Vec<Token> = (1..=10).collect();
        let plain = BlockHasher::new(5).hash_chain(&tokens).unwrap();
        let salted = BlockHasher::new(5)
            .with_extra_keys(vec![99])
            .hash_chain(&tokens)
            .unwrap();
        assert_ne!(plain[0], salted[0]);
        assert_ne!(plain[1], salted[1]);
    }

    #[test]
    fn zero_block_size_is_a_hash_error() {
        let err = BlockHasher::new(0).hash_chain(&[1, 2, 3]).unwrap_err();
        assert!(matches!(err, TokensError::Hash(_)));
        let err = BlockHasher::new(0).serialize_blocks(&[1, 2, 3]).unwrap_err();
        assert!(matches!(err, TokensError::Hash(_)));
    }
}
