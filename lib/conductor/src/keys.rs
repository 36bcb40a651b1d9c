// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Cache key generation.
//!
//! A logical key describes what a request needs independent of placement; a
//! physical key is the rank-specific string under which a worker publishes a
//! block into the object locator. The string layout is opaque to callers but
//! must match the convention the inference workers publish with.

use conductor_tokens::BlockHash;

use crate::error::ConductorError;

const FIELD_SEPARATOR: char = '@';

/// Components of a physical cache key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhysicalKeyComponents {
    pub model_name: String,
    pub world_size: u32,
    pub rank_id: u32,
    /// Lowercase hex of the 32-byte block hash.
    pub block_hash: String,
    pub engine_tag: String,
}

/// Builds the opaque physical key string for one block on one rank.
///
/// Field order is fixed and the hash segment is hex-only, so distinct
/// component tuples can never collide.
pub fn build_physical_key(components: &PhysicalKeyComponents) -> Result<String, ConductorError> {
    validate_segment(&components.model_name, "model_name")?;
    validate_segment(&components.engine_tag, "engine_tag")?;
    if components.block_hash.is_empty()
        || !components
            .block_hash
            .bytes()
            .all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase())
    {
        return Err(ConductorError::Serialization(format!(
            "block_hash must be lowercase hex, got {:?}",
            components.block_hash
        )));
    }
    Ok(format!(
        "{model}{sep}{world}{sep}{rank}{sep}{engine}{sep}{hash}",
        model = components.model_name,
        world = components.world_size,
        rank = components.rank_id,
        engine = components.engine_tag,
        hash = components.block_hash,
        sep = FIELD_SEPARATOR,
    ))
}

/// Parses a physical key back into components, for diagnostics.
/// Round-trip law: `parse_physical_key(&build_physical_key(c)?)? == c`.
pub fn parse_physical_key(key: &str) -> Result<PhysicalKeyComponents, ConductorError> {
    let parts: Vec<&str> = key.split(FIELD_SEPARATOR).collect();
    let [model_name, world_size, rank_id, engine_tag, block_hash] = parts.as_slice() else {
        return Err(ConductorError::Serialization(format!(
            "physical key has {} fields, expected 5: {key:?}",
            parts.len()
        )));
    };
    let world_size = world_size.parse::<u32>().map_err(|_| {
        ConductorError::Serialization(format!("invalid world_size in key: {key:?}"))
    })?;
    let rank_id = rank_id
        .parse::<u32>()
        .map_err(|_| ConductorError::Serialization(format!("invalid rank_id in key: {key:?}")))?;
    Ok(PhysicalKeyComponents {
        model_name: model_name.to_string(),
        world_size,
        rank_id,
        block_hash: block_hash.to_string(),
        engine_tag: engine_tag.to_string(),
    })
}

fn validate_segment(segment: &str, field: &str) -> Result<(), ConductorError> {
    if segment.is_empty() || segment.contains(FIELD_SEPARATOR) {
        return Err(ConductorError::Serialization(format!(
            "{field} must be non-empty and must not contain {FIELD_SEPARATOR:?}: {segment:?}"
        )));
    }
    Ok(())
}

/// What a request needs from the cache, independent of which rank holds it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogicalCacheKey {
    pub model_name: String,
    pub world_size: u32,
    pub chain: Vec<BlockHash>,
}

impl LogicalCacheKey {
    pub fn new(model_name: impl Into<String>, world_size: u32, chain: Vec<BlockHash>) -> Self {
        Self {
            model_name: model_name.into(),
            world_size,
            chain,
        }
    }

    /// Physical keys for the whole chain on one rank, ordered by block
    /// position (earliest first), matching the planner's input contract.
    pub fn physical_keys_for_rank(
        &self,
        rank_id: u32,
        engine_tag: &str,
    ) -> Result<Vec<String>, ConductorError> {
        self.chain
            .iter()
            .map(|hash| {
                build_physical_key(&PhysicalKeyComponents {
                    model_name: self.model_name.clone(),
                    world_size: self.world_size,
                    rank_id,
                    block_hash: hex::encode(hash),
                    engine_tag: engine_tag.to_string(),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_tokens::{BlockHasher, Token};

    fn components() -> PhysicalKeyComponents {
        PhysicalKeyComponents {
            model_name: "meta-llama/Llama-2-7b-chat-hf".to_string(),
            world_size: 4,
            rank_id: 2,
            block_hash: "62a05fac03f5470c9e1e66b43447b1cb321ec98e3afb509f531d0781dde12d52"
                .to_string(),
            engine_tag: "vllm".to_string(),
        }
    }

    #[test]
    fn round_trip_preserves_components() {
        let original = components();
        let key = build_physical_key(&original).unwrap();
        let parsed = parse_physical_key(&key).unwrap();
        assert_eq!(parsed, original);
    }

    #[test]
    fn distinct_ranks_yield_distinct_keys() {
        let mut a = components();
        let mut b = components();
        a.rank_id = 0;
        b.rank_id = 1;
        assert_ne!(
            build_physical_key(&a).unwrap(),
            build_physical_key(&b).unwrap()
        );
    }

    #[test]
    fn separator_in_model_name_is_rejected() {
        let mut bad = components();
        bad.model_name = "model@v2".to_string();
        assert!(build_physical_key(&bad).is_err());
    }

    #[test]
    fn non_hex_hash_is_rejected() {
        let mut bad = components();
        bad.block_hash = "NOT-HEX".to_string();
        assert!(build_physical_key(&bad).is_err());
    }

    #[test]
    fn malformed_key_fails_to_parse() {
        assert!(parse_physical_key("too@few@fields").is_err());
        assert!(parse_physical_key("m@notanum@0@vllm@ab").is_err());
    }

    #[test]
    fn rank_batch_follows_block_order() {
        let tokens: Vec<Token> = (1..=10).collect();
        let chain = BlockHasher::new(5).hash_chain(&tokens).unwrap();
        let logical = LogicalCacheKey::new("m", 2, chain.clone());
        let keys = logical.physical_keys_for_rank(1, "vllm").unwrap();
        assert_eq!(keys.len(), 2);
        assert!(keys[0].ends_with(&hex::encode(chain[0])));
        assert!(keys[1].ends_with(&hex::encode(chain[1])));
        for key in &keys {
            let parsed = parse_physical_key(key).unwrap();
            assert_eq!(parsed.rank_id, 1);
            assert_eq!(parsed.world_size, 2);
        }
    }
}
