// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Longest-prefix prefill planning.
//!
//! Given the physical keys of a prompt's block chain (earliest block first)
//! and the replica lists the object locator returned for them, pick the node
//! holding the longest continuous prefix starting at block 0. Pure function:
//! no I/O, no mutation.

use std::collections::BTreeMap;

use crate::locator::{ReplicaListResponse, ReplicaResult, ReplicaStatus};

/// Outcome of prefill planning.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BestPrefillResult {
    pub hit: bool,
    /// Index of the deepest covered block; only meaningful when `hit`.
    pub best_index: usize,
    pub best_key: String,
    /// Transport endpoint of the winning node.
    pub node_id: String,
}

/// Collects the endpoints of all COMPLETE in-memory replicas. Disk replicas
/// are ignored for placement.
fn extract_node_ids(response: &ReplicaListResponse) -> Vec<&str> {
    response
        .replicas
        .iter()
        .filter(|replica| replica.status == ReplicaStatus::Complete)
        .filter_map(|replica| replica.memory_descriptor())
        .filter_map(|memory| memory.buffer_descriptors.first())
        .map(|buffer| buffer.transport_endpoint.as_str())
        .collect()
}

/// Selects the node with the longest continuous key prefix.
///
/// Mismatched input lengths and empty inputs return a miss; per-key errors
/// simply leave gaps in the coverage map, so the planner proceeds on partial
/// data. Ties between nodes break toward the lexicographically smallest
/// endpoint, which keeps the decision deterministic.
pub fn find_best_prefill(keys: &[String], results: &[ReplicaResult]) -> BestPrefillResult {
    let out = BestPrefillResult::default();

    if keys.len() != results.len() {
        tracing::warn!(
            keys = keys.len(),
            results = results.len(),
            "find_best_prefill: keys/results size mismatch"
        );
        return out;
    }
    if keys.is_empty() {
        return out;
    }

    let n = keys.len();

    // node endpoint -> per-position coverage bitmap
    let mut node_prefix_hit: BTreeMap<String, Vec<bool>> = BTreeMap::new();

    for (i, result) in results.iter().enumerate() {
        let Ok(response) = result else {
            continue;
        };
        if response.replicas.is_empty() {
            continue;
        }
        for node_id in extract_node_ids(response) {
            let hits = node_prefix_hit
                .entry(node_id.to_string())
                .or_insert_with(|| vec![false; n]);
            hits[i] = true;
        }
    }

    let mut best_length = 0usize;
    let mut best_node = "";

    for (node_id, hits) in &node_prefix_hit {
        let length = hits.iter().take_while(|&&hit| hit).count();
        if length > best_length {
            best_length = length;
            best_node = node_id;
        }
    }

    if best_length == 0 {
        return out;
    }

    let best_index = best_length - 1;
    BestPrefillResult {
        hit: true,
        best_index,
        best_key: keys[best_index].clone(),
        node_id: best_node.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locator::{ErrorCode, ReplicaDescriptor, ReplicaVariant, DiskDescriptor};

    fn response(endpoints: &[&str]) -> ReplicaResult {
        Ok(ReplicaListResponse {
            replicas: endpoints
                .iter()
                .map(|endpoint| ReplicaDescriptor::complete_memory(*endpoint, 1024))
                .collect(),
        })
    }

    fn keys(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn picks_node_with_longest_continuous_prefix() {
        // NodeA holds {k1,k2}, NodeB holds {k1,k3}, NodeC holds {k1,k2,k3}.
        let keys = keys(&["k1", "k2", "k3"]);
        let results = vec![
            response(&["NodeA:9000", "NodeB:9000", "NodeC:9000"]),
            response(&["NodeA:9000", "NodeC:9000"]),
            response(&["NodeC:9000"]),
        ];

        let result = find_best_prefill(&keys, &results);
        assert!(result.hit);
        assert_eq!(result.best_index, 2);
        assert_eq!(result.best_key, "k3");
        assert_eq!(result.node_id, "NodeC:9000");
    }

    #[test]
    fn gap_in_coverage_stops_the_prefix() {
        // NodeB covers k1 and k3 but not k2, so its prefix length is 1.
        let keys = keys(&["k1", "k2", "k3"]);
        let results = vec![
            response(&["NodeB:9000"]),
            response(&[]),
            response(&["NodeB:9000"]),
        ];

        let result = find_best_prefill(&keys, &results);
        assert!(result.hit);
        assert_eq!(result.best_index, 0);
        assert_eq!(result.best_key, "k1");
    }

    #[test]
    fn empty_replicas_mean_miss() {
        let keys = keys(&["k1"]);
        let results = vec![response(&[])];
        let result = find_best_prefill(&keys, &results);
        assert!(!result.hit);
    }

    #[test]
    fn no_first_block_coverage_means_miss() {
        let keys = keys(&["k1", "k2"]);
        let results = vec![Err(ErrorCode::ObjectNotFound), response(&["NodeA:9000"])];
        let result = find_best_prefill(&keys, &results);
        assert!(!result.hit);
    }

    #[test]
    fn size_mismatch_returns_miss() {
        let keys = keys(&["k1", "k2"]);
        let results = vec![response(&["NodeA:9000"])];
        assert!(!find_best_prefill(&keys, &results).hit);
    }

    #[test]
    fn empty_inputs_return_miss() {
        assert!(!find_best_prefill(&[], &[]).hit);
    }

    #[test]
    fn rpc_failures_leave_gaps_but_planning_proceeds() {
        let keys = keys(&["k1", "k2", "k3"]);
        let results = vec![
            response(&["NodeA:9000"]),
            response(&["NodeA:9000"]),
            Err(ErrorCode::RpcFail),
        ];
        let result = find_best_prefill(&keys, &results);
        assert!(result.hit);
        assert_eq!(result.best_index, 1);
        assert_eq!(result.node_id, "NodeA:9000");
    }

    #[test]
    fn incomplete_and_disk_replicas_are_ignored() {
        let keys = keys(&["k1"]);
        let incomplete = ReplicaDescriptor {
            status: ReplicaStatus::Incomplete,
            variant: ReplicaVariant::Memory(crate::locator::MemoryDescriptor {
                buffer_descriptors: vec![crate::locator::BufferDescriptor {
                    size: 1,
                    transport_endpoint: "NodeA:9000".to_string(),
                }],
            }),
        };
        let disk = ReplicaDescriptor {
            status: ReplicaStatus::Complete,
            variant: ReplicaVariant::Disk(DiskDescriptor {
                file_path: "/data/block".to_string(),
            }),
        };
        let results = vec![Ok(ReplicaListResponse {
            replicas: vec![incomplete, disk],
        })];
        assert!(!find_best_prefill(&keys, &results).hit);
    }

    #[test]
    fn ties_break_deterministically() {
        let keys = keys(&["k1"]);
        let results = vec![response(&["NodeB:9000", "NodeA:9000"])];
        let result = find_best_prefill(&keys, &results);
        assert!(result.hit);
        assert_eq!(result.node_id, "NodeA:9000");
    }
}
