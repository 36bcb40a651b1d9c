// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Worker registry and load-aware scheduling.
//!
//! Each pool (prefill, decode) owns its workers and a min-heap of
//! `(priority, index)` entries guarded by one mutex. Priorities are
//! recomputed from the worker's atomic counters while the heap mutex is
//! held, so concurrent selections observe a consistent sequence of updates.
//! Every registered worker appears in its pool's heap exactly once;
//! unselectable workers are skipped during selection but keep their entry.

use std::collections::{BinaryHeap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use crate::error::ConductorError;

/// Health state machine per worker.
///
/// `Healthy -> Unhealthy` after N consecutive failed probes,
/// `Unhealthy -> Healthy` on the first success, `-> Draining` on admin
/// action, `Draining -> Removed` once the last request completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerHealth {
    Healthy,
    Unhealthy,
    Draining,
    Removed,
}

#[derive(Debug)]
struct HealthState {
    status: WorkerHealth,
    consecutive_failures: u32,
}

/// Live state for one prefill or decode endpoint.
#[derive(Debug)]
pub struct WorkerState {
    pub host: String,
    pub port: u16,
    pub base_url: String,
    pub client: reqwest::Client,

    active_tokens: AtomicI64,
    /// KV cache footprint pinned on the worker; tracked for prefillers only.
    active_kv_cache: AtomicI64,
    active_requests: AtomicI64,

    /// Client-cancelled request ids the worker must drop. Multi-reader,
    /// single-writer.
    aborted_requests: RwLock<HashSet<String>>,
    health: RwLock<HealthState>,
}

impl WorkerState {
    fn new(host: String, port: u16, connect_timeout: Duration) -> Result<Self, ConductorError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| ConductorError::ConfigInvalid(format!("http client: {e}")))?;
        Ok(Self {
            base_url: format!("http://{host}:{port}"),
            host,
            port,
            client,
            active_tokens: AtomicI64::new(0),
            active_kv_cache: AtomicI64::new(0),
            active_requests: AtomicI64::new(0),
            aborted_requests: RwLock::new(HashSet::new()),
            health: RwLock::new(HealthState {
                status: WorkerHealth::Healthy,
                consecutive_failures: 0,
            }),
        })
    }

    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn active_tokens(&self) -> i64 {
        self.active_tokens.load(Ordering::SeqCst)
    }

    pub fn active_kv_cache(&self) -> i64 {
        self.active_kv_cache.load(Ordering::SeqCst)
    }

    pub fn active_requests(&self) -> i64 {
        self.active_requests.load(Ordering::SeqCst)
    }

    pub fn health(&self) -> WorkerHealth {
        self.health.read().status
    }

    /// Only healthy workers are visible to selection.
    pub fn is_selectable(&self) -> bool {
        self.health.read().status == WorkerHealth::Healthy
    }
}

/// Decrements an accounting counter without letting it go negative.
fn sub_to_floor(counter: &AtomicI64, amount: i64) {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
            Some((current - amount).max(0))
        })
        .ok();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolKind {
    Prefill,
    Decode,
}

impl PoolKind {
    pub fn name(&self) -> &'static str {
        match self {
            PoolKind::Prefill => "prefill",
            PoolKind::Decode => "decode",
        }
    }
}

#[derive(Debug)]
struct HeapEntry {
    priority: f64,
    index: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.index == other.index
    }
}

impl Eq for HeapEntry {}

impl Ord for HeapEntry {
    // BinaryHeap is a max-heap; reverse so the lowest priority pops first,
    // with the lower index winning ties.
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .priority
            .total_cmp(&self.priority)
            .then_with(|| other.index.cmp(&self.index))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// One pool of workers with its selection heap.
pub struct WorkerPool {
    kind: PoolKind,
    workers: Vec<Arc<WorkerState>>,
    heap: Mutex<BinaryHeap<HeapEntry>>,
    /// Consecutive probe failures before a worker turns unhealthy.
    unhealthy_threshold: u32,
}

impl WorkerPool {
    pub fn new(
        kind: PoolKind,
        instances: &[(String, u16)],
        connect_timeout: Duration,
    ) -> Result<Self, ConductorError> {
        let workers = instances
            .iter()
            .map(|(host, port)| {
                WorkerState::new(host.clone(), *port, connect_timeout).map(Arc::new)
            })
            .collect::<Result<Vec<_>, _>>()?;
        let heap = workers
            .iter()
            .enumerate()
            .map(|(index, _)| HeapEntry {
                priority: 0.0,
                index,
            })
            .collect();
        Ok(Self {
            kind,
            workers,
            heap: Mutex::new(heap),
            unhealthy_threshold: 3,
        })
    }

    pub fn kind(&self) -> PoolKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn worker(&self, index: usize) -> &Arc<WorkerState> {
        &self.workers[index]
    }

    pub fn workers(&self) -> &[Arc<WorkerState>] {
        &self.workers
    }

    fn priority_of(&self, worker: &WorkerState) -> f64 {
        let tokens = worker.active_tokens() as f64;
        match self.kind {
            PoolKind::Prefill => tokens + 0.3 * worker.active_kv_cache() as f64,
            PoolKind::Decode => tokens,
        }
    }

    /// Removes the worker's heap entry (linear scan; pools are tens of
    /// workers) and reinserts it with a freshly computed priority.
    fn reposition(&self, heap: &mut BinaryHeap<HeapEntry>, index: usize) {
        heap.retain(|entry| entry.index != index);
        heap.push(HeapEntry {
            priority: self.priority_of(&self.workers[index]),
            index,
        });
    }

    fn reserve_counters(&self, worker: &WorkerState, token_count: i64) {
        worker.active_tokens.fetch_add(token_count, Ordering::SeqCst);
        if self.kind == PoolKind::Prefill {
            worker
                .active_kv_cache
                .fetch_add(token_count, Ordering::SeqCst);
        }
        worker.active_requests.fetch_add(1, Ordering::SeqCst);
    }

    /// Pops the least-loaded selectable worker, reserves `token_count`
    /// against it and reinserts it with its new priority.
    pub fn select(&self, token_count: i64) -> Result<usize, ConductorError> {
        let mut heap = self.heap.lock();
        let mut skipped = Vec::new();
        let chosen = loop {
            match heap.pop() {
                Some(entry) if self.workers[entry.index].is_selectable() => break entry,
                Some(entry) => skipped.push(entry),
                None => {
                    // Put unselectable entries back before failing so every
                    // worker keeps exactly one heap entry.
                    heap.extend(skipped);
                    return Err(ConductorError::NoCapacity(self.kind.name()));
                }
            }
        };
        heap.extend(skipped);

        self.reserve_counters(&self.workers[chosen.index], token_count);
        self.reposition(&mut heap, chosen.index);
        Ok(chosen.index)
    }

    /// Reserves capacity on a specific worker chosen by the planner.
    pub fn reserve_at(&self, index: usize, token_count: i64) -> Result<(), ConductorError> {
        let mut heap = self.heap.lock();
        if !self.workers[index].is_selectable() {
            return Err(ConductorError::NoCapacity(self.kind.name()));
        }
        self.reserve_counters(&self.workers[index], token_count);
        self.reposition(&mut heap, index);
        Ok(())
    }

    /// Releases a reservation made by `select` / `reserve_at`.
    pub fn release(&self, index: usize, token_count: i64) {
        let worker = &self.workers[index];
        let mut heap = self.heap.lock();
        sub_to_floor(&worker.active_tokens, token_count);
        sub_to_floor(&worker.active_requests, 1);
        self.reposition(&mut heap, index);
        drop(heap);
        self.finish_drain_if_idle(index);
    }

    /// Releases the pinned KV footprint once the decode side has taken over.
    /// Prefill pool only.
    pub fn release_kv(&self, index: usize, token_count: i64) {
        let worker = &self.workers[index];
        let mut heap = self.heap.lock();
        if worker.active_kv_cache() > 0 {
            sub_to_floor(&worker.active_kv_cache, token_count);
        }
        self.reposition(&mut heap, index);
    }

    /// Flags a client-cancelled request so the next status sync to the
    /// worker carries it. Set semantics: flagging twice stores one id.
    pub fn abort_request(&self, index: usize, request_id: &str) {
        self.workers[index]
            .aborted_requests
            .write()
            .insert(request_id.to_string());
    }

    /// Atomically swaps out the pending abort set. Idempotent on empty sets.
    pub fn drain_aborted(&self, index: usize) -> HashSet<String> {
        std::mem::take(&mut *self.workers[index].aborted_requests.write())
    }

    /// Records a health probe outcome and advances the state machine.
    pub fn record_probe(&self, index: usize, healthy: bool) {
        let worker = &self.workers[index];
        let mut health = worker.health.write();
        match health.status {
            WorkerHealth::Draining | WorkerHealth::Removed => {}
            WorkerHealth::Healthy | WorkerHealth::Unhealthy => {
                if healthy {
                    if health.status == WorkerHealth::Unhealthy {
                        tracing::info!(
                            pool = self.kind.name(),
                            endpoint = %worker.endpoint(),
                            "worker recovered"
                        );
                    }
                    health.status = WorkerHealth::Healthy;
                    health.consecutive_failures = 0;
                } else {
                    health.consecutive_failures += 1;
                    if health.status == WorkerHealth::Healthy
                        && health.consecutive_failures >= self.unhealthy_threshold
                    {
                        tracing::warn!(
                            pool = self.kind.name(),
                            endpoint = %worker.endpoint(),
                            failures = health.consecutive_failures,
                            "worker marked unhealthy"
                        );
                        health.status = WorkerHealth::Unhealthy;
                    }
                }
            }
        }
    }

    /// Blocks new assignments; existing requests run to completion.
    pub fn drain_worker(&self, index: usize) {
        let worker = &self.workers[index];
        {
            let mut health = worker.health.write();
            if matches!(
                health.status,
                WorkerHealth::Healthy | WorkerHealth::Unhealthy
            ) {
                health.status = WorkerHealth::Draining;
                tracing::info!(
                    pool = self.kind.name(),
                    endpoint = %worker.endpoint(),
                    "worker draining"
                );
            }
        }
        self.finish_drain_if_idle(index);
    }

    fn finish_drain_if_idle(&self, index: usize) {
        let worker = &self.workers[index];
        let mut health = worker.health.write();
        if health.status == WorkerHealth::Draining && worker.active_requests() == 0 {
            health.status = WorkerHealth::Removed;
            tracing::info!(
                pool = self.kind.name(),
                endpoint = %worker.endpoint(),
                "worker removed"
            );
        }
    }

    /// Any selectable worker, preferring the least loaded. Used for
    /// side-channel calls like tokenization.
    pub fn first_selectable(&self) -> Option<usize> {
        let heap = self.heap.lock();
        heap.iter()
            .filter(|entry| self.workers[entry.index].is_selectable())
            .min_by(|a, b| a.priority.total_cmp(&b.priority).then(a.index.cmp(&b.index)))
            .map(|entry| entry.index)
    }

    #[cfg(test)]
    fn heap_len(&self) -> usize {
        self.heap.lock().len()
    }

    /// Maps a locator transport endpoint back to a worker index, matching
    /// `host:port` exactly or falling back to the host alone.
    pub fn find_by_endpoint(&self, endpoint: &str) -> Option<usize> {
        if let Some(index) = self
            .workers
            .iter()
            .position(|worker| worker.endpoint() == endpoint)
        {
            return Some(index);
        }
        let host = endpoint.split(':').next()?;
        self.workers.iter().position(|worker| worker.host == host)
    }
}
