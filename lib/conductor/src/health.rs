// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Periodic worker health probing.
//!
//! Each tick, every worker in both pools gets the adapter's health request
//! with a bounded timeout; outcomes feed the pool's health state machine,
//! which is what makes unhealthy workers invisible to selection.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::adapter::EngineAdapter;
use crate::scheduler::WorkerPool;

/// Default per-probe timeout; `MOONCAKE_CONDUCTOR_TIMEOUT` overrides it.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(500);

pub struct HealthProber {
    pools: Vec<Arc<WorkerPool>>,
    adapter: Arc<dyn EngineAdapter>,
    interval: Duration,
    timeout: Duration,
}

impl HealthProber {
    pub fn new(
        pools: Vec<Arc<WorkerPool>>,
        adapter: Arc<dyn EngineAdapter>,
        interval: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            pools,
            adapter,
            interval,
            timeout,
        }
    }

    /// Runs until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!("health prober shutting down");
                    return;
                }
                _ = ticker.tick() => {}
            }
            self.probe_all().await;
        }
    }

    async fn probe_all(&self) {
        for pool in &self.pools {
            let probes = pool
                .workers()
                .iter()
                .enumerate()
                .map(|(index, worker)| {
                    let adapter = self.adapter.clone();
                    let worker = worker.clone();
                    let timeout = self.timeout;
                    async move { (index, probe_worker(&*adapter, &worker, timeout).await) }
                })
                .collect::<Vec<_>>();

            for (index, healthy) in futures::future::join_all(probes).await {
                pool.record_probe(index, healthy);
            }
        }
    }
}

async fn probe_worker(
    adapter: &dyn EngineAdapter,
    worker: &crate::scheduler::WorkerState,
    timeout: Duration,
) -> bool {
    let spec = adapter.health_request(&adapter.health_endpoint(&worker.base_url));
    let request = worker.client.get(&spec.url).timeout(timeout);
    match request.send().await {
        Ok(response) => match response.text().await {
            Ok(body) => adapter.parse_health_response(&body),
            Err(e) => {
                tracing::debug!(endpoint = %worker.endpoint(), error = %e, "health body read failed");
                false
            }
        },
        Err(e) => {
            tracing::debug!(endpoint = %worker.endpoint(), error = %e, "health probe failed");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::create_adapter;
    use crate::scheduler::{PoolKind, WorkerHealth};
    use axum::{Json, Router, routing::get};
    use serde_json::json;

    async fn spawn_worker(healthy: bool) -> u16 {
        let app = Router::new().route(
            "/health",
            get(move || async move {
                if healthy {
                    Json(json!({"status": "healthy"}))
                } else {
                    Json(json!({"status": "unhealthy"}))
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        port
    }

    #[tokio::test]
    async fn probe_marks_unreachable_worker_unhealthy() {
        let healthy_port = spawn_worker(true).await;
        let instances = vec![
            ("127.0.0.1".to_string(), healthy_port),
            // Nothing listens on port 1.
            ("127.0.0.1".to_string(), 1),
        ];
        let pool = Arc::new(
            WorkerPool::new(PoolKind::Prefill, &instances, Duration::from_millis(200)).unwrap(),
        );
        let adapter = create_adapter("vllm").unwrap();
        let prober = HealthProber::new(
            vec![pool.clone()],
            adapter,
            Duration::from_millis(10),
            Duration::from_millis(200),
        );

        for _ in 0..3 {
            prober.probe_all().await;
        }
        assert_eq!(pool.worker(0).health(), WorkerHealth::Healthy);
        assert_eq!(pool.worker(1).health(), WorkerHealth::Unhealthy);
    }

    #[tokio::test]
    async fn unhealthy_status_body_counts_as_failure() {
        let port = spawn_worker(false).await;
        let instances = vec![("127.0.0.1".to_string(), port)];
        let pool = Arc::new(
            WorkerPool::new(PoolKind::Decode, &instances, Duration::from_millis(200)).unwrap(),
        );
        let adapter = create_adapter("vllm").unwrap();
        let prober = HealthProber::new(
            vec![pool.clone()],
            adapter,
            Duration::from_millis(10),
            Duration::from_millis(200),
        );

        for _ in 0..3 {
            prober.probe_all().await;
        }
        assert_eq!(pool.worker(0).health(), WorkerHealth::Unhealthy);
    }
}
