// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! End-to-end completion flow against mock engine workers and a mock
//! object locator.

use std::sync::Arc;
use std::time::Duration;

use axum::{Json, Router, extract::State, routing::post};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use conductor::adapter::create_adapter;
use conductor::handler::{CompletionApi, RequestHandler};
use conductor::locator::{
    LocatorRequest, LocatorResponse, ObjectLocatorClient, ReplicaDescriptor, ReplicaListResponse,
};
use conductor::protocols::EngineConfig;
use conductor::scheduler::{PoolKind, WorkerPool};

#[derive(Clone)]
struct MockEngine {
    tokens: Vec<i64>,
    completion_reply: Value,
    requests: Arc<Mutex<Vec<Value>>>,
}

/// Serves `/v1/tokenize` and `/v1/completions` like a vLLM worker, recording
/// every completion body it receives.
async fn spawn_engine(tokens: Vec<i64>, completion_reply: Value) -> (u16, Arc<Mutex<Vec<Value>>>) {
    let requests = Arc::new(Mutex::new(Vec::new()));
    let state = MockEngine {
        tokens,
        completion_reply,
        requests: requests.clone(),
    };

    async fn tokenize(State(state): State<MockEngine>, Json(_): Json<Value>) -> Json<Value> {
        Json(json!({
            "tokens": state.tokens,
            "model": "test-model",
            "truncated": false
        }))
    }

    async fn completions(State(state): State<MockEngine>, Json(body): Json<Value>) -> Json<Value> {
        state.requests.lock().push(body);
        Json(state.completion_reply.clone())
    }

    let app = Router::new()
        .route("/v1/tokenize", post(tokenize))
        .route("/v1/completions", post(completions))
        .with_state(state);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (port, requests)
}

/// Serves batch replica lookups, reporting every key as held by `endpoint`.
async fn spawn_locator(endpoint: String) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let endpoint = endpoint.clone();
            tokio::spawn(async move {
                let mut framed = Framed::new(stream, LengthDelimitedCodec::new());
                while let Some(Ok(frame)) = framed.next().await {
                    let request: LocatorRequest = bincode::deserialize(&frame).unwrap();
                    let reply = match request {
                        LocatorRequest::ServiceReady => LocatorResponse::Ready,
                        LocatorRequest::GetReplicaList { .. } => {
                            LocatorResponse::ReplicaList(Ok(ReplicaListResponse {
                                replicas: vec![ReplicaDescriptor::complete_memory(
                                    endpoint.clone(),
                                    1024,
                                )],
                            }))
                        }
                        LocatorRequest::BatchGetReplicaList { keys } => {
                            LocatorResponse::BatchReplicaList(
                                keys.iter()
                                    .map(|_| {
                                        Ok(ReplicaListResponse {
                                            replicas: vec![ReplicaDescriptor::complete_memory(
                                                endpoint.clone(),
                                                1024,
                                            )],
                                        })
                                    })
                                    .collect(),
                            )
                        }
                    };
                    let payload = bincode::serialize(&reply).unwrap();
                    if framed.send(Bytes::from(payload)).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
    addr
}

fn engine_config(block_size: u32) -> EngineConfig {
    EngineConfig {
        model_name: "test-model".to_string(),
        block_size,
        ..Default::default()
    }
}

fn build_pools(
    prefill_ports: &[u16],
    decode_ports: &[u16],
) -> (Arc<WorkerPool>, Arc<WorkerPool>) {
    let prefill_instances: Vec<(String, u16)> = prefill_ports
        .iter()
        .map(|&port| ("127.0.0.1".to_string(), port))
        .collect();
    let decode_instances: Vec<(String, u16)> = decode_ports
        .iter()
        .map(|&port| ("127.0.0.1".to_string(), port))
        .collect();
    let prefillers = Arc::new(
        WorkerPool::new(PoolKind::Prefill, &prefill_instances, Duration::from_secs(1)).unwrap(),
    );
    let decoders = Arc::new(
        WorkerPool::new(PoolKind::Decode, &decode_instances, Duration::from_secs(1)).unwrap(),
    );
    (prefillers, decoders)
}

async fn collect_stream(
    stream: tokio_stream::wrappers::ReceiverStream<Result<Bytes, std::io::Error>>,
) -> String {
    let chunks: Vec<_> = stream.collect().await;
    chunks
        .into_iter()
        .map(|chunk| String::from_utf8_lossy(&chunk.unwrap()).to_string())
        .collect()
}

#[tokio::test]
async fn miss_falls_back_to_load_based_placement() {
    let prefill_reply = json!({
        "choices": [{"text": ""}],
        "kv_transfer_params": {"remote_host": "prefill-node", "remote_port": 14579}
    });
    let decode_reply = json!({
        "choices": [{"text": "hello from decode"}],
        "usage": {"completion_tokens": 4}
    });
    let (prefill_port, prefill_requests) = spawn_engine((1..=8).collect(), prefill_reply).await;
    let (decode_port, decode_requests) = spawn_engine(vec![], decode_reply).await;

    let (prefillers, decoders) = build_pools(&[prefill_port], &[decode_port]);
    let handler = Arc::new(RequestHandler::new(
        prefillers.clone(),
        decoders.clone(),
        create_adapter("vllm").unwrap(),
        None,
        engine_config(4),
        3,
        Duration::from_millis(1),
    ));

    let body = json!({"model": "test-model", "prompt": "tell me a story", "max_tokens": 8});
    let stream = handler
        .handle_completion(CompletionApi::Completions, body)
        .await
        .unwrap();
    let output = collect_stream(stream).await;
    assert!(output.contains("hello from decode"));

    // Prefill leg carried the transfer contract and pinned generation to one
    // token.
    let prefill_body = prefill_requests.lock().first().cloned().unwrap();
    assert_eq!(prefill_body["max_tokens"], 1);
    assert_eq!(prefill_body["min_tokens"], 1);
    assert_eq!(prefill_body["stream"], false);
    assert_eq!(prefill_body["kv_transfer_params"]["do_remote_decode"], true);

    // Decode leg restored the caller's limits and inherited the prefiller's
    // KV handle.
    let decode_body = decode_requests.lock().first().cloned().unwrap();
    assert_eq!(decode_body["max_tokens"], 8);
    assert_eq!(decode_body["kv_transfer_params"]["remote_host"], "prefill-node");

    // Both reservations were fully released.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(prefillers.worker(0).active_tokens(), 0);
    assert_eq!(prefillers.worker(0).active_kv_cache(), 0);
    assert_eq!(prefillers.worker(0).active_requests(), 0);
    assert_eq!(decoders.worker(0).active_tokens(), 0);
    assert_eq!(decoders.worker(0).active_requests(), 0);
}

#[tokio::test]
async fn cache_hit_routes_prefill_to_the_cached_node() {
    let prefill_reply = json!({"choices": [{"text": ""}], "kv_transfer_params": null});
    let decode_reply = json!({"choices": [{"text": "done"}], "usage": {"completion_tokens": 1}});

    let (cold_port, cold_requests) = spawn_engine((1..=8).collect(), prefill_reply.clone()).await;
    let (cached_port, cached_requests) = spawn_engine((1..=8).collect(), prefill_reply).await;
    let (decode_port, _) = spawn_engine(vec![], decode_reply).await;

    // Every block replica lives on the second prefiller.
    let locator_addr = spawn_locator(format!("127.0.0.1:{cached_port}")).await;
    let locator = Arc::new(ObjectLocatorClient::new(Duration::from_secs(1)));
    locator.connect(&locator_addr).await.unwrap();

    let (prefillers, decoders) = build_pools(&[cold_port, cached_port], &[decode_port]);
    let handler = Arc::new(RequestHandler::new(
        prefillers.clone(),
        decoders,
        create_adapter("vllm").unwrap(),
        Some(locator),
        engine_config(4),
        3,
        Duration::from_millis(1),
    ));

    let body = json!({"model": "test-model", "prompt": "cached prompt", "max_tokens": 4});
    let stream = handler
        .handle_completion(CompletionApi::Completions, body)
        .await
        .unwrap();
    let output = collect_stream(stream).await;
    assert!(output.contains("done"));

    // The planner's node, not the least-loaded one, got the prefill POST.
    assert_eq!(cached_requests.lock().len(), 1);
    assert!(cold_requests.lock().is_empty());
}

#[tokio::test]
async fn unreachable_decoder_fails_without_leaking_reservations() {
    let prefill_reply = json!({"choices": [{"text": ""}]});
    let (prefill_port, _) = spawn_engine((1..=8).collect(), prefill_reply).await;

    let (prefillers, decoders) = build_pools(&[prefill_port], &[1]);
    let handler = Arc::new(RequestHandler::new(
        prefillers.clone(),
        decoders.clone(),
        create_adapter("vllm").unwrap(),
        None,
        engine_config(4),
        2,
        Duration::from_millis(1),
    ));

    let body = json!({"prompt": "doomed", "max_tokens": 4});
    let stream = handler
        .handle_completion(CompletionApi::Completions, body)
        .await
        .unwrap();
    let output = collect_stream(stream).await;
    assert!(output.is_empty());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(prefillers.worker(0).active_tokens(), 0);
    assert_eq!(prefillers.worker(0).active_requests(), 0);
    assert_eq!(decoders.worker(0).active_tokens(), 0);
    assert_eq!(decoders.worker(0).active_requests(), 0);
}
