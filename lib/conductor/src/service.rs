// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! HTTP frontend: the OpenAI-compatible completion surface plus a health
//! report. This layer is a thin reverse proxy around the request handler;
//! all routing logic lives behind it.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    body::Body,
    extract::State,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde_json::{Value, json};

use crate::adapter::create_adapter;
use crate::config::ConductorConfig;
use crate::error::ConductorError;
use crate::handler::{CompletionApi, RequestHandler};
use crate::health::HealthProber;
use crate::locator::ObjectLocatorClient;
use crate::scheduler::{PoolKind, WorkerPool};

const FAILURE_BODY: &str = "Failed to handle request.";

#[derive(Clone)]
pub struct AppState {
    pub handler: Arc<RequestHandler>,
}

/// Builds the axum router for the conductor's client-facing surface.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/completions", post(completions))
        .route("/v1/chat/completions", post(chat_completions))
        .route("/healthcheck", get(healthcheck))
        .with_state(state)
}

/// Wires the full runtime from validated configuration: pools, adapter,
/// locator connection, engine config discovery and the health prober.
pub async fn build_app(
    config: &ConductorConfig,
    probe_timeout: Duration,
) -> Result<(AppState, HealthProber), ConductorError> {
    let adapter = create_adapter(&config.engine)?;

    let prefillers = Arc::new(WorkerPool::new(
        PoolKind::Prefill,
        &config.prefiller_instances,
        probe_timeout,
    )?);
    let decoders = Arc::new(WorkerPool::new(
        PoolKind::Decode,
        &config.decoder_instances,
        probe_timeout,
    )?);

    let locator = match &config.locator_addr {
        Some(addr) => {
            let client = Arc::new(ObjectLocatorClient::new(probe_timeout));
            client.connect(addr).await?;
            Some(client)
        }
        None => {
            tracing::warn!("no object locator configured; cache-aware planning disabled");
            None
        }
    };

    // The engine reports its own block size; fall back to the documented
    // default when the worker cannot be reached at startup.
    let mut engine_config = discover_engine_config(&prefillers, &*adapter, probe_timeout).await;
    if let Some(block_size) = config.block_size {
        engine_config.block_size = block_size;
    }
    tracing::info!(
        model = %engine_config.model_name,
        block_size = engine_config.block_size,
        "engine configuration resolved"
    );

    let handler = Arc::new(RequestHandler::new(
        prefillers.clone(),
        decoders.clone(),
        adapter.clone(),
        locator,
        engine_config,
        config.max_retries,
        config.retry_delay,
    ));

    let prober = HealthProber::new(
        vec![prefillers, decoders],
        adapter,
        Duration::from_secs(3),
        probe_timeout,
    );

    Ok((AppState { handler }, prober))
}

async fn discover_engine_config(
    prefillers: &WorkerPool,
    adapter: &dyn crate::adapter::EngineAdapter,
    timeout: Duration,
) -> crate::protocols::EngineConfig {
    for worker in prefillers.workers() {
        let endpoint = adapter.models_endpoint(&worker.base_url);
        let response = worker.client.get(&endpoint).timeout(timeout).send().await;
        if let Ok(response) = response
            && let Ok(body) = response.text().await
        {
            return adapter.parse_config_response(&body);
        }
    }
    tracing::warn!("could not fetch engine config from any prefiller; using defaults");
    crate::protocols::EngineConfig::default()
}

async fn completions(State(state): State<AppState>, Json(body): Json<Value>) -> Response {
    handle(state, CompletionApi::Completions, body).await
}

async fn chat_completions(State(state): State<AppState>, Json(body): Json<Value>) -> Response {
    handle(state, CompletionApi::ChatCompletions, body).await
}

async fn handle(state: AppState, api: CompletionApi, body: Value) -> Response {
    tracing::info!(api = api.name(), "received completion request");
    match state.handler.handle_completion(api, body).await {
        Ok(stream) => Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from_stream(stream))
            .unwrap_or_else(|_| internal_error()),
        Err(e) => {
            tracing::error!(api = api.name(), error = %e, "failed to handle request");
            internal_error()
        }
    }
}

fn internal_error() -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        [(header::CONTENT_TYPE, "application/json")],
        FAILURE_BODY,
    )
        .into_response()
}

async fn healthcheck(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "prefill_instances": state.handler.prefiller_count(),
        "decode_instances": state.handler.decoder_count(),
    }))
}
