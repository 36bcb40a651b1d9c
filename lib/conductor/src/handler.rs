// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! End-to-end completion orchestration.
//!
//! One request flows tokenize -> hash -> key -> locator lookup -> plan ->
//! reserve -> prefill -> decode stream. Reservations are held through RAII
//! leases so a failure or a dropped future unwinds through the slot-release
//! path, and a cancelled request leaves its id in the prefill worker's abort
//! set for the next status sync.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use conductor_tokens::{BlockHasher, Token};
use futures::StreamExt;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::adapter::EngineAdapter;
use crate::error::ConductorError;
use crate::keys::LogicalCacheKey;
use crate::locator::ObjectLocatorClient;
use crate::planner::{BestPrefillResult, find_best_prefill};
use crate::protocols::{EngineConfig, KvTransferParams};
use crate::scheduler::WorkerPool;

/// Which completion surface a request came in on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionApi {
    Completions,
    ChatCompletions,
}

impl CompletionApi {
    pub fn name(&self) -> &'static str {
        match self {
            CompletionApi::Completions => "/v1/completions",
            CompletionApi::ChatCompletions => "/v1/chat/completions",
        }
    }

    fn endpoint(&self, adapter: &dyn EngineAdapter, base_url: &str) -> String {
        match self {
            CompletionApi::Completions => adapter.completions_endpoint(base_url),
            CompletionApi::ChatCompletions => adapter.chat_completions_endpoint(base_url),
        }
    }
}

/// Holds a prefill reservation. Dropping the lease before `finish` releases
/// whatever is still held and flags the request as aborted on the worker,
/// which is exactly what a cancelled in-flight request needs.
struct PrefillLease {
    pool: Arc<WorkerPool>,
    index: usize,
    tokens: i64,
    request_id: String,
    tokens_released: bool,
    kv_released: bool,
    finished: bool,
}

impl PrefillLease {
    fn new(pool: Arc<WorkerPool>, index: usize, tokens: i64, request_id: String) -> Self {
        Self {
            pool,
            index,
            tokens,
            request_id,
            tokens_released: false,
            kv_released: false,
            finished: false,
        }
    }

    /// Prefill completed; its token reservation comes off the heap priority.
    fn release_tokens(&mut self) {
        if !self.tokens_released {
            self.pool.release(self.index, self.tokens);
            self.tokens_released = true;
        }
    }

    /// The decode side produced output, so the prefill KV handoff is done.
    fn release_kv(&mut self) {
        if !self.kv_released {
            self.pool.release_kv(self.index, self.tokens);
            self.kv_released = true;
        }
    }

    /// Normal or failed completion: release remaining state, no abort flag.
    fn finish(mut self) {
        self.release_tokens();
        self.release_kv();
        self.finished = true;
    }
}

impl Drop for PrefillLease {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        // Unwound without finishing: the worker may hold partial state for
        // this request, so flag it for the next abort sync.
        self.pool.abort_request(self.index, &self.request_id);
        tracing::warn!(
            request_id = %self.request_id,
            prefiller = self.index,
            "request unwound before completion; flagged abort on prefill worker"
        );
        if !self.tokens_released {
            self.pool.release(self.index, self.tokens);
            self.tokens_released = true;
        }
        if !self.kv_released {
            self.pool.release_kv(self.index, self.tokens);
            self.kv_released = true;
        }
    }
}

/// Holds a decode reservation; released exactly once on drop.
struct DecodeLease {
    pool: Arc<WorkerPool>,
    index: usize,
    tokens: i64,
}

impl Drop for DecodeLease {
    fn drop(&mut self) {
        self.pool.release(self.index, self.tokens);
    }
}

/// A placed request: both slots reserved, prefill already executed.
struct InstanceInfo {
    request_id: String,
    prefill_lease: PrefillLease,
    decode_index: usize,
    decode_lease: DecodeLease,
}

pub struct RequestHandler {
    prefillers: Arc<WorkerPool>,
    decoders: Arc<WorkerPool>,
    adapter: Arc<dyn EngineAdapter>,
    locator: Option<Arc<ObjectLocatorClient>>,
    engine_config: EngineConfig,
    max_retries: u32,
    retry_delay: Duration,
}

impl RequestHandler {
    pub fn new(
        prefillers: Arc<WorkerPool>,
        decoders: Arc<WorkerPool>,
        adapter: Arc<dyn EngineAdapter>,
        locator: Option<Arc<ObjectLocatorClient>>,
        engine_config: EngineConfig,
        max_retries: u32,
        retry_delay: Duration,
    ) -> Self {
        Self {
            prefillers,
            decoders,
            adapter,
            locator,
            engine_config,
            max_retries,
            retry_delay,
        }
    }

    pub fn prefiller_count(&self) -> usize {
        self.prefillers.len()
    }

    pub fn decoder_count(&self) -> usize {
        self.decoders.len()
    }

    /// Runs placement and prefill, then returns the decode byte stream.
    /// Errors before the stream starts surface here; later failures unwind
    /// inside the stream task through the lease guards.
    pub async fn handle_completion(
        self: &Arc<Self>,
        api: CompletionApi,
        mut body: Value,
    ) -> Result<ReceiverStream<Result<Bytes, std::io::Error>>, ConductorError> {
        let request_id = body
            .get("request_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let instance = self.dispatch(api, &mut body, &request_id).await?;

        let (tx, rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(64);
        let handler = self.clone();
        tokio::spawn(async move {
            handler.run_stream(instance, api, body, tx).await;
        });
        Ok(ReceiverStream::new(rx))
    }

    /// Tokenize, plan against the cache, reserve a prefill slot, execute the
    /// prefill leg, then reserve a decode slot.
    async fn dispatch(
        &self,
        api: CompletionApi,
        body: &mut Value,
        request_id: &str,
    ) -> Result<InstanceInfo, ConductorError> {
        let (token_ids, token_count) = self.tokenize(body, request_id).await?;

        let planned = match &token_ids {
            Some(tokens) => self.plan_prefill(tokens, request_id).await,
            None => None,
        };

        let prefill_index = match planned {
            Some(index) if self.prefillers.reserve_at(index, token_count).is_ok() => index,
            _ => self.prefillers.select(token_count)?,
        };
        let mut prefill_lease = PrefillLease::new(
            self.prefillers.clone(),
            prefill_index,
            token_count,
            request_id.to_string(),
        );

        let prefill_reply = match self
            .send_prefill(api, prefill_index, body, request_id)
            .await
        {
            Ok(reply) => reply,
            Err(e) => {
                tracing::error!(request_id, error = %e, "prefill dispatch failed");
                prefill_lease.finish();
                return Err(e);
            }
        };
        prefill_lease.release_tokens();

        // Thread the worker's KV handle into the decode request.
        if let Some(params) = prefill_reply.get("kv_transfer_params")
            && !params.is_null()
            && let Some(object) = body.as_object_mut()
        {
            object.insert("kv_transfer_params".to_string(), params.clone());
        }

        let decode_index = match self.decoders.select(token_count) {
            Ok(index) => index,
            Err(e) => {
                prefill_lease.finish();
                return Err(e);
            }
        };
        tracing::info!(
            request_id,
            prefiller = %self.prefillers.worker(prefill_index).endpoint(),
            decoder = %self.decoders.worker(decode_index).endpoint(),
            tokens = token_count,
            "request placed"
        );
        Ok(InstanceInfo {
            request_id: request_id.to_string(),
            prefill_lease,
            decode_index,
            decode_lease: DecodeLease {
                pool: self.decoders.clone(),
                index: decode_index,
                tokens: token_count,
            },
        })
    }

    /// Tokenizes the prompt on any healthy prefill worker. A failed or
    /// malformed reply degrades to a byte-length estimate and disables
    /// cache-aware planning for this request.
    async fn tokenize(
        &self,
        body: &Value,
        request_id: &str,
    ) -> Result<(Option<Vec<Token>>, i64), ConductorError> {
        let prompt = extract_prompt(body);
        let estimate = estimate_token_count(body);
        if prompt.is_empty() {
            return Ok((None, estimate));
        }
        let Some(index) = self.prefillers.first_selectable() else {
            return Err(ConductorError::NoCapacity("prefill"));
        };
        let worker = self.prefillers.worker(index);
        let endpoint = self.adapter.tokenize_endpoint(&worker.base_url);
        let spec = self.adapter.tokenization_request(&prompt, &endpoint);
        let raw = match self
            .post_with_retry(&worker.client, &spec.url, spec.body.as_deref(), request_id)
            .await
        {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(
                    request_id,
                    error = %e,
                    "tokenization failed; falling back to length estimate"
                );
                return Ok((None, estimate));
            }
        };
        let result = self.adapter.parse_tokenization_response(&raw);
        if !result.is_ok() || result.token_ids.is_empty() {
            tracing::warn!(
                request_id,
                error = %result.error_message,
                "tokenization reply unusable; falling back to length estimate"
            );
            return Ok((None, estimate));
        }
        Ok((Some(result.token_ids), result.token_count as i64))
    }

    /// Cache-aware placement: hash the prompt, expand per-rank physical keys,
    /// batch-query the locator and take the longest-prefix node across ranks.
    /// Any serialization or hashing failure downgrades the request to
    /// load-only placement.
    async fn plan_prefill(&self, token_ids: &[Token], request_id: &str) -> Option<usize> {
        let locator = self.locator.as_ref()?;
        let chain = match BlockHasher::new(self.engine_config.block_size as usize)
            .hash_chain(token_ids)
        {
            Ok(chain) => chain,
            Err(e) => {
                tracing::error!(
                    request_id,
                    error = %ConductorError::from(e),
                    "block hashing failed; falling back to load-only placement"
                );
                return None;
            }
        };
        if chain.is_empty() {
            return None;
        }

        let world_size = self.prefillers.len() as u32;
        let logical = LogicalCacheKey::new(self.engine_config.model_name.clone(), world_size, chain);

        let mut all_keys = Vec::new();
        let mut rank_spans = Vec::with_capacity(world_size as usize);
        for rank in 0..world_size {
            let keys = match logical.physical_keys_for_rank(rank, self.adapter.engine_tag()) {
                Ok(keys) => keys,
                Err(e) => {
                    tracing::warn!(request_id, error = %e, "physical key generation failed");
                    return None;
                }
            };
            rank_spans.push((all_keys.len(), keys.len()));
            all_keys.extend(keys);
        }

        let results = locator.batch_get_replica_list(&all_keys).await;
        if results.len() != all_keys.len() {
            return None;
        }

        let mut best: Option<BestPrefillResult> = None;
        for (start, len) in rank_spans {
            let result = find_best_prefill(&all_keys[start..start + len], &results[start..start + len]);
            if result.hit
                && best
                    .as_ref()
                    .is_none_or(|current| result.best_index > current.best_index)
            {
                best = Some(result);
            }
        }
        let best = best?;

        let index = self.prefillers.find_by_endpoint(&best.node_id);
        match index {
            Some(index) => {
                tracing::info!(
                    request_id,
                    node = %best.node_id,
                    cached_blocks = best.best_index + 1,
                    "cache hit; routing prefill to cached node"
                );
                Some(index)
            }
            None => {
                tracing::warn!(
                    request_id,
                    node = %best.node_id,
                    "planner chose a node with no registered prefill worker"
                );
                None
            }
        }
    }

    /// Executes the prefill leg: one token, no streaming, carrying the KV
    /// transfer contract and any drained abort ids for that worker.
    async fn send_prefill(
        &self,
        api: CompletionApi,
        prefill_index: usize,
        body: &Value,
        request_id: &str,
    ) -> Result<Value, ConductorError> {
        let worker = self.prefillers.worker(prefill_index);
        let aborted: Vec<String> = self
            .prefillers
            .drain_aborted(prefill_index)
            .into_iter()
            .collect();

        let mut prefill_body = body.clone();
        let object = prefill_body
            .as_object_mut()
            .ok_or_else(|| ConductorError::MalformedResponse("request body is not an object".into()))?;
        object.insert(
            "kv_transfer_params".to_string(),
            serde_json::to_value(KvTransferParams::for_prefill(aborted))
                .map_err(|e| ConductorError::Serialization(e.to_string()))?,
        );
        object.insert("stream".to_string(), json!(false));
        object.insert("max_tokens".to_string(), json!(1));
        object.insert("min_tokens".to_string(), json!(1));
        object.remove("stream_options");

        let endpoint = api.endpoint(&*self.adapter, &worker.base_url);
        let raw = self
            .post_with_retry(
                &worker.client,
                &endpoint,
                Some(&prefill_body.to_string()),
                request_id,
            )
            .await?;
        serde_json::from_str(&raw)
            .map_err(|e| ConductorError::MalformedResponse(format!("prefill reply: {e}")))
    }

    /// POST with bounded exponential backoff. Only transport-level failures
    /// and non-success statuses are retried.
    async fn post_with_retry(
        &self,
        client: &reqwest::Client,
        endpoint: &str,
        body: Option<&str>,
        request_id: &str,
    ) -> Result<String, ConductorError> {
        let mut last_error = ConductorError::TransientNetwork("no attempts made".to_string());
        for attempt in 1..=self.max_retries.max(1) {
            let mut request = client
                .post(endpoint)
                .header("X-Request-Id", request_id)
                .header("Content-Type", "application/json");
            if let Some(body) = body {
                request = request.body(body.to_string());
            }
            match request.send().await {
                Ok(response) if response.status().is_success() => {
                    return response.text().await.map_err(|e| {
                        ConductorError::TransientNetwork(format!("{endpoint}: {e}"))
                    });
                }
                Ok(response) => {
                    last_error = ConductorError::TransientNetwork(format!(
                        "{endpoint} returned {}",
                        response.status()
                    ));
                }
                Err(e) => {
                    last_error = ConductorError::TransientNetwork(format!("{endpoint}: {e}"));
                }
            }
            if attempt < self.max_retries.max(1) {
                tracing::warn!(request_id, endpoint, attempt, error = %last_error, "retrying");
                tokio::time::sleep(backoff_delay(self.retry_delay, attempt)).await;
            }
        }
        tracing::error!(request_id, endpoint, "all {} attempts failed", self.max_retries.max(1));
        Err(last_error)
    }

    /// Opens the decode stream, retrying only until the first chunk has been
    /// forwarded to the client.
    async fn open_decode_stream(
        &self,
        decode_index: usize,
        api: CompletionApi,
        body: &Value,
        request_id: &str,
    ) -> Result<reqwest::Response, ConductorError> {
        let worker = self.decoders.worker(decode_index);
        let endpoint = api.endpoint(&*self.adapter, &worker.base_url);
        let mut last_error = ConductorError::TransientNetwork("no attempts made".to_string());
        for attempt in 1..=self.max_retries.max(1) {
            match worker
                .client
                .post(&endpoint)
                .header("X-Request-Id", request_id)
                .header("Content-Type", "application/json")
                .body(body.to_string())
                .send()
                .await
            {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) => {
                    last_error = ConductorError::TransientNetwork(format!(
                        "{endpoint} returned {}",
                        response.status()
                    ));
                }
                Err(e) => {
                    last_error = ConductorError::TransientNetwork(format!("{endpoint}: {e}"));
                }
            }
            if attempt < self.max_retries.max(1) {
                tracing::warn!(request_id, endpoint, attempt, error = %last_error, "retrying decode stream");
                tokio::time::sleep(backoff_delay(self.retry_delay, attempt)).await;
            }
        }
        Err(last_error)
    }

    /// Streams decode output back to the client, restarting placement when
    /// the decoder reports a recomputed sequence, and unwinding through the
    /// leases on error or client disconnect.
    async fn run_stream(
        self: Arc<Self>,
        mut instance: InstanceInfo,
        api: CompletionApi,
        mut body: Value,
        tx: mpsc::Sender<Result<Bytes, std::io::Error>>,
    ) {
        let stream_flag = body.get("stream").and_then(Value::as_bool).unwrap_or(false);
        let chat_flag = body.get("messages").is_some();
        let origin_prompt = extract_prompt(&body);
        let origin_max_tokens = body.get("max_tokens").and_then(Value::as_u64).unwrap_or(16);

        let mut generated = String::new();
        let mut completion_tokens: u64 = 0;
        let mut retry_count: u64 = 0;

        'restart: loop {
            let response = match self
                .open_decode_stream(instance.decode_index, api, &body, &instance.request_id)
                .await
            {
                Ok(response) => response,
                Err(e) => {
                    tracing::error!(request_id = %instance.request_id, error = %e, "decode dispatch failed");
                    // Leases drop here: decode slot released, prefill flagged.
                    return;
                }
            };

            let mut chunks = response.bytes_stream();
            while let Some(chunk) = chunks.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        tracing::error!(
                            request_id = %instance.request_id,
                            decoder = %self.decoders.worker(instance.decode_index).endpoint(),
                            error = %e,
                            "decode stream interrupted; aborted request will be flagged to the prefiller"
                        );
                        // PrefillLease::drop flags the abort.
                        return;
                    }
                };
                if !chunk.is_empty() {
                    instance.prefill_lease.release_kv();
                }

                let chunk_str = String::from_utf8_lossy(&chunk);
                let trimmed = strip_data_prefix(chunk_str.trim());
                if trimmed.is_empty() {
                    continue;
                }
                let Ok(chunk_json) = serde_json::from_str::<Value>(trimmed) else {
                    // Keep-alives and [DONE] markers pass through untouched.
                    if forward(&tx, chunk.clone()).await.is_err() {
                        self.client_disconnected(&instance);
                        return;
                    }
                    continue;
                };
                let Some(choice) = chunk_json
                    .get("choices")
                    .and_then(Value::as_array)
                    .and_then(|choices| choices.first())
                else {
                    if forward(&tx, chunk.clone()).await.is_err() {
                        self.client_disconnected(&instance);
                        return;
                    }
                    continue;
                };

                generated.push_str(&choice_content(choice));
                completion_tokens += if stream_flag {
                    1
                } else {
                    chunk_json
                        .get("usage")
                        .and_then(|usage| usage.get("completion_tokens"))
                        .and_then(Value::as_u64)
                        .unwrap_or(0)
                };

                if choice.get("stop_reason").and_then(Value::as_str) == Some("recomputed") {
                    // The decoder lost the sequence; replay the request with
                    // the text generated so far through fresh placement.
                    retry_count += 1;
                    rewrite_prompt(&mut body, chat_flag, &origin_prompt, &generated);
                    let remaining = origin_max_tokens
                        .saturating_sub(completion_tokens)
                        .saturating_add(retry_count);
                    if let Some(object) = body.as_object_mut() {
                        object.insert("max_tokens".to_string(), json!(remaining));
                    }

                    let request_id = instance.request_id.clone();
                    // Old leases wind down cleanly: prefill finished its leg,
                    // decode slot frees on drop.
                    instance.prefill_lease.release_kv();
                    let old = std::mem::replace(
                        &mut instance,
                        match self.dispatch(api, &mut body, &request_id).await {
                            Ok(new_instance) => new_instance,
                            Err(e) => {
                                tracing::error!(request_id = %request_id, error = %e, "re-dispatch after recompute failed");
                                return;
                            }
                        },
                    );
                    old.prefill_lease.finish();
                    drop(old.decode_lease);
                    continue 'restart;
                }

                let payload = if retry_count > 0 && !stream_flag {
                    // Replayed non-streaming replies carry only the tail; the
                    // client must see the full accumulated text.
                    let mut rewritten = chunk_json.clone();
                    rewrite_choice_content(&mut rewritten, chat_flag, &generated);
                    Bytes::from(rewritten.to_string())
                } else {
                    chunk.clone()
                };
                if forward(&tx, payload).await.is_err() {
                    self.client_disconnected(&instance);
                    return;
                }
            }

            // Stream ended normally.
            instance.prefill_lease.finish();
            drop(instance.decode_lease);
            tracing::debug!(request_id = %instance.request_id, "completion finished");
            return;
        }
    }

    fn client_disconnected(&self, instance: &InstanceInfo) {
        tracing::warn!(
            request_id = %instance.request_id,
            error = %ConductorError::ClientCancelled,
            "releasing slots and flagging abort"
        );
        // Leases flag the abort and release slots when `instance` drops.
    }
}

async fn forward(
    tx: &mpsc::Sender<Result<Bytes, std::io::Error>>,
    chunk: Bytes,
) -> Result<(), ()> {
    tx.send(Ok(chunk)).await.map_err(|_| ())
}

/// Exponential backoff: `base * 2^(attempt-1)`.
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(1u32 << (attempt - 1).min(16))
}

/// The prompt text: `prompt` for completions, first message content for chat.
fn extract_prompt(body: &Value) -> String {
    if let Some(prompt) = body.get("prompt").and_then(Value::as_str) {
        return prompt.to_string();
    }
    body.get("messages")
        .and_then(Value::as_array)
        .and_then(|messages| messages.first())
        .and_then(|message| message.get("content"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// Rough token estimate from the serialized request size, used when
/// tokenization is unavailable.
fn estimate_token_count(body: &Value) -> i64 {
    (body.to_string().len() as i64 / 4).max(1)
}

fn strip_data_prefix(chunk: &str) -> &str {
    chunk.strip_prefix("data: ").unwrap_or(chunk)
}

/// Generated text in a choice, across streaming and non-streaming shapes.
fn choice_content(choice: &Value) -> String {
    choice
        .get("delta")
        .and_then(|delta| delta.get("content"))
        .and_then(Value::as_str)
        .or_else(|| {
            choice
                .get("message")
                .and_then(|message| message.get("content"))
                .and_then(Value::as_str)
        })
        .or_else(|| choice.get("text").and_then(Value::as_str))
        .unwrap_or_default()
        .to_string()
}

fn rewrite_prompt(body: &mut Value, chat_flag: bool, origin_prompt: &str, generated: &str) {
    let combined = format!("{origin_prompt}{generated}");
    if chat_flag {
        if let Some(message) = body
            .get_mut("messages")
            .and_then(Value::as_array_mut)
            .and_then(|messages| messages.first_mut())
            .and_then(Value::as_object_mut)
        {
            message.insert("content".to_string(), json!(combined));
        }
    } else if let Some(object) = body.as_object_mut() {
        object.insert("prompt".to_string(), json!(combined));
    }
}

fn rewrite_choice_content(chunk: &mut Value, chat_flag: bool, generated: &str) {
    if let Some(choice) = chunk
        .get_mut("choices")
        .and_then(Value::as_array_mut)
        .and_then(|choices| choices.first_mut())
    {
        if chat_flag {
            if let Some(message) = choice.get_mut("message").and_then(Value::as_object_mut) {
                message.insert("content".to_string(), json!(generated));
            }
        } else if let Some(object) = choice.as_object_mut() {
            object.insert("text".to_string(), json!(generated));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_per_attempt() {
        let base = Duration::from_millis(1);
        assert_eq!(backoff_delay(base, 1), Duration::from_millis(1));
        assert_eq!(backoff_delay(base, 2), Duration::from_millis(2));
        assert_eq!(backoff_delay(base, 3), Duration::from_millis(4));
        assert_eq!(backoff_delay(base, 4), Duration::from_millis(8));
    }

    #[test]
    fn prompt_extraction_covers_both_apis() {
        let completion = json!({"prompt": "tell me a story"});
        assert_eq!(extract_prompt(&completion), "tell me a story");

        let chat = json!({"messages": [{"role": "user", "content": "hello"}]});
        assert_eq!(extract_prompt(&chat), "hello");

        assert_eq!(extract_prompt(&json!({})), "");
    }

    #[test]
    fn sse_prefix_is_stripped() {
        assert_eq!(strip_data_prefix("data: {\"a\":1}"), "{\"a\":1}");
        assert_eq!(strip_data_prefix("{\"a\":1}"), "{\"a\":1}");
        assert_eq!(strip_data_prefix("data: [DONE]"), "[DONE]");
    }

    #[test]
    fn choice_content_prefers_delta_then_message_then_text() {
        assert_eq!(
            choice_content(&json!({"delta": {"content": "a"}, "text": "b"})),
            "a"
        );
        assert_eq!(
            choice_content(&json!({"message": {"content": "m"}})),
            "m"
        );
        assert_eq!(choice_content(&json!({"text": "t"})), "t");
        assert_eq!(choice_content(&json!({"index": 0})), "");
    }

    #[test]
    fn prompt_rewrite_appends_generated_text() {
        let mut completion = json!({"prompt": "once"});
        rewrite_prompt(&mut completion, false, "once", " upon");
        assert_eq!(completion["prompt"], "once upon");

        let mut chat = json!({"messages": [{"role": "user", "content": "hi"}]});
        rewrite_prompt(&mut chat, true, "hi", " there");
        assert_eq!(chat["messages"][0]["content"], "hi there");
    }

    #[test]
    fn choice_rewrite_replaces_tail_with_accumulated_text() {
        let mut chunk = json!({"choices": [{"text": "tail"}]});
        rewrite_choice_content(&mut chunk, false, "full answer");
        assert_eq!(chunk["choices"][0]["text"], "full answer");

        let mut chat_chunk = json!({"choices": [{"message": {"content": "tail"}}]});
        rewrite_choice_content(&mut chat_chunk, true, "full answer");
        assert_eq!(chat_chunk["choices"][0]["message"]["content"], "full answer");
    }

    #[test]
    fn token_estimate_scales_with_body_size() {
        let small = estimate_token_count(&json!({"prompt": "hi"}));
        let large = estimate_token_count(&json!({"prompt": "hi".repeat(400)}));
        assert!(small >= 1);
        assert!(large > small);
    }
}
