// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! vLLM-family engine adapter.

use serde_json::Value;

use super::EngineAdapter;
use crate::protocols::{EngineConfig, HttpRequestSpec, LoadMetrics, TokenizationResult};

pub const ENGINE_TAG: &str = "vllm";

/// Adapter for vLLM's OpenAI-compatible server.
#[derive(Debug, Clone, Copy, Default)]
pub struct VllmAdapter;

impl EngineAdapter for VllmAdapter {
    fn engine_tag(&self) -> &'static str {
        ENGINE_TAG
    }

    fn tokenization_request(&self, prompt: &str, endpoint: &str) -> HttpRequestSpec {
        let body = serde_json::json!({
            "text": prompt,
            "add_special_tokens": false,
        });
        HttpRequestSpec::post_json(endpoint, body.to_string())
    }

    fn parse_tokenization_response(&self, raw: &str) -> TokenizationResult {
        let mut result = TokenizationResult::default();
        let value: Value = match serde_json::from_str(raw) {
            Ok(value) => value,
            Err(e) => {
                result.error_message = format!("JSON parse error: {e}");
                return result;
            }
        };
        if let Some(tokens) = value.get("tokens").and_then(Value::as_array) {
            result.token_ids = tokens.iter().filter_map(Value::as_i64).collect();
            result.token_count = result.token_ids.len();
        }
        result.model_name = value
            .get("model")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        result.truncated = value
            .get("truncated")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if let Some(error) = value.get("error").and_then(Value::as_str) {
            result.error_message = error.to_string();
        }
        result
    }

    fn parse_config_response(&self, raw: &str) -> EngineConfig {
        let mut config = EngineConfig::default();
        let Ok(value) = serde_json::from_str::<Value>(raw) else {
            tracing::warn!(engine = ENGINE_TAG, "config response is not valid JSON");
            return config;
        };
        if let Some(model) = value
            .get("data")
            .and_then(Value::as_array)
            .and_then(|models| models.first())
        {
            config.model_name = model
                .get("id")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string();
            config.max_sequence_length = model
                .get("max_model_len")
                .and_then(Value::as_u64)
                .unwrap_or(4096) as u32;
            config.dtype = model
                .get("dtype")
                .and_then(Value::as_str)
                .unwrap_or("float16")
                .to_string();
            config.block_size = model.get("block_size").and_then(Value::as_u64).unwrap_or(16) as u32;
        }
        config
    }

    fn parse_metrics_response(&self, raw: &str) -> LoadMetrics {
        let mut metrics = LoadMetrics::default();
        if is_prometheus_metrics(raw) {
            metrics.gpu_utilization = parse_prometheus_gpu_utilization(raw);
        } else if let Ok(value) = serde_json::from_str::<Value>(raw)
            && let Some(util) = value.get("gpu_util").and_then(Value::as_f64)
        {
            metrics.gpu_utilization = util / 100.0;
        }
        metrics.is_healthy = (0.0..=1.0).contains(&metrics.gpu_utilization);
        metrics
    }

    fn parse_health_response(&self, raw: &str) -> bool {
        let Ok(value) = serde_json::from_str::<Value>(raw) else {
            return false;
        };
        value.get("status").and_then(Value::as_str) == Some("healthy")
            || value.get("healthy").and_then(Value::as_bool) == Some(true)
    }
}

fn is_prometheus_metrics(text: &str) -> bool {
    text.contains("vllm:") || text.contains("vllm_")
}

/// Scans Prometheus text for the gpu_utilization gauge and rescales the
/// percentage to `[0, 1]`.
fn parse_prometheus_gpu_utilization(text: &str) -> f64 {
    let mut utilization = 0.0;
    for line in text.lines() {
        if line.contains("vllm:gpu_utilization") || line.contains("vllm_gpu_utilization") {
            if let Some(value) = line
                .rsplit(' ')
                .next()
                .and_then(|field| field.parse::<f64>().ok())
            {
                utilization = value / 100.0;
            }
        }
    }
    utilization
}
