// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Domain types shared between the engine adapters and the request handler.

use conductor_tokens::Token;
use serde::{Deserialize, Serialize};

/// A fully described HTTP request an adapter wants issued against a worker.
/// Adapters are pure; the handler owns the actual I/O.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequestSpec {
    pub url: String,
    pub method: HttpMethod,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

impl HttpRequestSpec {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: HttpMethod::Get,
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn post_json(url: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: HttpMethod::Post,
            headers: vec![
                ("Content-Type".to_string(), "application/json".to_string()),
                ("Accept".to_string(), "application/json".to_string()),
            ],
            body: Some(body.into()),
        }
    }
}

/// Parsed reply from a worker's tokenize endpoint.
///
/// Parsers are tolerant: unknown keys are ignored and malformed input sets
/// `error_message` instead of failing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenizationResult {
    pub token_ids: Vec<Token>,
    pub token_count: usize,
    pub model_name: String,
    pub truncated: bool,
    pub error_message: String,
}

impl TokenizationResult {
    pub fn is_ok(&self) -> bool {
        self.error_message.is_empty()
    }
}

/// Engine configuration reported by the worker's models endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub model_name: String,
    pub max_sequence_length: u32,
    pub dtype: String,
    pub block_size: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            model_name: "unknown".to_string(),
            max_sequence_length: 4096,
            dtype: "float16".to_string(),
            block_size: 16,
        }
    }
}

/// Load snapshot scraped from a worker's metrics endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoadMetrics {
    /// GPU utilization rescaled to `[0, 1]`.
    pub gpu_utilization: f64,
    pub is_healthy: bool,
}

/// KV transfer contract carried on the prefill request so the worker hands
/// its cache to the decode side, and drops work for aborted request ids.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KvTransferParams {
    pub do_remote_decode: bool,
    pub do_remote_prefill: bool,
    pub remote_engine_id: Option<String>,
    pub remote_block_ids: Option<Vec<u64>>,
    pub remote_host: Option<String>,
    pub remote_port: Option<u16>,
    #[serde(default)]
    pub aborted_request: Vec<String>,
}

impl KvTransferParams {
    /// Params attached to the prefill leg of a disaggregated request.
    pub fn for_prefill(aborted_request: Vec<String>) -> Self {
        Self {
            do_remote_decode: true,
            aborted_request,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_config_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.max_sequence_length, 4096);
        assert_eq!(config.dtype, "float16");
        assert_eq!(config.block_size, 16);
    }

    #[test]
    fn prefill_transfer_params_shape() {
        let params = KvTransferParams::for_prefill(vec!["req-1".to_string()]);
        let value = serde_json::to_value(&params).unwrap();
        assert_eq!(value["do_remote_decode"], true);
        assert_eq!(value["do_remote_prefill"], false);
        assert_eq!(value["remote_engine_id"], serde_json::Value::Null);
        assert_eq!(value["aborted_request"][0], "req-1");
    }
}
