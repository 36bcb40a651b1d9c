// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Engine adapters: per-engine-family request/response codecs.
//!
//! An adapter knows how to build endpoint URLs and request bodies for one
//! inference engine family, and how to parse that family's replies into the
//! shared domain types. All methods are pure; the request handler performs
//! the I/O. Adapters are looked up by string tag through a process-wide
//! registry with once-per-tag lazy initialization.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use parking_lot::Mutex;

use crate::error::ConductorError;
use crate::protocols::{EngineConfig, HttpRequestSpec, LoadMetrics, TokenizationResult};

pub mod vllm;

/// Capability set implemented once per engine family.
pub trait EngineAdapter: Send + Sync {
    /// The registry tag, e.g. `"vllm"`.
    fn engine_tag(&self) -> &'static str;

    // Endpoint builders.
    fn tokenize_endpoint(&self, base_url: &str) -> String {
        join_url(base_url, "/v1/tokenize")
    }
    fn models_endpoint(&self, base_url: &str) -> String {
        join_url(base_url, "/v1/models")
    }
    fn metrics_endpoint(&self, base_url: &str) -> String {
        join_url(base_url, "/metrics")
    }
    fn health_endpoint(&self, base_url: &str) -> String {
        join_url(base_url, "/health")
    }
    fn completions_endpoint(&self, base_url: &str) -> String {
        join_url(base_url, "/v1/completions")
    }
    fn chat_completions_endpoint(&self, base_url: &str) -> String {
        join_url(base_url, "/v1/chat/completions")
    }

    // Request builders.
    fn tokenization_request(&self, prompt: &str, endpoint: &str) -> HttpRequestSpec;
    fn config_request(&self, endpoint: &str) -> HttpRequestSpec {
        HttpRequestSpec::get(endpoint)
    }
    fn metrics_request(&self, endpoint: &str) -> HttpRequestSpec {
        HttpRequestSpec::get(endpoint)
    }
    fn health_request(&self, endpoint: &str) -> HttpRequestSpec {
        HttpRequestSpec::get(endpoint)
    }
    fn completions_request(&self, endpoint: &str, body: &str) -> HttpRequestSpec {
        HttpRequestSpec::post_json(endpoint, body)
    }
    fn chat_completions_request(&self, endpoint: &str, body: &str) -> HttpRequestSpec {
        HttpRequestSpec::post_json(endpoint, body)
    }

    // Response parsers. Tolerant by contract: never panic, never error out;
    // malformed input is reported through the result's own fields.
    fn parse_tokenization_response(&self, raw: &str) -> TokenizationResult;
    fn parse_config_response(&self, raw: &str) -> EngineConfig;
    fn parse_metrics_response(&self, raw: &str) -> LoadMetrics;
    fn parse_health_response(&self, raw: &str) -> bool;
}

/// Joins a base URL and a path with exactly one `/` between them.
pub fn join_url(base_url: &str, path: &str) -> String {
    if base_url.is_empty() {
        return path.to_string();
    }
    if path.is_empty() {
        return base_url.to_string();
    }
    let base = base_url.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    format!("{base}/{path}")
}

type AdapterFactory = fn() -> Arc<dyn EngineAdapter>;

#[derive(Default)]
struct AdapterRegistry {
    factories: HashMap<String, AdapterFactory>,
    /// Tags whose lazy built-in registration already ran.
    initialized: HashMap<String, bool>,
}

static REGISTRY: LazyLock<Mutex<AdapterRegistry>> =
    LazyLock::new(|| Mutex::new(AdapterRegistry::default()));

/// Built-in factories, registered lazily on first `create_adapter(tag)`.
fn builtin_factory(tag: &str) -> Option<AdapterFactory> {
    match tag {
        vllm::ENGINE_TAG => Some(|| Arc::new(vllm::VllmAdapter)),
        _ => None,
    }
}

/// Registers a factory under `tag`. Registering the same tag twice is a no-op
/// so the call is idempotent.
pub fn register_adapter(tag: &str, factory: AdapterFactory) {
    let mut registry = REGISTRY.lock();
    if registry.factories.contains_key(tag) {
        return;
    }
    registry.factories.insert(tag.to_string(), factory);
    tracing::info!(tag, "registered engine adapter");
}

/// Creates the adapter registered under `tag`.
///
/// The first call for a tag runs that tag's built-in registration exactly
/// once; both the map and the per-tag initialized flag live behind one mutex.
pub fn create_adapter(tag: &str) -> Result<Arc<dyn EngineAdapter>, ConductorError> {
    let mut registry = REGISTRY.lock();
    if !registry.initialized.get(tag).copied().unwrap_or(false) {
        if let Some(factory) = builtin_factory(tag) {
            registry.factories.entry(tag.to_string()).or_insert(factory);
            tracing::info!(tag, "registered engine adapter");
        }
        registry.initialized.insert(tag.to_string(), true);
    }
    match registry.factories.get(tag) {
        Some(factory) => Ok(factory()),
        None => {
            let available: Vec<_> = registry.factories.keys().cloned().collect();
            tracing::error!(tag, ?available, "unknown engine adapter requested");
            Err(ConductorError::UnknownEngine(tag.to_string()))
        }
    }
}

/// Clears all registrations and initialized flags. Used by the shutdown hook
/// and between test runs.
pub fn reset_adapters() {
    let mut registry = REGISTRY.lock();
    registry.factories.clear();
    registry.initialized.clear();
}
