// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Semantic error kinds for the routing core.

/// Errors surfaced by the routing core. The request handler maps these to the
/// final HTTP status; only a fully streamed response yields 200.
#[derive(Debug, thiserror::Error)]
pub enum ConductorError {
    /// Engine adapter tag has no registration.
    #[error("unknown engine adapter: {0}")]
    UnknownEngine(String),

    /// A worker reply could not be parsed. Retrying does not help.
    #[error("malformed response from worker: {0}")]
    MalformedResponse(String),

    /// Timeout or connection-level failure; retried with backoff.
    #[error("transient network error: {0}")]
    TransientNetwork(String),

    /// The object locator pool is unavailable.
    #[error("object locator rpc failed")]
    RpcFail,

    /// A pool has no selectable worker.
    #[error("no {0} capacity available")]
    NoCapacity(&'static str),

    /// The client disconnected before the response completed.
    #[error("client cancelled request")]
    ClientCancelled,

    /// CLI or environment configuration is inconsistent.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// Block payload or wire serialization failed. The request falls back to
    /// load-only placement.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Block hash chaining failed. Same fallback as serialization failures.
    #[error("block hashing failed: {0}")]
    Hash(String),
}

impl ConductorError {
    /// Only transient network failures are subject to the retry policy.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ConductorError::TransientNetwork(_))
    }
}

impl From<conductor_tokens::TokensError> for ConductorError {
    fn from(e: conductor_tokens::TokensError) -> Self {
        match e {
            conductor_tokens::TokensError::Serialization(msg) => {
                ConductorError::Serialization(msg)
            }
            conductor_tokens::TokensError::Hash(msg) => ConductorError::Hash(msg),
        }
    }
}
