// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Object locator client.
//!
//! The object locator is the distributed KV metadata service answering
//! "which nodes hold a replica of this key". The conductor only consumes its
//! replica-list RPCs; it never moves block data itself. The transport is
//! length-delimited bincode frames over TCP with a small pool of reusable
//! connections keyed by the master address.

use std::collections::VecDeque;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::error::ConductorError;

/// Per-key error codes mirrored from the locator service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    ObjectNotFound,
    RpcFail,
    Internal,
}

/// Replication state of one replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicaStatus {
    Complete,
    Incomplete,
    Partial,
    Invalid,
}

/// One registered buffer on a node, addressed by its transport endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferDescriptor {
    pub size: u64,
    pub transport_endpoint: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryDescriptor {
    pub buffer_descriptors: Vec<BufferDescriptor>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskDescriptor {
    pub file_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicaVariant {
    Memory(MemoryDescriptor),
    Disk(DiskDescriptor),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaDescriptor {
    pub status: ReplicaStatus,
    pub variant: ReplicaVariant,
}

impl ReplicaDescriptor {
    /// A complete in-memory replica with at least one buffer, addressed by
    /// the first buffer's transport endpoint.
    pub fn complete_memory(endpoint: impl Into<String>, size: u64) -> Self {
        Self {
            status: ReplicaStatus::Complete,
            variant: ReplicaVariant::Memory(MemoryDescriptor {
                buffer_descriptors: vec![BufferDescriptor {
                    size,
                    transport_endpoint: endpoint.into(),
                }],
            }),
        }
    }

    pub fn is_memory_replica(&self) -> bool {
        matches!(self.variant, ReplicaVariant::Memory(_))
    }

    pub fn memory_descriptor(&self) -> Option<&MemoryDescriptor> {
        match &self.variant {
            ReplicaVariant::Memory(memory) => Some(memory),
            ReplicaVariant::Disk(_) => None,
        }
    }
}

/// Replica list for one key. Zero replicas means the key is unknown.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaListResponse {
    pub replicas: Vec<ReplicaDescriptor>,
}

/// One replica-list lookup outcome, positionally aligned with its key.
pub type ReplicaResult = Result<ReplicaListResponse, ErrorCode>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LocatorRequest {
    ServiceReady,
    GetReplicaList { key: String },
    BatchGetReplicaList { keys: Vec<String> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LocatorResponse {
    Ready,
    ReplicaList(ReplicaResult),
    BatchReplicaList(Vec<ReplicaResult>),
}

type Connection = Framed<TcpStream, LengthDelimitedCodec>;

struct ClientState {
    addr: Option<String>,
    idle: VecDeque<Connection>,
}

/// Pooled RPC client for the object locator master.
pub struct ObjectLocatorClient {
    state: tokio::sync::Mutex<ClientState>,
    request_timeout: Duration,
    max_idle: usize,
}

impl ObjectLocatorClient {
    pub fn new(request_timeout: Duration) -> Self {
        Self {
            state: tokio::sync::Mutex::new(ClientState {
                addr: None,
                idle: VecDeque::new(),
            }),
            request_timeout,
            max_idle: 8,
        }
    }

    /// Points the pool at `addr`. Idempotent: if the pool already targets
    /// `addr` and a `service_ready` probe succeeds, the existing connections
    /// are reused; otherwise the pool is reopened against the new address.
    pub async fn connect(&self, addr: &str) -> Result<(), ConductorError> {
        {
            let state = self.state.lock().await;
            let same_addr = state.addr.as_deref() == Some(addr);
            drop(state);
            if same_addr && self.service_ready().await.is_ok() {
                return Ok(());
            }
        }

        let mut state = self.state.lock().await;
        state.addr = Some(addr.to_string());
        state.idle.clear();
        drop(state);

        self.service_ready()
            .await
            .map_err(|_| ConductorError::RpcFail)?;
        tracing::info!(addr, "connected to object locator master");
        Ok(())
    }

    pub async fn service_ready(&self) -> Result<(), ConductorError> {
        match self.call(&LocatorRequest::ServiceReady).await? {
            LocatorResponse::Ready => Ok(()),
            other => Err(unexpected_response("ServiceReady", &other)),
        }
    }

    pub async fn get_replica_list(&self, key: &str) -> ReplicaResult {
        let request = LocatorRequest::GetReplicaList {
            key: key.to_string(),
        };
        match self.call(&request).await {
            Ok(LocatorResponse::ReplicaList(result)) => result,
            Ok(_) | Err(_) => Err(ErrorCode::RpcFail),
        }
    }

    /// Batched replica lookup. The result has the same length as `keys` and
    /// is positionally aligned; a transport-level failure fills every entry
    /// with [`ErrorCode::RpcFail`] so the planner can proceed on partial data.
    pub async fn batch_get_replica_list(&self, keys: &[String]) -> Vec<ReplicaResult> {
        if keys.is_empty() {
            return Vec::new();
        }
        let request = LocatorRequest::BatchGetReplicaList {
            keys: keys.to_vec(),
        };
        match self.call(&request).await {
            Ok(LocatorResponse::BatchReplicaList(results)) if results.len() == keys.len() => {
                results
            }
            Ok(other) => {
                tracing::error!(
                    expected = keys.len(),
                    "object locator batch reply misaligned: {other:?}"
                );
                vec![Err(ErrorCode::RpcFail); keys.len()]
            }
            Err(e) => {
                tracing::error!(error = %e, "object locator batch rpc failed");
                vec![Err(ErrorCode::RpcFail); keys.len()]
            }
        }
    }

    async fn call(&self, request: &LocatorRequest) -> Result<LocatorResponse, ConductorError> {
        let (addr, pooled) = {
            let mut state = self.state.lock().await;
            let Some(addr) = state.addr.clone() else {
                return Err(ConductorError::RpcFail);
            };
            (addr, state.idle.pop_front())
        };

        let mut connection = match pooled {
            Some(connection) => connection,
            None => self.dial(&addr).await?,
        };

        match self.roundtrip(&mut connection, request).await {
            Ok(response) => {
                let mut state = self.state.lock().await;
                // Only return the connection if the pool still targets the
                // same master.
                if state.addr.as_deref() == Some(addr.as_str())
                    && state.idle.len() < self.max_idle
                {
                    state.idle.push_back(connection);
                }
                Ok(response)
            }
            Err(e) => {
                tracing::warn!(addr, error = %e, "object locator rpc failed, dropping connection");
                Err(e)
            }
        }
    }

    async fn dial(&self, addr: &str) -> Result<Connection, ConductorError> {
        let stream = tokio::time::timeout(self.request_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ConductorError::TransientNetwork(format!("connect to {addr} timed out")))?
            .map_err(|e| ConductorError::TransientNetwork(format!("connect to {addr}: {e}")))?;
        Ok(Framed::new(stream, LengthDelimitedCodec::new()))
    }

    async fn roundtrip(
        &self,
        connection: &mut Connection,
        request: &LocatorRequest,
    ) -> Result<LocatorResponse, ConductorError> {
        let payload =
            bincode::serialize(request).map_err(|e| ConductorError::Serialization(e.to_string()))?;
        tokio::time::timeout(self.request_timeout, connection.send(Bytes::from(payload)))
            .await
            .map_err(|_| ConductorError::TransientNetwork("locator send timed out".to_string()))?
            .map_err(|e| ConductorError::TransientNetwork(format!("locator send: {e}")))?;

        let frame = tokio::time::timeout(self.request_timeout, connection.next())
            .await
            .map_err(|_| ConductorError::TransientNetwork("locator reply timed out".to_string()))?
            .ok_or_else(|| {
                ConductorError::TransientNetwork("locator closed the connection".to_string())
            })?
            .map_err(|e| ConductorError::TransientNetwork(format!("locator recv: {e}")))?;

        bincode::deserialize(&frame).map_err(|e| ConductorError::Serialization(e.to_string()))
    }
}

fn unexpected_response(method: &str, response: &LocatorResponse) -> ConductorError {
    ConductorError::MalformedResponse(format!("unexpected {method} reply: {response:?}"))
}
