// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use clap::Parser;
use conductor::config::{ConductorConfig, pair_instances};
use conductor::error::ConductorError;

/// Command line arguments for the conductor.
#[derive(Debug, Parser)]
#[command(
    name = "conductor-run",
    about = "Cache-aware request router for a disaggregated LLM inference fleet"
)]
pub struct Flags {
    /// Port the conductor listens on.
    #[arg(long = "port", default_value_t = 8000)]
    pub port: u16,

    /// Host the conductor binds to.
    #[arg(long = "host", default_value = "localhost")]
    pub host: String,

    /// Comma-separated list of prefiller hosts.
    #[arg(long = "prefiller_hosts", default_value = "localhost")]
    pub prefiller_hosts: String,

    /// Comma-separated list of prefiller ports; must match the host count.
    #[arg(long = "prefiller_ports", default_value = "8001")]
    pub prefiller_ports: String,

    /// Comma-separated list of decoder hosts.
    #[arg(long = "decoder_hosts", default_value = "localhost")]
    pub decoder_hosts: String,

    /// Comma-separated list of decoder ports; must match the host count.
    #[arg(long = "decoder_ports", default_value = "8002")]
    pub decoder_ports: String,

    /// Maximum number of retries for HTTP requests to workers.
    #[arg(long = "max_retries", default_value_t = 3)]
    pub max_retries: u32,

    /// Base delay in seconds for exponential backoff retries.
    #[arg(long = "retry_delay", default_value_t = 0.001)]
    pub retry_delay: f64,

    /// Inference engine family served by the workers.
    #[arg(long = "engine", default_value = "vllm")]
    pub engine: String,

    /// Object locator master address (host:port). Without it the router
    /// places by load only.
    #[arg(long = "locator_addr")]
    pub locator_addr: Option<String>,

    /// Override the engine-reported KV block size.
    #[arg(long = "block_size")]
    pub block_size: Option<u32>,
}

impl Flags {
    pub fn into_config(self) -> Result<ConductorConfig, ConductorError> {
        if self.retry_delay <= 0.0 {
            return Err(ConductorError::ConfigInvalid(format!(
                "retry_delay must be positive, got {}",
                self.retry_delay
            )));
        }
        let prefiller_instances =
            pair_instances(&self.prefiller_hosts, &self.prefiller_ports, "prefiller")?;
        let decoder_instances =
            pair_instances(&self.decoder_hosts, &self.decoder_ports, "decoder")?;
        Ok(ConductorConfig {
            host: self.host,
            port: self.port,
            prefiller_instances,
            decoder_instances,
            max_retries: self.max_retries,
            retry_delay: Duration::from_secs_f64(self.retry_delay),
            engine: self.engine,
            locator_addr: self.locator_addr,
            block_size: self.block_size,
        })
    }
}
