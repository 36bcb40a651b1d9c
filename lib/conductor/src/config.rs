// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Runtime configuration for the conductor.

use std::time::Duration;

use crate::error::ConductorError;
use crate::health::DEFAULT_PROBE_TIMEOUT;

/// Environment override for the health/ping timeout, in whole seconds.
pub const CONDUCTOR_TIMEOUT_ENV: &str = "MOONCAKE_CONDUCTOR_TIMEOUT";

/// Validated runtime configuration, assembled from CLI flags by the launcher.
#[derive(Debug, Clone)]
pub struct ConductorConfig {
    pub host: String,
    pub port: u16,
    pub prefiller_instances: Vec<(String, u16)>,
    pub decoder_instances: Vec<(String, u16)>,
    pub max_retries: u32,
    pub retry_delay: Duration,
    /// Engine adapter tag, e.g. `"vllm"`.
    pub engine: String,
    /// Object locator master address. Without it every request takes the
    /// load-only placement path.
    pub locator_addr: Option<String>,
    /// Engine block size override; when unset the engine's reported value
    /// (or its default) is used.
    pub block_size: Option<u32>,
}

/// Pairs up comma-separated host and port lists, rejecting length mismatches.
pub fn pair_instances(
    hosts: &str,
    ports: &str,
    label: &str,
) -> Result<Vec<(String, u16)>, ConductorError> {
    let hosts: Vec<&str> = hosts.split(',').map(str::trim).collect();
    let ports = ports
        .split(',')
        .map(|port| {
            port.trim().parse::<u16>().map_err(|_| {
                ConductorError::ConfigInvalid(format!("invalid {label} port: {port:?}"))
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    if hosts.len() != ports.len() {
        return Err(ConductorError::ConfigInvalid(format!(
            "number of {label} hosts ({}) must match number of {label} ports ({})",
            hosts.len(),
            ports.len()
        )));
    }
    Ok(hosts
        .into_iter()
        .map(str::to_string)
        .zip(ports)
        .collect())
}

/// Reads the probe timeout, honoring [`CONDUCTOR_TIMEOUT_ENV`]. Non-numeric
/// or non-positive values log an error and fall back to the default.
pub fn probe_timeout_from_env() -> Duration {
    let Ok(raw) = std::env::var(CONDUCTOR_TIMEOUT_ENV) else {
        return DEFAULT_PROBE_TIMEOUT;
    };
    match raw.trim().parse::<i64>() {
        Ok(seconds) if seconds > 0 => Duration::from_secs(seconds as u64),
        _ => {
            tracing::error!(
                value = %raw,
                "invalid {CONDUCTOR_TIMEOUT_ENV}, expected a positive integer number of seconds; \
                 using default"
            );
            DEFAULT_PROBE_TIMEOUT
        }
    }
}
