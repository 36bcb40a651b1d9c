// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use conductor::adapter::reset_adapters;
use conductor::config::probe_timeout_from_env;
use conductor::service::{build_app, router};

mod flags;
use flags::Flags;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let flags = Flags::parse();
    let config = match flags.into_config() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "invalid configuration");
            std::process::exit(1);
        }
    };
    tracing::info!(
        host = %config.host,
        port = config.port,
        prefillers = config.prefiller_instances.len(),
        decoders = config.decoder_instances.len(),
        "starting conductor"
    );

    let probe_timeout = probe_timeout_from_env();
    let (state, prober) = build_app(&config, probe_timeout).await?;

    let cancel = CancellationToken::new();
    let prober_cancel = cancel.clone();
    let prober_task = tokio::spawn(async move { prober.run(prober_cancel).await });

    let app = router(state);
    let listener = tokio::net::TcpListener::bind((config.host.as_str(), config.port)).await?;
    tracing::info!("conductor listening on {}:{}", config.host, config.port);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    cancel.cancel();
    let _ = prober_task.await;
    reset_adapters();
    tracing::info!("conductor stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to install ctrl-c handler");
    }
    tracing::info!("shutdown signal received");
}
