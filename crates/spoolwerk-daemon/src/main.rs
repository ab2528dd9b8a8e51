// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Spoolwerk print server daemon.
//
// Entry point. Initialises logging, loads the server configuration, starts
// every printer and runs until interrupted.  The configuration file is named
// by `SPOOLWERK_CONFIG`; without it the built-in defaults are used.

mod runtime;

use std::process::ExitCode;

use spoolwerk_core::config::ServerConfig;
use spoolwerk_core::error::Result;

use runtime::Runtime;

/// Environment variable naming the JSON configuration file.
const CONFIG_ENV: &str = "SPOOLWERK_CONFIG";

fn load_config() -> Result<ServerConfig> {
    match std::env::var_os(CONFIG_ENV) {
        Some(path) => {
            tracing::info!(path = ?path, "loading configuration");
            ServerConfig::load(path)
        }
        None => Ok(ServerConfig::default()),
    }
}

async fn run() -> Result<()> {
    let config = load_config()?;
    let runtime = Runtime::start(&config).await?;

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to wait for shutdown signal");
    }
    tracing::info!("shutting down");
    runtime.shutdown().await
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    tracing::info!("Spoolwerk starting");

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "Spoolwerk stopped with an error");
            ExitCode::FAILURE
        }
    }
}
