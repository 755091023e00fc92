// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use weft_agent::{load_config, AgentDaemon, CliArgs, LogFormat};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let args = CliArgs::parse();

	let filter =
		EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
	let registry = tracing_subscriber::registry().with(filter);
	match args.log_format {
		LogFormat::Text => registry.with(fmt::layer()).init(),
		LogFormat::Json => registry.with(fmt::layer().json()).init(),
	}

	let config = load_config(&args).context("failed to load configuration")?;
	let daemon = AgentDaemon::new(config).context("failed to initialize agent")?;

	let shutdown = daemon.shutdown_handle();
	tokio::spawn(async move {
		match shutdown_signal().await {
			Ok(()) => {
				info!("shutdown signal received");
				let _ = shutdown.send(true);
			}
			Err(e) => warn!(error = %e, "failed to listen for shutdown signal"),
		}
	});

	daemon.run().await.context("weftd exited with an error")?;
	Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() -> std::io::Result<()> {
	use tokio::signal::unix::{signal, SignalKind};

	let mut terminate = signal(SignalKind::terminate())?;
	tokio::select! {
		result = tokio::signal::ctrl_c() => result,
		_ = terminate.recv() => Ok(()),
	}
}

#[cfg(not(unix))]
async fn shutdown_signal() -> std::io::Result<()> {
	tokio::signal::ctrl_c().await
}
