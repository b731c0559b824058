use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use hra_router::{Args, RouterConfig, RouterHandle, SystemClock};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
	tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
		.with_writer(std::io::stderr)
		.with_ansi(false)
		.init();

	let args = Args::parse();
	let cfg = RouterConfig::load(&args).await?;
	tracing::info!(policy = %cfg.policy, window_secs = cfg.sliding_window_secs, "loaded router config");

	let handle = RouterHandle::new(&cfg, Arc::new(SystemClock))?;
	tracing::info!("router ready; the HTTP serving layer embeds this handle and calls its hooks directly");

	// This core has no HTTP surface of its own (out of scope); the binary
	// just validates wiring and stays up for an embedding process or
	// orchestrator to probe, exiting cleanly on signal.
	let _ = &handle;
	tokio::signal::ctrl_c().await?;
	tracing::info!("shutdown signal received");
	Ok(())
}
