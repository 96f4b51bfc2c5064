use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::Parser;
use overrides_sync::admin::AdminClient;
use overrides_sync::config::SyncConfig;
use overrides_sync::metrics::SyncMetrics;
use overrides_sync::reconciler::Reconciler;
use overrides_sync::{server, watch};
use prometheus_client::registry::Registry;
use rls_core::prelude::*;
use rls_core::readiness::Ready;
use rls_core::{drain, signal, telemetry, version};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	telemetry::setup_logging()?;
	let cfg = SyncConfig::parse();
	info!("version: {}", version::BuildInfo::new());
	info!(
		namespace = cfg.namespace,
		configmap = cfg.configmap,
		admin = cfg.admin_base_url,
		"starting overrides reconciler"
	);

	let shutdown = signal::Shutdown::new();
	let (drain_tx, drain_rx) = drain::new();
	let ready = Ready::new();
	let initial_sync = ready.register_task("initial sync");

	let mut registry = Registry::default();
	let metrics = Arc::new(SyncMetrics::new(&mut registry));
	let registry = Arc::new(Mutex::new(registry));

	let admin = AdminClient::new(
		&cfg.admin_base_url,
		cfg.admin_timeout(),
		cfg.admin_attempts,
		Duration::from_millis(200),
	)?;
	let reconciler = Arc::new(Reconciler::new(admin, metrics, cfg.dry_run));

	{
		let state = server::AppState {
			ready: ready.clone(),
			registry,
			reconciler: reconciler.clone(),
		};
		let addr = cfg.bind_address;
		let drain = drain_rx.clone();
		tokio::spawn(async move {
			if let Err(e) = server::serve(addr, state, drain).await {
				error!("sidecar http server failed: {e:#}");
			}
		});
	}

	let client = kube::Client::try_default()
		.await
		.context("connect to the cluster")?;
	{
		let cfg = cfg.clone();
		let drain = drain_rx.clone();
		tokio::spawn(async move {
			watch::run(client, cfg, reconciler, initial_sync, drain).await;
		});
	}

	drop(drain_rx);
	shutdown.wait().await;
	drain_tx.start_drain_and_wait().await;
	Ok(())
}
