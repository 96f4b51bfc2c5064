use std::sync::{Arc, Mutex};

use prometheus_client::registry::Registry;
use rls_core::prelude::*;
use rls_core::readiness::Ready;
use rls_core::{drain, signal};

use crate::authz::{AuthorizationServer, ExtAuthzService};
use crate::config::Config;
use crate::health::{HealthServer, HealthService};
use crate::limiter::Limiter;
use crate::management::{api, metrics_server};
use crate::metrics::Metrics;
use crate::pipeline::PipelineStatus;
use crate::quota::{QuotaService, RateLimitServiceServer};
use crate::tenant::{DenialLog, TenantStore};

/// Builds and starts every server, returning a handle the caller uses to
/// wait for termination. Mirrors the process layout the proxy expects: two
/// gRPC ports (ext-authz, rate-limit), the admin HTTP port, and the scrape
/// port.
pub async fn run(cfg: Arc<Config>) -> anyhow::Result<Bound> {
	let shutdown = signal::Shutdown::new();
	let (drain_tx, drain_rx) = drain::new();
	let ready = Ready::new();
	let startup = ready.register_task("listeners");

	let store = Arc::new(TenantStore::new(cfg.shards));
	let denials = Arc::new(DenialLog::default());
	let pipeline = Arc::new(PipelineStatus::default());
	let mut registry = Registry::default();
	let metrics = Arc::new(Metrics::new(&mut registry));
	let registry = Arc::new(Mutex::new(registry));
	let limiter = Arc::new(Limiter::new(
		store.clone(),
		denials.clone(),
		metrics.clone(),
		pipeline.clone(),
		cfg.clone(),
	));

	spawn_grpc(
		"ext-authz",
		cfg.ext_authz_addr,
		drain_rx.clone(),
		tonic::transport::Server::builder()
			.add_service(AuthorizationServer::new(ExtAuthzService::new(
				limiter.clone(),
				cfg.clone(),
			)))
			.add_service(HealthServer::new(HealthService::new(ready.clone()))),
	);
	spawn_grpc(
		"rate-limit",
		cfg.rate_limit_addr,
		drain_rx.clone(),
		tonic::transport::Server::builder()
			.add_service(RateLimitServiceServer::new(QuotaService::new(
				store.clone(),
				metrics.clone(),
			)))
			.add_service(HealthServer::new(HealthService::new(ready.clone()))),
	);

	let admin_listener = tokio::net::TcpListener::bind(cfg.admin_addr)
		.await
		.context("bind admin listener")?;
	let admin_addr = admin_listener.local_addr()?;
	info!(address = %admin_addr, component = "admin", "listener established");
	let admin_router = api::router(api::AdminState {
		store,
		denials,
		pipeline,
		registry: registry.clone(),
		ready: ready.clone(),
		cfg: cfg.clone(),
	});
	{
		let signal = drain_rx.clone();
		let holder = drain_rx.clone();
		tokio::spawn(async move {
			let _holder = holder;
			let serve = axum::serve(admin_listener, admin_router).with_graceful_shutdown(
				async move {
					drop(signal.wait_for_drain().await);
				},
			);
			if let Err(e) = serve.await {
				warn!(component = "admin", "server error: {e}");
			}
		});
	}

	let stats = metrics_server::Server::bind(cfg.stats_addr, registry, drain_rx.clone()).await?;
	stats.spawn();

	drop(startup);
	Ok(Bound { shutdown, drain_tx })
}

fn spawn_grpc(
	component: &'static str,
	addr: SocketAddr,
	drain: drain::DrainWatcher,
	router: tonic::transport::server::Router,
) {
	let signal = drain.clone();
	tokio::spawn(async move {
		let _holder = drain;
		info!(address = %addr, component, "listener established");
		let serve = router.serve_with_shutdown(addr, async move {
			drop(signal.wait_for_drain().await);
		});
		if let Err(e) = serve.await {
			warn!(component, "server error: {e}");
		}
	});
}

pub struct Bound {
	pub shutdown: signal::Shutdown,
	drain_tx: drain::DrainTrigger,
}

impl Bound {
	pub async fn wait_termination(self) -> anyhow::Result<()> {
		self.shutdown.wait().await;
		// Stop accepting and give in-flight checks a chance to finish.
		self.drain_tx.start_drain_and_wait().await;
		Ok(())
	}
}
