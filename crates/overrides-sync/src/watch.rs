use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::Api;
use kube::runtime::watcher;
use rand::Rng;
use rls_core::drain::DrainWatcher;
use rls_core::prelude::*;
use rls_core::readiness::BlockReady;

use crate::config::SyncConfig;
use crate::document::{self, ParsedDocument};
use crate::reconciler::Reconciler;

const BACKOFF_START: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(60);

/// Runs the two reconciliation loops until drained: a watch on the
/// overrides ConfigMap, and an independent full-sync poll that papers over
/// missed events. They share nothing but the reconciler's last-applied map.
pub async fn run(
	client: kube::Client,
	cfg: SyncConfig,
	reconciler: Arc<Reconciler>,
	initial_sync: BlockReady,
	drain: DrainWatcher,
) {
	let api: Api<ConfigMap> = Api::namespaced(client, &cfg.namespace);

	// Startup: one successful full sync gates readiness.
	let mut attempt: u32 = 0;
	loop {
		match fetch_and_parse(&api, &cfg).await {
			Ok(doc) => match reconciler.full_sync(&doc).await {
				Ok(report) if report.clean() => break,
				Ok(report) => {
					warn!(failed = report.failed.len(), "initial sync incomplete, retrying");
				},
				Err(e) => warn!("initial sync failed: {e:#}"),
			},
			Err(e) => warn!("initial document fetch failed: {e:#}"),
		}
		attempt += 1;
		tokio::time::sleep(backoff(attempt)).await;
	}
	info!("initial sync complete");
	drop(initial_sync);

	let watch = watch_loop(api.clone(), cfg.clone(), reconciler.clone());
	let poll = poll_loop(api, cfg, reconciler);
	tokio::select! {
		_ = watch => {},
		_ = poll => {},
		release = drain.wait_for_drain() => {
			info!("reconciler loops stopping");
			drop(release);
		},
	}
}

async fn watch_loop(api: Api<ConfigMap>, cfg: SyncConfig, reconciler: Arc<Reconciler>) {
	let mut attempt: u32 = 0;
	loop {
		let watch_cfg =
			watcher::Config::default().fields(&format!("metadata.name={}", cfg.configmap));
		let mut stream = watcher(api.clone(), watch_cfg).boxed();
		while let Some(event) = stream.next().await {
			match event {
				Ok(watcher::Event::Applied(_) | watcher::Event::Deleted(_)) => {
					attempt = 0;
					apply_current(&api, &cfg, &reconciler).await;
				},
				Ok(watcher::Event::Restarted(_)) => {
					attempt = 0;
					apply_current(&api, &cfg, &reconciler).await;
				},
				Err(e) => {
					warn!("overrides watch error: {e}");
					break;
				},
			}
		}
		// The stream broke; reconnect with exponential backoff. The polling
		// loop keeps enforcing convergence in the meantime.
		attempt += 1;
		let delay = backoff(attempt);
		warn!(?delay, "overrides watch stream ended, reconnecting");
		tokio::time::sleep(delay).await;
	}
}

async fn poll_loop(api: Api<ConfigMap>, cfg: SyncConfig, reconciler: Arc<Reconciler>) {
	let mut ticker = tokio::time::interval(cfg.poll_fallback());
	ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
	ticker.tick().await; // the startup sync already ran
	loop {
		ticker.tick().await;
		match fetch_and_parse(&api, &cfg).await {
			Ok(doc) => {
				if let Err(e) = reconciler.full_sync(&doc).await {
					warn!("full sync failed: {e:#}");
				}
			},
			Err(e) => warn!("document fetch failed, skipping cycle: {e:#}"),
		}
	}
}

/// Watch events always trigger a fresh read of the document rather than
/// trusting the event payload, so a lagging watch cannot apply stale data.
async fn apply_current(api: &Api<ConfigMap>, cfg: &SyncConfig, reconciler: &Reconciler) {
	match fetch_and_parse(api, cfg).await {
		Ok(doc) => {
			reconciler.apply_changes(&doc).await;
		},
		Err(e) => warn!("document fetch failed, cycle aborted: {e:#}"),
	}
}

async fn fetch_and_parse(
	api: &Api<ConfigMap>,
	cfg: &SyncConfig,
) -> anyhow::Result<ParsedDocument> {
	let cm = api
		.get(&cfg.configmap)
		.await
		.with_context(|| format!("fetch configmap {}/{}", cfg.namespace, cfg.configmap))?;
	let contents = cm
		.data
		.as_ref()
		.and_then(|d| d.get(&cfg.key))
		.cloned()
		.unwrap_or_default();
	if contents.is_empty() {
		warn!(key = cfg.key, "document key missing or empty");
	}
	Ok(document::parse(&contents)?)
}

fn backoff(attempt: u32) -> Duration {
	let exp = BACKOFF_START.saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1).min(6)));
	let jitter = Duration::from_millis(rand::rng().random_range(0..250));
	exp.min(BACKOFF_CAP) + jitter
}
