use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex as SyncMutex;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::admin::{AdminClient, Limits};
use crate::document::{LimitsPatch, ParsedDocument};
use crate::metrics::SyncMetrics;

/// What one reconciliation cycle did. Per-tenant failures are collected,
/// never escalated: the loop must survive a misbehaving tenant or a
/// briefly-unavailable enforcement service.
#[derive(Debug, Default)]
pub struct ApplyReport {
	pub pushed: Vec<String>,
	pub deleted: Vec<String>,
	pub retained: Vec<String>,
	pub failed: Vec<String>,
}

impl ApplyReport {
	pub fn clean(&self) -> bool {
		self.failed.is_empty()
	}
}

/// Snapshot of the most recent cycle, served on `/status` so operators can
/// see per-tenant failures without grepping logs.
#[derive(Debug, Clone, Serialize)]
pub struct CycleStatus {
	pub completed_at_unix: u64,
	pub pushed: usize,
	pub deleted: usize,
	pub retained: Vec<String>,
	pub failed: Vec<String>,
	pub field_errors: Vec<String>,
}

/// Applies parsed override documents to the enforcement service. The only
/// state shared between the watch path and the polling path is the
/// last-applied map, behind a single lock.
pub struct Reconciler {
	admin: AdminClient,
	last_applied: Mutex<BTreeMap<String, LimitsPatch>>,
	metrics: Arc<SyncMetrics>,
	status: SyncMutex<Option<CycleStatus>>,
	dry_run: bool,
}

impl Reconciler {
	pub fn new(admin: AdminClient, metrics: Arc<SyncMetrics>, dry_run: bool) -> Self {
		Reconciler {
			admin,
			last_applied: Mutex::new(BTreeMap::new()),
			metrics,
			status: SyncMutex::new(None),
			dry_run,
		}
	}

	pub fn status(&self) -> Option<CycleStatus> {
		self.status.lock().expect("status lock").clone()
	}

	/// Watch-event path: push tenants whose document entry changed since the
	/// last applied state, and delete tenants that left the document.
	pub async fn apply_changes(&self, doc: &ParsedDocument) -> ApplyReport {
		let mut report = ApplyReport::default();
		let mut state = self.last_applied.lock().await;

		for (tenant, patch) in &doc.tenants {
			if state.get(tenant) == Some(patch) {
				continue;
			}
			if self.push(tenant, patch, &mut report).await {
				state.insert(tenant.clone(), patch.clone());
			}
		}

		let gone: Vec<String> = state
			.keys()
			.filter(|t| !doc.tenants.contains_key(*t))
			.cloned()
			.collect();
		for tenant in gone {
			if self.delete(&tenant, &mut report).await {
				state.remove(&tenant);
			}
		}
		drop(state);

		self.finish_cycle(doc, &report);
		report
	}

	/// Polling path: authoritative convergence against the service's actual
	/// state, compensating for missed watch events and service restarts. A
	/// tenant whose effective limits already match its document entry is
	/// not pushed again.
	pub async fn full_sync(&self, doc: &ParsedDocument) -> anyhow::Result<ApplyReport> {
		let mut report = ApplyReport::default();
		let current: BTreeMap<String, Limits> = self
			.admin
			.list_tenants()
			.await?
			.into_iter()
			.map(|t| (t.id, t.limits))
			.collect();

		for (tenant, patch) in &doc.tenants {
			let needs_push = match current.get(tenant) {
				Some(limits) => limits.with_patch(patch) != *limits,
				None => true,
			};
			if needs_push {
				self.push(tenant, patch, &mut report).await;
			}
		}

		for tenant in current.keys() {
			if !doc.tenants.contains_key(tenant) {
				self.delete(tenant, &mut report).await;
			}
		}

		*self.last_applied.lock().await = doc.tenants.clone();
		self.finish_cycle(doc, &report);
		Ok(report)
	}

	async fn push(&self, tenant: &str, patch: &LimitsPatch, report: &mut ApplyReport) -> bool {
		if self.dry_run {
			info!(tenant, ?patch, "dry run: would push limits");
			report.pushed.push(tenant.to_string());
			return true;
		}
		match self.admin.put_limits(tenant, patch).await {
			Ok(()) => {
				report.pushed.push(tenant.to_string());
				true
			},
			Err(e) => {
				error!(tenant, "limits push failed after retries: {e:#}");
				self.metrics.push_failures.inc();
				report.failed.push(tenant.to_string());
				false
			},
		}
	}

	async fn delete(&self, tenant: &str, report: &mut ApplyReport) -> bool {
		if self.dry_run {
			info!(tenant, "dry run: would delete tenant");
			report.deleted.push(tenant.to_string());
			return true;
		}
		match self.admin.delete_tenant(tenant).await {
			Ok(true) => {
				info!(tenant, "tenant removed");
				report.deleted.push(tenant.to_string());
				true
			},
			Ok(false) => {
				// The service kept it: traffic inside the protection window.
				// Leave it in the applied map so the next cycle tries again.
				info!(tenant, "tenant retained by service, will retry");
				report.retained.push(tenant.to_string());
				false
			},
			Err(e) => {
				warn!(tenant, "tenant delete failed: {e:#}");
				report.failed.push(tenant.to_string());
				false
			},
		}
	}

	fn finish_cycle(&self, doc: &ParsedDocument, report: &ApplyReport) {
		self.metrics.cycles.inc();
		let now = SystemTime::now()
			.duration_since(UNIX_EPOCH)
			.unwrap_or_default();
		if report.clean() {
			self.metrics.last_success.set(now.as_secs_f64());
		}
		*self.status.lock().expect("status lock") = Some(CycleStatus {
			completed_at_unix: now.as_secs(),
			pushed: report.pushed.len(),
			deleted: report.deleted.len(),
			retained: report.retained.clone(),
			failed: report.failed.clone(),
			field_errors: doc
				.field_errors
				.iter()
				.map(|fe| format!("{}.{}: {}", fe.tenant, fe.key, fe.error))
				.collect(),
		});
		self
			.metrics
			.tenants_applied
			.set((doc.tenants.len() - report.failed.len()) as i64);
		if !doc.field_errors.is_empty() {
			for fe in &doc.field_errors {
				warn!(
					tenant = fe.tenant,
					key = fe.key,
					value = fe.value,
					"override field skipped: {}",
					fe.error
				);
			}
		}
		info!(
			pushed = report.pushed.len(),
			deleted = report.deleted.len(),
			retained = report.retained.len(),
			failed = report.failed.len(),
			"reconciliation cycle complete"
		);
	}
}
