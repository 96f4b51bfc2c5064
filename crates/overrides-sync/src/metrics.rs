use std::sync::atomic::AtomicU64;

use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

#[derive(Debug, Default)]
pub struct SyncMetrics {
	/// Unix time of the last cycle that applied cleanly.
	pub last_success: Gauge<f64, AtomicU64>,
	/// Tenants in sync after the last cycle.
	pub tenants_applied: Gauge,
	pub cycles: Counter,
	pub push_failures: Counter,
}

impl SyncMetrics {
	pub fn new(registry: &mut Registry) -> Self {
		let m = SyncMetrics::default();
		registry.register(
			"rls_reconciler_last_success_seconds",
			"Unix time of the last successful reconciliation cycle",
			m.last_success.clone(),
		);
		registry.register(
			"rls_reconciler_tenants_applied",
			"Tenants applied by the last reconciliation cycle",
			m.tenants_applied.clone(),
		);
		registry.register(
			"rls_reconciler_cycles",
			"Reconciliation cycles run",
			m.cycles.clone(),
		);
		registry.register(
			"rls_reconciler_push_failures",
			"Per-tenant pushes that exhausted their retries",
			m.push_failures.clone(),
		);
		m
	}
}
