use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;

use crate::document::DOCUMENT_KEY;

/// Sidecar configuration. Flags win over environment variables.
#[derive(Parser, Debug, Clone)]
#[command(about = "Reconciles per-tenant overrides into the enforcement service", long_about = None)]
pub struct SyncConfig {
	/// Namespace of the overrides ConfigMap.
	#[arg(long, env = "OVERRIDES_NAMESPACE", default_value = "default")]
	pub namespace: String,

	/// Name of the overrides ConfigMap.
	#[arg(long, env = "OVERRIDES_CONFIGMAP", default_value = "tenant-overrides")]
	pub configmap: String,

	/// Key inside the ConfigMap carrying the document.
	#[arg(long, env = "OVERRIDES_KEY", default_value = DOCUMENT_KEY)]
	pub key: String,

	/// Base URL of the enforcement service's admin API.
	#[arg(long, env = "ADMIN_BASE_URL", default_value = "http://127.0.0.1:8082")]
	pub admin_base_url: String,

	/// Full re-sync interval, compensating for missed watch events.
	#[arg(long, env = "POLL_FALLBACK_SECONDS", default_value_t = 30)]
	pub poll_fallback_seconds: u64,

	/// Per-call admin request timeout.
	#[arg(long, env = "ADMIN_TIMEOUT_SECONDS", default_value_t = 5)]
	pub admin_timeout_seconds: u64,

	/// Retry attempts per admin call.
	#[arg(long, env = "ADMIN_ATTEMPTS", default_value_t = 3)]
	pub admin_attempts: u32,

	/// Probe/scrape bind address.
	#[arg(long, env = "BIND_ADDRESS", default_value = "0.0.0.0:8083")]
	pub bind_address: SocketAddr,

	/// Log intended pushes without issuing them.
	#[arg(long, env = "DRY_RUN", default_value_t = false)]
	pub dry_run: bool,
}

impl SyncConfig {
	pub fn poll_fallback(&self) -> Duration {
		Duration::from_secs(self.poll_fallback_seconds.max(1))
	}

	pub fn admin_timeout(&self) -> Duration {
		Duration::from_secs(self.admin_timeout_seconds.max(1))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults_match_the_deployment_contract() {
		let cfg = SyncConfig::parse_from(["overrides-sync"]);
		assert_eq!(cfg.key, "overrides.yaml");
		assert_eq!(cfg.poll_fallback(), Duration::from_secs(30));
		assert_eq!(cfg.admin_attempts, 3);
		assert_eq!(cfg.admin_timeout(), Duration::from_secs(5));
		assert!(!cfg.dry_run);
	}
}
