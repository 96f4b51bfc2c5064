use std::fmt::Display;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

/// Bodies are buffered in memory; nothing larger than this is ever
/// inflated, regardless of tenant limits.
pub const GLOBAL_MAX_BODY_BYTES: u64 = 16 * 1024 * 1024;

#[derive(Debug)]
pub struct Config {
	pub ext_authz_addr: SocketAddr,
	pub rate_limit_addr: SocketAddr,
	pub admin_addr: SocketAddr,
	pub stats_addr: SocketAddr,
	/// Header carrying the tenant id, compared case-insensitively.
	pub tenant_header: String,
	/// Consulted when enforcement fails internally: true admits, false
	/// denies. Reloadable without a restart.
	pub failure_mode_allow: Arc<AtomicBool>,
	/// When disabled, over-limit requests are denied instead of trimmed.
	pub selective_filter: bool,
	/// Applied when a tenant's own `max_body_bytes` is zero. Zero means no
	/// per-tenant bound (the global cap still applies).
	pub default_max_body_bytes: u64,
	pub shards: usize,
	/// End-to-end deadline for one authorization check.
	pub check_timeout: Duration,
	/// How recently a tenant must have seen traffic for a delete to be
	/// refused; matched to the reconciler's cycle length.
	pub tenant_idle_grace: Duration,
}

/// Optional YAML file config; every field can also come from the
/// environment, which wins.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct RawConfig {
	pub ext_authz_address: Option<SocketAddr>,
	pub rate_limit_address: Option<SocketAddr>,
	pub admin_address: Option<SocketAddr>,
	pub stats_address: Option<SocketAddr>,
	pub tenant_header: Option<String>,
	pub failure_mode_allow: Option<bool>,
	pub selective_filter: Option<bool>,
	pub default_max_body_bytes: Option<u64>,
	pub shards: Option<usize>,
	pub check_timeout_ms: Option<u64>,
	pub tenant_idle_grace_seconds: Option<u64>,
}

fn parse<T: FromStr>(env: &str) -> anyhow::Result<Option<T>>
where
	T::Err: Display,
{
	match std::env::var(env) {
		Ok(val) if val.is_empty() => Ok(None),
		Ok(val) => val
			.parse::<T>()
			.map(Some)
			.map_err(|e| anyhow::anyhow!("invalid env var {env}={val}: {e}")),
		Err(_) => Ok(None),
	}
}

pub fn parse_config(contents: Option<&str>) -> anyhow::Result<Config> {
	let raw: RawConfig = match contents {
		Some(c) => serde_yaml::from_str(c).context("config file parse")?,
		None => RawConfig::default(),
	};

	let failure_mode_allow = parse::<bool>("FAILURE_MODE_ALLOW")?
		.or(raw.failure_mode_allow)
		.unwrap_or(false);

	Ok(Config {
		ext_authz_addr: parse("EXT_AUTHZ_ADDRESS")?
			.or(raw.ext_authz_address)
			.unwrap_or_else(|| "0.0.0.0:8080".parse().expect("static addr")),
		rate_limit_addr: parse("RATE_LIMIT_ADDRESS")?
			.or(raw.rate_limit_address)
			.unwrap_or_else(|| "0.0.0.0:8081".parse().expect("static addr")),
		admin_addr: parse("ADMIN_ADDRESS")?
			.or(raw.admin_address)
			.unwrap_or_else(|| "0.0.0.0:8082".parse().expect("static addr")),
		stats_addr: parse("STATS_ADDRESS")?
			.or(raw.stats_address)
			.unwrap_or_else(|| "0.0.0.0:9090".parse().expect("static addr")),
		tenant_header: parse("TENANT_HEADER")?
			.or(raw.tenant_header)
			.unwrap_or_else(|| "X-Scope-OrgID".to_string()),
		failure_mode_allow: Arc::new(AtomicBool::new(failure_mode_allow)),
		selective_filter: parse("SELECTIVE_FILTER")?
			.or(raw.selective_filter)
			.unwrap_or(true),
		default_max_body_bytes: parse("DEFAULT_MAX_BODY_BYTES")?
			.or(raw.default_max_body_bytes)
			.unwrap_or(0),
		shards: parse("SHARDS")?
			.or(raw.shards)
			.unwrap_or(crate::tenant::DEFAULT_SHARDS),
		check_timeout: Duration::from_millis(
			parse("CHECK_TIMEOUT_MS")?.or(raw.check_timeout_ms).unwrap_or(500),
		),
		tenant_idle_grace: Duration::from_secs(
			parse("TENANT_IDLE_GRACE_SECONDS")?
				.or(raw.tenant_idle_grace_seconds)
				.unwrap_or(30),
		),
	})
}

impl Config {
	/// The post-decompression bound for one tenant: the tenant's own cap if
	/// set, else the configured default, always clamped to the global cap.
	pub fn effective_body_limit(&self, tenant_max_body_bytes: u64) -> u64 {
		let per_tenant = if tenant_max_body_bytes > 0 {
			tenant_max_body_bytes
		} else if self.default_max_body_bytes > 0 {
			self.default_max_body_bytes
		} else {
			u64::MAX
		};
		per_tenant.min(GLOBAL_MAX_BODY_BYTES)
	}

	pub fn failure_mode_allows(&self) -> bool {
		self.failure_mode_allow.load(Ordering::Relaxed)
	}

	#[cfg(test)]
	pub fn for_tests() -> Config {
		Config {
			ext_authz_addr: "127.0.0.1:0".parse().unwrap(),
			rate_limit_addr: "127.0.0.1:0".parse().unwrap(),
			admin_addr: "127.0.0.1:0".parse().unwrap(),
			stats_addr: "127.0.0.1:0".parse().unwrap(),
			tenant_header: "X-Scope-OrgID".to_string(),
			failure_mode_allow: Arc::new(AtomicBool::new(false)),
			selective_filter: true,
			default_max_body_bytes: 0,
			shards: 8,
			check_timeout: Duration::from_millis(500),
			tenant_idle_grace: Duration::from_secs(30),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults_without_file_or_env() {
		let cfg = parse_config(None).unwrap();
		assert_eq!(cfg.admin_addr.port(), 8082);
		assert_eq!(cfg.tenant_header, "X-Scope-OrgID");
		assert!(cfg.selective_filter);
		assert!(!cfg.failure_mode_allows());
		assert_eq!(cfg.check_timeout, Duration::from_millis(500));
	}

	#[test]
	fn file_config_overrides_defaults() {
		let cfg = parse_config(Some(
			"adminAddress: 127.0.0.1:9999\nselectiveFilter: false\nfailureModeAllow: true\n",
		))
		.unwrap();
		assert_eq!(cfg.admin_addr.port(), 9999);
		assert!(!cfg.selective_filter);
		assert!(cfg.failure_mode_allows());
	}

	#[test]
	fn body_limit_clamps_to_global_cap() {
		let cfg = Config::for_tests();
		assert_eq!(cfg.effective_body_limit(1024), 1024);
		assert_eq!(cfg.effective_body_limit(0), GLOBAL_MAX_BODY_BYTES);
		assert_eq!(cfg.effective_body_limit(1 << 40), GLOBAL_MAX_BODY_BYTES);
	}
}
