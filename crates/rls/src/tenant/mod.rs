pub mod bucket;
pub mod counters;
pub mod denials;
pub mod limits;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use arc_swap::ArcSwap;
pub use bucket::TokenBucket;
pub use counters::{MinuteRing, Tick, WindowCounters};
pub use denials::{DenialLog, DenialRecord};
pub use limits::{LimitsUpdate, TenantLimits};
use parking_lot::{Mutex, RwLock};
use tracing::warn;

/// One tenant's mutable enforcement state. Limits are swapped atomically;
/// the bucket is the only field that takes a lock on the decision path.
pub struct Tenant {
	pub id: Arc<str>,
	limits: ArcSwap<TenantLimits>,
	pub bucket: Mutex<TokenBucket>,
	pub counters: MinuteRing,
	last_seen: AtomicU64,
}

impl Tenant {
	fn new(id: Arc<str>, limits: TenantLimits, now: Instant) -> Self {
		let capacity = limits.burst_capacity();
		Tenant {
			id,
			limits: ArcSwap::from_pointee(limits),
			bucket: Mutex::new(TokenBucket::new(capacity, now)),
			counters: MinuteRing::new(),
			last_seen: AtomicU64::new(0),
		}
	}

	pub fn limits(&self) -> Arc<TenantLimits> {
		self.limits.load_full()
	}

	/// Atomically replaces the limit set. Counters are preserved; the bucket
	/// is clamped if the new burst capacity is smaller than the old one.
	pub fn set_limits(&self, limits: TenantLimits) {
		let capacity = limits.burst_capacity();
		self.limits.store(Arc::new(limits));
		self.bucket.lock().reset_capacity(capacity);
	}

	/// Marks the tenant as having seen enforcement traffic.
	pub fn touch(&self, now_unix_secs: u64) {
		self.last_seen.store(now_unix_secs, Ordering::Relaxed);
	}

	pub fn last_seen(&self) -> Option<u64> {
		match self.last_seen.load(Ordering::Relaxed) {
			0 => None,
			t => Some(t),
		}
	}

	/// Tokens currently in the bucket after refill, for snapshots.
	pub fn observe_tokens(&self, now: Instant) -> f64 {
		let limits = self.limits.load();
		let mut bucket = self.bucket.lock();
		bucket.refill(limits.samples_per_second, limits.burst_capacity(), now);
		bucket.available()
	}
}

pub enum DeleteOutcome {
	Deleted,
	/// The tenant saw traffic since the given cutoff and was kept.
	Retained,
	NotFound,
}

pub enum Lookup {
	Exact(Arc<Tenant>),
	/// Found only under a differently-cased id (compatibility fallback).
	CaseInsensitive(Arc<Tenant>),
	Missing,
}

/// Registry of tenants, sharded by FNV-1a hash of the tenant id. The
/// decision path touches exactly one shard read lock plus the tenant's own
/// bucket mutex; there is no global lock.
pub struct TenantStore {
	shards: Box<[Shard]>,
	mask: u64,
}

struct Shard {
	tenants: RwLock<HashMap<Arc<str>, Arc<Tenant>>>,
}

pub const DEFAULT_SHARDS: usize = 64;

fn fnv1a(data: &[u8]) -> u64 {
	let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
	for b in data {
		hash ^= u64::from(*b);
		hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
	}
	hash
}

impl TenantStore {
	/// `shard_count` is rounded up to a power of two.
	pub fn new(shard_count: usize) -> Self {
		let count = shard_count.max(1).next_power_of_two();
		TenantStore {
			shards: (0..count)
				.map(|_| Shard {
					tenants: RwLock::new(HashMap::new()),
				})
				.collect(),
			mask: count as u64 - 1,
		}
	}

	fn shard(&self, id: &str) -> &Shard {
		&self.shards[(fnv1a(id.as_bytes()) & self.mask) as usize]
	}

	pub fn get(&self, id: &str) -> Option<Arc<Tenant>> {
		self.shard(id).tenants.read().get(id).cloned()
	}

	/// Fetches the tenant, creating it with default limits on first
	/// reference.
	pub fn get_or_create(&self, id: &str) -> Arc<Tenant> {
		let shard = self.shard(id);
		if let Some(t) = shard.tenants.read().get(id) {
			return t.clone();
		}
		let mut tenants = shard.tenants.write();
		tenants
			.entry(Arc::from(id))
			.or_insert_with(|| {
				Arc::new(Tenant::new(
					Arc::from(id),
					TenantLimits::default(),
					Instant::now(),
				))
			})
			.clone()
	}

	/// Replaces (or installs) a tenant's limits. Existing counters and
	/// last-seen state survive the update.
	pub fn upsert(&self, id: &str, limits: TenantLimits) -> Arc<Tenant> {
		let tenant = self.get_or_create(id);
		tenant.set_limits(limits);
		tenant
	}

	/// Removes the tenant unless it saw traffic at or after
	/// `traffic_cutoff_unix_secs`, which protects tenants that were only
	/// transiently absent from the overrides document.
	pub fn delete_if_idle(&self, id: &str, traffic_cutoff_unix_secs: u64) -> DeleteOutcome {
		let shard = self.shard(id);
		let mut tenants = shard.tenants.write();
		let Some(tenant) = tenants.get(id) else {
			return DeleteOutcome::NotFound;
		};
		if tenant
			.last_seen()
			.is_some_and(|seen| seen >= traffic_cutoff_unix_secs)
		{
			return DeleteOutcome::Retained;
		}
		tenants.remove(id);
		DeleteOutcome::Deleted
	}

	/// Admin lookup: exact match first, then a case-insensitive fallback
	/// (kept for compatibility with older override documents; every hit is
	/// logged so the divergence is visible).
	pub fn lookup(&self, id: &str) -> Lookup {
		if let Some(t) = self.get(id) {
			return Lookup::Exact(t);
		}
		for shard in &self.shards {
			let tenants = shard.tenants.read();
			if let Some((actual, t)) = tenants
				.iter()
				.find(|(key, _)| key.eq_ignore_ascii_case(id))
			{
				warn!(
					requested = id,
					actual = actual.as_ref(),
					"tenant matched only case-insensitively"
				);
				return Lookup::CaseInsensitive(t.clone());
			}
		}
		Lookup::Missing
	}

	/// Snapshot of all tenants, sorted by id.
	pub fn list(&self) -> Vec<Arc<Tenant>> {
		let mut out: Vec<Arc<Tenant>> = self
			.shards
			.iter()
			.flat_map(|s| s.tenants.read().values().cloned().collect::<Vec<_>>())
			.collect();
		out.sort_by(|a, b| a.id.cmp(&b.id));
		out
	}

	pub fn len(&self) -> usize {
		self.shards.iter().map(|s| s.tenants.read().len()).sum()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn creates_on_first_reference_with_defaults() {
		let store = TenantStore::new(8);
		let t = store.get_or_create("acme");
		assert_eq!(*t.limits(), TenantLimits::default());
		assert_eq!(store.len(), 1);
		// Same Arc on a second reference.
		assert!(Arc::ptr_eq(&t, &store.get_or_create("acme")));
	}

	#[test]
	fn upsert_preserves_counters() {
		let store = TenantStore::new(8);
		let t = store.get_or_create("acme");
		t.counters.record(1_700_000_000, Tick::allow(10, 10));

		store.upsert(
			"acme",
			TenantLimits {
				samples_per_second: 500.0,
				..TenantLimits::default()
			},
		);
		let t = store.get("acme").unwrap();
		assert_eq!(t.limits().samples_per_second, 500.0);
		assert_eq!(t.counters.query(1_700_000_000, 1).requests, 1);
	}

	#[test]
	fn limits_swap_is_whole_value() {
		let store = TenantStore::new(8);
		let t = store.upsert(
			"acme",
			TenantLimits {
				samples_per_second: 100.0,
				max_body_bytes: 1024,
				..TenantLimits::default()
			},
		);
		let before = t.limits();
		store.upsert(
			"acme",
			TenantLimits {
				samples_per_second: 200.0,
				max_body_bytes: 2048,
				..TenantLimits::default()
			},
		);
		// The snapshot taken before the swap still holds the old pair.
		assert_eq!(before.samples_per_second, 100.0);
		assert_eq!(before.max_body_bytes, 1024);
		let after = t.limits();
		assert_eq!(after.samples_per_second, 200.0);
		assert_eq!(after.max_body_bytes, 2048);
	}

	#[test]
	fn delete_respects_recent_traffic() {
		let store = TenantStore::new(8);
		let t = store.get_or_create("acme");
		t.touch(1_000);

		assert!(matches!(
			store.delete_if_idle("acme", 500),
			DeleteOutcome::Retained
		));
		assert!(store.get("acme").is_some());

		assert!(matches!(
			store.delete_if_idle("acme", 2_000),
			DeleteOutcome::Deleted
		));
		assert!(store.get("acme").is_none());
		assert!(matches!(
			store.delete_if_idle("acme", 0),
			DeleteOutcome::NotFound
		));
	}

	#[test]
	fn lookup_falls_back_to_case_insensitive() {
		let store = TenantStore::new(8);
		store.get_or_create("Acme");
		assert!(matches!(store.lookup("Acme"), Lookup::Exact(_)));
		assert!(matches!(store.lookup("acme"), Lookup::CaseInsensitive(_)));
		assert!(matches!(store.lookup("nobody"), Lookup::Missing));
	}

	#[test]
	fn shrinking_limits_clamps_bucket() {
		let store = TenantStore::new(8);
		let t = store.upsert(
			"acme",
			TenantLimits {
				samples_per_second: 1000.0,
				burst_percent: 0.2,
				..TenantLimits::default()
			},
		);
		assert_eq!(t.observe_tokens(Instant::now()).round() as u64, 1200);

		store.upsert(
			"acme",
			TenantLimits {
				samples_per_second: 10.0,
				..TenantLimits::default()
			},
		);
		assert!(t.observe_tokens(Instant::now()) <= 10.0);
	}
}
