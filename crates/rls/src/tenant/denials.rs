use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use crate::reason::Reason;

pub const DEFAULT_CAPACITY: usize = 10_000;

/// A single denial, as surfaced on `/api/denials` and the CSV export.
#[derive(Debug, Clone, Serialize)]
pub struct DenialRecord {
	pub timestamp: DateTime<Utc>,
	pub tenant: String,
	pub reason: Reason,
	pub observed: u64,
	pub limit: u64,
	pub route: String,
	pub request_id: String,
}

/// Bounded ring of recent denials; the oldest entry is evicted once the
/// capacity is reached. Filtered requests are not denials and never land
/// here.
pub struct DenialLog {
	inner: Mutex<VecDeque<DenialRecord>>,
	capacity: usize,
}

impl Default for DenialLog {
	fn default() -> Self {
		Self::new(DEFAULT_CAPACITY)
	}
}

impl DenialLog {
	pub fn new(capacity: usize) -> Self {
		DenialLog {
			inner: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
			capacity,
		}
	}

	pub fn push(&self, record: DenialRecord) {
		let mut inner = self.inner.lock();
		if inner.len() == self.capacity {
			inner.pop_front();
		}
		inner.push_back(record);
	}

	pub fn len(&self) -> usize {
		self.inner.lock().len()
	}

	pub fn is_empty(&self) -> bool {
		self.inner.lock().is_empty()
	}

	/// Most-recent-first snapshot, optionally bounded to records at or after
	/// `since` and/or a single tenant.
	pub fn query(
		&self,
		since: Option<DateTime<Utc>>,
		tenant: Option<&str>,
		max: usize,
	) -> Vec<DenialRecord> {
		let inner = self.inner.lock();
		inner
			.iter()
			.rev()
			.filter(|r| since.is_none_or(|s| r.timestamp >= s))
			.filter(|r| tenant.is_none_or(|t| r.tenant == t))
			.take(max)
			.cloned()
			.collect()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn record(tenant: &str, secs: i64) -> DenialRecord {
		DenialRecord {
			timestamp: DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap(),
			tenant: tenant.to_string(),
			reason: Reason::RateLimited,
			observed: 200,
			limit: 100,
			route: "/api/v1/push".to_string(),
			request_id: format!("req-{secs}"),
		}
	}

	#[test]
	fn evicts_oldest_at_capacity() {
		let log = DenialLog::new(3);
		for i in 0..5 {
			log.push(record("a", i));
		}
		assert_eq!(log.len(), 3);
		let all = log.query(None, None, 10);
		assert_eq!(all[0].request_id, "req-4");
		assert_eq!(all[2].request_id, "req-2");
	}

	#[test]
	fn filters_by_tenant_and_since() {
		let log = DenialLog::new(100);
		log.push(record("a", 0));
		log.push(record("b", 10));
		log.push(record("a", 20));

		assert_eq!(log.query(None, Some("a"), 10).len(), 2);
		let since = DateTime::from_timestamp(1_700_000_000 + 10, 0).unwrap();
		let recent = log.query(Some(since), None, 10);
		assert_eq!(recent.len(), 2);
		assert!(recent.iter().all(|r| r.timestamp >= since));
	}
}
