use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Self-reported health of the enforcement pipeline, surfaced on
/// `/api/pipeline/status`.
#[derive(Debug, Default)]
pub struct PipelineStatus {
	last_parse_success: AtomicU64,
	last_decision: AtomicU64,
	last_limits_push: AtomicU64,
}

#[derive(Debug, Serialize)]
pub struct PipelineSnapshot {
	pub last_parse_success: Option<DateTime<Utc>>,
	pub last_decision: Option<DateTime<Utc>>,
	pub last_limits_push: Option<DateTime<Utc>>,
}

pub fn unix_now() -> u64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.map(|d| d.as_secs())
		.unwrap_or_default()
}

impl PipelineStatus {
	pub fn parse_succeeded(&self) {
		self.last_parse_success.store(unix_now(), Ordering::Relaxed);
	}

	pub fn decision_made(&self) {
		self.last_decision.store(unix_now(), Ordering::Relaxed);
	}

	pub fn limits_pushed(&self) {
		self.last_limits_push.store(unix_now(), Ordering::Relaxed);
	}

	pub fn snapshot(&self) -> PipelineSnapshot {
		let ts = |a: &AtomicU64| match a.load(Ordering::Relaxed) {
			0 => None,
			secs => DateTime::from_timestamp(secs as i64, 0),
		};
		PipelineSnapshot {
			last_parse_success: ts(&self.last_parse_success),
			last_decision: ts(&self.last_decision),
			last_limits_push: ts(&self.last_limits_push),
		}
	}
}
