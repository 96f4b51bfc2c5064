use std::sync::atomic::{AtomicU64, Ordering};

use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};

use crate::reason::Reason;

/// One cell per minute for seven days.
pub const RING_CELLS: u64 = 7 * 24 * 60;

/// Per-minute decision counters for one tenant, kept in a fixed ring
/// indexed by `unix_minute % RING_CELLS`. Updates are O(1); a range query
/// walks at most the requested number of cells. Cells whose embedded minute
/// no longer matches their slot are treated as empty and re-stamped on the
/// next write, which is what evicts data older than the ring.
pub struct MinuteRing {
	cells: Box<[Cell]>,
}

struct Cell {
	/// Unix minute this cell currently holds; 0 means never written.
	minute: AtomicU64,
	requests: AtomicU64,
	allowed: AtomicU64,
	denied: AtomicU64,
	filtered: AtomicU64,
	bytes: AtomicU64,
	samples_ingested: AtomicU64,
	samples_denied: AtomicU64,
	reasons: [AtomicU64; Reason::COUNT],
}

impl Cell {
	fn empty() -> Self {
		Cell {
			minute: AtomicU64::new(0),
			requests: AtomicU64::new(0),
			allowed: AtomicU64::new(0),
			denied: AtomicU64::new(0),
			filtered: AtomicU64::new(0),
			bytes: AtomicU64::new(0),
			samples_ingested: AtomicU64::new(0),
			samples_denied: AtomicU64::new(0),
			reasons: std::array::from_fn(|_| AtomicU64::new(0)),
		}
	}

	fn zero(&self) {
		self.requests.store(0, Ordering::Relaxed);
		self.allowed.store(0, Ordering::Relaxed);
		self.denied.store(0, Ordering::Relaxed);
		self.filtered.store(0, Ordering::Relaxed);
		self.bytes.store(0, Ordering::Relaxed);
		self.samples_ingested.store(0, Ordering::Relaxed);
		self.samples_denied.store(0, Ordering::Relaxed);
		for r in &self.reasons {
			r.store(0, Ordering::Relaxed);
		}
	}
}

/// What a single decision contributes to the ring.
#[derive(Debug, Clone, Copy)]
pub struct Tick {
	pub allowed: bool,
	pub denied: Option<Reason>,
	pub filtered: bool,
	pub bytes: u64,
	pub samples_ingested: u64,
	pub samples_denied: u64,
}

/// Counters summed over a query window.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WindowCounters {
	pub requests: u64,
	pub allowed: u64,
	pub denied: u64,
	pub filtered: u64,
	pub bytes: u64,
	pub samples_ingested: u64,
	pub samples_denied: u64,
	#[serde(serialize_with = "serialize_reasons")]
	pub denial_reasons: [u64; Reason::COUNT],
}

fn serialize_reasons<S: Serializer>(
	reasons: &[u64; Reason::COUNT],
	serializer: S,
) -> Result<S::Ok, S::Error> {
	let mut map = serializer.serialize_map(None)?;
	for (reason, count) in Reason::ALL.iter().zip(reasons) {
		if *count > 0 {
			map.serialize_entry(reason.as_str(), count)?;
		}
	}
	map.end()
}

impl Default for MinuteRing {
	fn default() -> Self {
		Self::new()
	}
}

impl MinuteRing {
	pub fn new() -> Self {
		MinuteRing {
			cells: (0..RING_CELLS).map(|_| Cell::empty()).collect(),
		}
	}

	fn cell_for(&self, unix_minute: u64) -> &Cell {
		let idx = (unix_minute % RING_CELLS) as usize;
		let cell = &self.cells[idx];
		let stamped = cell.minute.load(Ordering::Acquire);
		if stamped != unix_minute
			&& cell
				.minute
				.compare_exchange(stamped, unix_minute, Ordering::AcqRel, Ordering::Acquire)
				.is_ok()
		{
			// This cell held a minute from a previous lap of the ring.
			cell.zero();
		}
		cell
	}

	pub fn record(&self, now_unix_secs: u64, tick: Tick) {
		let cell = self.cell_for(now_unix_secs / 60);
		cell.requests.fetch_add(1, Ordering::Relaxed);
		if tick.allowed {
			cell.allowed.fetch_add(1, Ordering::Relaxed);
		}
		if tick.filtered {
			cell.filtered.fetch_add(1, Ordering::Relaxed);
		}
		if let Some(reason) = tick.denied {
			cell.denied.fetch_add(1, Ordering::Relaxed);
			cell.reasons[reason.index()].fetch_add(1, Ordering::Relaxed);
		}
		cell.bytes.fetch_add(tick.bytes, Ordering::Relaxed);
		cell
			.samples_ingested
			.fetch_add(tick.samples_ingested, Ordering::Relaxed);
		cell
			.samples_denied
			.fetch_add(tick.samples_denied, Ordering::Relaxed);
	}

	/// Sums the last `range_minutes` cells ending at the current minute.
	/// Cells whose stamp does not match the minute they would represent are
	/// skipped, which lazily evicts anything older than the ring.
	pub fn query(&self, now_unix_secs: u64, range_minutes: u64) -> WindowCounters {
		let current_minute = now_unix_secs / 60;
		let range = range_minutes.clamp(1, RING_CELLS);
		let mut out = WindowCounters::default();
		for back in 0..range {
			let Some(minute) = current_minute.checked_sub(back) else {
				break;
			};
			let cell = &self.cells[(minute % RING_CELLS) as usize];
			if cell.minute.load(Ordering::Acquire) != minute {
				continue;
			}
			out.requests += cell.requests.load(Ordering::Relaxed);
			out.allowed += cell.allowed.load(Ordering::Relaxed);
			out.denied += cell.denied.load(Ordering::Relaxed);
			out.filtered += cell.filtered.load(Ordering::Relaxed);
			out.bytes += cell.bytes.load(Ordering::Relaxed);
			out.samples_ingested += cell.samples_ingested.load(Ordering::Relaxed);
			out.samples_denied += cell.samples_denied.load(Ordering::Relaxed);
			for (sum, v) in out.denial_reasons.iter_mut().zip(&cell.reasons) {
				*sum += v.load(Ordering::Relaxed);
			}
		}
		out
	}
}

impl Tick {
	pub fn allow(bytes: u64, samples: u64) -> Tick {
		Tick {
			allowed: true,
			denied: None,
			filtered: false,
			bytes,
			samples_ingested: samples,
			samples_denied: 0,
		}
	}

	pub fn deny(reason: Reason, bytes: u64, samples: u64) -> Tick {
		Tick {
			allowed: false,
			denied: Some(reason),
			filtered: false,
			bytes,
			samples_ingested: 0,
			samples_denied: samples,
		}
	}

	pub fn filter(bytes: u64, samples_admitted: u64, samples_dropped: u64) -> Tick {
		Tick {
			allowed: false,
			denied: None,
			filtered: true,
			bytes,
			samples_ingested: samples_admitted,
			samples_denied: samples_dropped,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	const T0: u64 = 1_700_000_000;

	#[test]
	fn decisions_round_trip_through_window() {
		let ring = MinuteRing::new();
		for i in 0..10 {
			ring.record(T0 + i, Tick::allow(100, 10));
		}
		ring.record(T0 + 10, Tick::deny(Reason::RateLimited, 50, 5));
		ring.record(T0 + 11, Tick::filter(70, 7, 3));

		let window = ring.query(T0 + 11, 15);
		assert_eq!(window.requests, 12);
		assert_eq!(window.allowed, 10);
		assert_eq!(window.denied, 1);
		assert_eq!(window.filtered, 1);
		assert_eq!(window.samples_ingested, 107);
		assert_eq!(window.samples_denied, 8);
		assert_eq!(window.denial_reasons[Reason::RateLimited.index()], 1);
	}

	#[test]
	fn range_excludes_older_minutes() {
		let ring = MinuteRing::new();
		ring.record(T0, Tick::allow(1, 1));
		// Ten minutes later, a one-minute window must not see the old cell.
		let later = T0 + 600;
		ring.record(later, Tick::allow(1, 1));
		assert_eq!(ring.query(later, 1).requests, 1);
		assert_eq!(ring.query(later, 11).requests, 2);
	}

	#[test]
	fn lap_of_the_ring_evicts_stale_cell() {
		let ring = MinuteRing::new();
		ring.record(T0, Tick::allow(1, 1));
		// One full ring later the same slot is reused; the stale minute must
		// be zeroed, not summed into the new one.
		let lap = T0 + RING_CELLS * 60;
		ring.record(lap, Tick::allow(3, 3));
		let window = ring.query(lap, 5);
		assert_eq!(window.requests, 1);
		assert_eq!(window.samples_ingested, 3);
	}

	#[test]
	fn reasons_serialize_as_named_map() {
		let ring = MinuteRing::new();
		ring.record(T0, Tick::deny(Reason::BodyTooLarge, 10, 0));
		let json = serde_json::to_value(ring.query(T0, 1)).unwrap();
		assert_eq!(json["denial_reasons"]["body_too_large"], 1);
		assert!(json["denial_reasons"].get("rate_limited").is_none());
	}
}
