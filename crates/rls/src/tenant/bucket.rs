use std::time::Instant;

/// Token bucket over fractional tokens. Refills lazily on observation;
/// withdrawal happens only after the decision that consumes the tokens has
/// been produced, so a rejected decision never debits.
///
/// The caller provides `now` explicitly, which keeps the bucket itself pure
/// and makes admission traces reproducible in tests.
#[derive(Debug)]
pub struct TokenBucket {
	tokens: f64,
	last_refill: Instant,
}

impl TokenBucket {
	/// A fresh bucket starts full: a newly-seen tenant gets its whole burst.
	pub fn new(capacity: f64, now: Instant) -> Self {
		TokenBucket {
			tokens: capacity,
			last_refill: now,
		}
	}

	/// Advances the bucket to `now`, accruing `rate` tokens per second up to
	/// `capacity`. Also clamps tokens when a limits change shrank the burst.
	pub fn refill(&mut self, rate: f64, capacity: f64, now: Instant) {
		let elapsed = now.saturating_duration_since(self.last_refill);
		self.tokens = (self.tokens + elapsed.as_secs_f64() * rate).min(capacity);
		self.last_refill = now;
	}

	/// Tokens currently observable (call `refill` first).
	pub fn available(&self) -> f64 {
		self.tokens
	}

	pub fn has(&self, n: u64) -> bool {
		self.tokens >= n as f64
	}

	/// Commits a withdrawal decided earlier in the same critical section.
	pub fn withdraw(&mut self, n: u64) {
		self.tokens = (self.tokens - n as f64).max(0.0);
	}

	/// Clamps the bucket to a new capacity after a limits change. A shrunk
	/// burst takes effect immediately; a raised one adds headroom that fills
	/// on subsequent refills.
	pub fn reset_capacity(&mut self, capacity: f64) {
		self.tokens = self.tokens.min(capacity);
	}
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use super::*;

	#[test]
	fn starts_full_and_withdraws() {
		let t0 = Instant::now();
		let mut b = TokenBucket::new(1200.0, t0);
		assert!(b.has(1200));
		assert!(!b.has(1201));
		b.withdraw(100);
		assert_eq!(b.available(), 1100.0);
	}

	#[test]
	fn refills_at_rate_up_to_capacity() {
		let t0 = Instant::now();
		let mut b = TokenBucket::new(120.0, t0);
		b.withdraw(120);
		assert_eq!(b.available(), 0.0);

		b.refill(100.0, 120.0, t0 + Duration::from_millis(500));
		assert!((b.available() - 50.0).abs() < 1e-9);

		// Long idle: capped at capacity.
		b.refill(100.0, 120.0, t0 + Duration::from_secs(3600));
		assert_eq!(b.available(), 120.0);
	}

	#[test]
	fn never_goes_negative() {
		let t0 = Instant::now();
		let mut b = TokenBucket::new(10.0, t0);
		b.withdraw(25);
		assert_eq!(b.available(), 0.0);
	}

	#[test]
	fn admission_bounded_by_rate_times_window_plus_burst() {
		// Over any simulated window T, admitted <= R*T + B.
		let rate = 100.0;
		let burst = 120.0;
		let t0 = Instant::now();
		let mut b = TokenBucket::new(burst, t0);
		let mut admitted: u64 = 0;
		let window_secs = 10u64;

		for step in 0..(window_secs * 10) {
			let now = t0 + Duration::from_millis(step * 100);
			b.refill(rate, burst, now);
			// Greedy client: take everything available, 7 tokens at a time.
			while b.has(7) {
				b.withdraw(7);
				admitted += 7;
			}
		}
		let bound = rate * window_secs as f64 + burst;
		assert!(
			(admitted as f64) <= bound,
			"admitted {admitted} exceeds bound {bound}"
		);
	}

	#[test]
	fn shrinking_capacity_clamps_tokens() {
		let t0 = Instant::now();
		let mut b = TokenBucket::new(1000.0, t0);
		b.reset_capacity(50.0);
		assert_eq!(b.available(), 50.0);
	}
}
