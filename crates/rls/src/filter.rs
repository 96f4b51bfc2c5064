use std::collections::HashMap;

use itertools::Itertools;

use crate::tenant::TenantLimits;
use crate::types::{METRIC_NAME_LABEL, Series, WriteRequest};

/// Structural caps the filter must satisfy. Zero-valued global caps are
/// unlimited.
#[derive(Debug, Clone, Copy)]
pub struct Caps {
	pub max_labels_per_series: u32,
	pub max_label_value_length: u32,
	pub max_series_per_request: u32,
	pub max_global_series_per_metric: u32,
}

impl From<&TenantLimits> for Caps {
	fn from(limits: &TenantLimits) -> Self {
		Caps {
			max_labels_per_series: limits.max_labels_per_series,
			max_label_value_length: limits.max_label_value_length,
			max_series_per_request: limits.max_series_per_request,
			max_global_series_per_metric: limits.max_global_series_per_metric,
		}
	}
}

/// The outcome of trimming a request to fit its caps.
#[derive(Debug, Clone, Default)]
pub struct Projection {
	pub request: WriteRequest,
	pub samples_dropped: u64,
	pub labels_dropped: u64,
	pub values_truncated: u64,
	/// Series dropped by the per-request series cap.
	pub series_dropped_series_limit: u64,
	/// Series dropped by the per-metric series cap.
	pub series_dropped_metric_limit: u64,
	/// Series whose sample allocation went to zero under the rate budget.
	pub series_dropped_rate_limit: u64,
}

impl Projection {
	pub fn series_dropped(&self) -> u64 {
		self.series_dropped_series_limit
			+ self.series_dropped_metric_limit
			+ self.series_dropped_rate_limit
	}

	pub fn changed(&self) -> bool {
		self.series_dropped() > 0
			|| self.samples_dropped > 0
			|| self.labels_dropped > 0
			|| self.values_truncated > 0
	}
}

/// Produces a request that satisfies every cap while preserving as many
/// samples as possible. Pure: the same input yields the same projection,
/// with all ties broken by series fingerprint.
///
/// `sample_budget` is the whole-sample allowance from the token bucket at
/// the time of filtering; `None` means the rate check passed untouched.
pub fn project(request: WriteRequest, caps: &Caps, sample_budget: Option<u64>) -> Projection {
	let mut out = Projection::default();
	let mut series = request.series;

	// Per-series structural fixes: truncate over-long label values, then
	// prune excess labels (longest names first, never the metric name).
	for s in &mut series {
		fix_series(s, caps, &mut out);
	}

	// Per-request series cap: shed the least-informative series first.
	if series.len() as u64 > u64::from(caps.max_series_per_request) {
		let excess = series.len() - caps.max_series_per_request as usize;
		let dropped = drop_series(&mut series, |_| true, excess);
		out.series_dropped_series_limit += dropped.0;
		out.samples_dropped += dropped.1;
	}

	// Per-metric series cap.
	if caps.max_global_series_per_metric > 0 {
		let cap = caps.max_global_series_per_metric as usize;
		let mut groups: HashMap<String, usize> = HashMap::new();
		for s in &series {
			*groups
				.entry(s.metric_name().unwrap_or_default().to_string())
				.or_default() += 1;
		}
		let mut over: Vec<(String, usize)> = groups
			.into_iter()
			.filter(|(_, count)| *count > cap)
			.collect();
		over.sort();
		for (metric, count) in over {
			let dropped = drop_series(
				&mut series,
				|s| s.metric_name().unwrap_or_default() == metric,
				count - cap,
			);
			out.series_dropped_metric_limit += dropped.0;
			out.samples_dropped += dropped.1;
		}
	}

	// Sample-rate budget: shed whole samples proportionally to each series'
	// share of the total, then hand out the rounding remainder
	// deterministically.
	if let Some(budget) = sample_budget {
		let total: u64 = series.iter().map(|s| s.samples.len() as u64).sum();
		if total > budget {
			apply_budget(&mut series, total, budget, &mut out);
		}
	}

	out.request = WriteRequest { series };
	out
}

fn fix_series(series: &mut Series, caps: &Caps, out: &mut Projection) {
	let max_value = caps.max_label_value_length as usize;
	for label in &mut series.labels {
		if label.value.len() > max_value {
			truncate_at_char_boundary(&mut label.value, max_value);
			out.values_truncated += 1;
		}
	}

	let max_labels = caps.max_labels_per_series as usize;
	if series.labels.len() > max_labels {
		let mut excess = series.labels.len() - max_labels;
		// Drop order: longest label name first, ties lexicographically.
		let mut candidates: Vec<usize> = (0..series.labels.len())
			.filter(|&i| series.labels[i].name != METRIC_NAME_LABEL)
			.collect();
		candidates.sort_by(|&a, &b| {
			let (la, lb) = (&series.labels[a], &series.labels[b]);
			lb.name
				.len()
				.cmp(&la.name.len())
				.then_with(|| la.name.cmp(&lb.name))
		});
		let drop: Vec<usize> = candidates.into_iter().take(excess).collect();
		excess = drop.len();
		let mut idx = 0usize;
		series.labels.retain(|_| {
			let dropped = drop.contains(&idx);
			idx += 1;
			!dropped
		});
		out.labels_dropped += excess as u64;
	}
}

fn truncate_at_char_boundary(value: &mut String, max: usize) {
	if value.len() <= max {
		return;
	}
	let mut end = max;
	while !value.is_char_boundary(end) {
		end -= 1;
	}
	value.truncate(end);
}

/// Removes `excess` series among those matching `select`, least samples
/// first with fingerprint tie-break. Returns (series_dropped, samples_dropped).
fn drop_series<F: Fn(&Series) -> bool>(
	series: &mut Vec<Series>,
	select: F,
	excess: usize,
) -> (u64, u64) {
	let drop: Vec<usize> = series
		.iter()
		.enumerate()
		.filter(|(_, s)| select(s))
		.map(|(i, s)| (i, s.samples.len() as u64, s.fingerprint()))
		.sorted_by_key(|&(_, count, fp)| (count, fp))
		.take(excess)
		.map(|(i, ..)| i)
		.collect();
	let samples_dropped: u64 = drop.iter().map(|&i| series[i].samples.len() as u64).sum();
	let mut idx = 0usize;
	series.retain(|_| {
		let dropped = drop.contains(&idx);
		idx += 1;
		!dropped
	});
	(drop.len() as u64, samples_dropped)
}

fn apply_budget(series: &mut Vec<Series>, total: u64, budget: u64, out: &mut Projection) {
	// Floor of the proportional share per series.
	let mut admitted: Vec<u64> = series
		.iter()
		.map(|s| ((s.samples.len() as u128 * budget as u128) / total as u128) as u64)
		.collect();
	let mut remainder = budget - admitted.iter().sum::<u64>();

	// Hand the rounding remainder to the largest series first, ties broken
	// by fingerprint.
	let mut order: Vec<usize> = (0..series.len()).collect();
	order.sort_by_key(|&i| {
		(
			std::cmp::Reverse(series[i].samples.len() as u64),
			series[i].fingerprint(),
		)
	});
	for &i in order.iter().cycle().take(order.len() * 2) {
		if remainder == 0 {
			break;
		}
		if admitted[i] < series[i].samples.len() as u64 {
			admitted[i] += 1;
			remainder -= 1;
		}
	}

	for (s, keep) in series.iter_mut().zip(&admitted) {
		let keep = *keep as usize;
		if keep < s.samples.len() {
			out.samples_dropped += (s.samples.len() - keep) as u64;
			s.samples.truncate(keep);
		}
	}
	let before = series.len();
	series.retain(|s| !s.samples.is_empty());
	out.series_dropped_rate_limit += (before - series.len()) as u64;
}

/// Post-condition used by tests: does `request` satisfy every cap and the
/// sample budget?
pub fn satisfies(request: &WriteRequest, caps: &Caps, sample_budget: Option<u64>) -> bool {
	if request.series.len() as u64 > u64::from(caps.max_series_per_request) {
		return false;
	}
	if let Some(budget) = sample_budget {
		if request.sample_count() > budget {
			return false;
		}
	}
	if caps.max_global_series_per_metric > 0 {
		let mut groups: HashMap<&str, u64> = HashMap::new();
		for s in &request.series {
			*groups.entry(s.metric_name().unwrap_or_default()).or_default() += 1;
		}
		if groups
			.values()
			.any(|&c| c > u64::from(caps.max_global_series_per_metric))
		{
			return false;
		}
	}
	request.series.iter().all(|s| {
		s.labels.len() as u64 <= u64::from(caps.max_labels_per_series)
			&& s.labels
				.iter()
				.all(|l| l.value.len() as u64 <= u64::from(caps.max_label_value_length))
	})
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::types::{Label, series};

	fn caps() -> Caps {
		Caps {
			max_labels_per_series: 16,
			max_label_value_length: 64,
			max_series_per_request: 1000,
			max_global_series_per_metric: 0,
		}
	}

	#[test]
	fn untouched_request_is_unchanged() {
		let req = WriteRequest {
			series: vec![series("up", &[("job", "a")], 5)],
		};
		let p = project(req.clone(), &caps(), None);
		assert!(!p.changed());
		assert_eq!(p.request, req);
	}

	#[test]
	fn truncates_long_label_values_from_the_right() {
		let req = WriteRequest {
			series: vec![series("up", &[("path", &"a".repeat(100))], 1)],
		};
		let p = project(req, &caps(), None);
		assert_eq!(p.values_truncated, 1);
		let value = &p.request.series[0]
			.labels
			.iter()
			.find(|l| l.name == "path")
			.unwrap()
			.value;
		assert_eq!(value.len(), 64);
		assert!(value.chars().all(|c| c == 'a'));
	}

	#[test]
	fn prunes_longest_label_names_but_never_the_metric_name() {
		let mut c = caps();
		c.max_labels_per_series = 3;
		let req = WriteRequest {
			series: vec![series(
				"up",
				&[
					("zz", "1"),
					("a_very_long_label_name", "2"),
					("medium_name", "3"),
					("b", "4"),
				],
				1,
			)],
		};
		let p = project(req, &c, None);
		assert_eq!(p.labels_dropped, 2);
		let names: Vec<&str> = p.request.series[0]
			.labels
			.iter()
			.map(|l| l.name.as_str())
			.collect();
		// Longest names went first; __name__ survives regardless of length.
		assert_eq!(names, vec![METRIC_NAME_LABEL, "zz", "b"]);
	}

	#[test]
	fn series_cap_drops_least_sampled_first() {
		let mut c = caps();
		c.max_series_per_request = 3;
		let req = WriteRequest {
			series: vec![
				series("a", &[("i", "0")], 1),
				series("b", &[("i", "1")], 1),
				series("c", &[("i", "2")], 5),
				series("d", &[("i", "3")], 5),
				series("e", &[("i", "4")], 10),
			],
		};
		let p = project(req, &c, None);
		assert_eq!(p.series_dropped_series_limit, 2);
		assert_eq!(p.samples_dropped, 2);
		assert_eq!(p.request.series.len(), 3);
		let kept: Vec<usize> = p.request.series.iter().map(|s| s.samples.len()).collect();
		assert_eq!(kept, vec![5, 5, 10]);
	}

	#[test]
	fn per_metric_cap_trims_within_the_group() {
		let mut c = caps();
		c.max_global_series_per_metric = 2;
		let req = WriteRequest {
			series: vec![
				series("http", &[("i", "0")], 4),
				series("http", &[("i", "1")], 2),
				series("http", &[("i", "2")], 6),
				series("disk", &[("i", "3")], 1),
			],
		};
		let p = project(req, &c, None);
		assert_eq!(p.series_dropped_metric_limit, 1);
		assert_eq!(p.samples_dropped, 2);
		// The 2-sample http series went; disk was untouched.
		assert_eq!(p.request.series.len(), 3);
		assert!(
			p.request
				.series
				.iter()
				.any(|s| s.metric_name() == Some("disk"))
		);
	}

	#[test]
	fn budget_trims_proportionally() {
		// 10 series x 20 samples against a budget of 50: 5 samples each.
		let req = WriteRequest {
			series: (0..10)
				.map(|i| series("m", &[("i", &i.to_string())], 20))
				.collect(),
		};
		let p = project(req, &caps(), Some(50));
		assert_eq!(p.samples_dropped, 150);
		assert_eq!(p.request.sample_count(), 50);
		assert!(p.request.series.iter().all(|s| s.samples.len() == 5));
	}

	#[test]
	fn budget_remainder_is_deterministic_and_exhausts_budget() {
		let req = WriteRequest {
			series: vec![
				series("m", &[("i", "0")], 7),
				series("m", &[("i", "1")], 5),
				series("m", &[("i", "2")], 3),
			],
		};
		let p = project(req.clone(), &caps(), Some(10));
		assert_eq!(p.request.sample_count(), 10);
		// Same input, same output.
		let q = project(req, &caps(), Some(10));
		assert_eq!(p.request, q.request);
	}

	#[test]
	fn budget_zeroed_series_are_dropped() {
		let req = WriteRequest {
			series: vec![
				series("m", &[("i", "0")], 100),
				series("m", &[("i", "1")], 1),
			],
		};
		let p = project(req, &caps(), Some(3));
		assert_eq!(p.request.sample_count(), 3);
		assert!(satisfies(&p.request, &caps(), Some(3)));
		assert_eq!(p.series_dropped_rate_limit, 1);
	}

	#[test]
	fn output_always_satisfies_caps() {
		let c = Caps {
			max_labels_per_series: 3,
			max_label_value_length: 8,
			max_series_per_request: 4,
			max_global_series_per_metric: 2,
		};
		let req = WriteRequest {
			series: (0..12)
				.map(|i| {
					let mut s = series(
						if i % 2 == 0 { "even" } else { "odd" },
						&[
							("instance", &format!("host-{i}-with-a-long-suffix")),
							("zone", "us-east-1"),
							("shard", &i.to_string()),
						],
						i + 1,
					);
					s.labels.push(Label {
						name: "extra".into(),
						value: "x".into(),
					});
					s
				})
				.collect(),
		};
		for budget in [None, Some(0), Some(1), Some(7), Some(1000)] {
			let p = project(req.clone(), &c, budget);
			assert!(
				satisfies(&p.request, &c, budget),
				"caps violated for budget {budget:?}"
			);
		}
	}

	#[test]
	fn projection_is_input_order_independent() {
		let c = Caps {
			max_labels_per_series: 16,
			max_label_value_length: 64,
			max_series_per_request: 3,
			max_global_series_per_metric: 0,
		};
		let mut input: Vec<Series> = (0..8)
			.map(|i| series("m", &[("i", &i.to_string())], (i % 4) + 1))
			.collect();
		let forward = project(
			WriteRequest {
				series: input.clone(),
			},
			&c,
			Some(6),
		);
		input.reverse();
		let reversed = project(WriteRequest { series: input }, &c, Some(6));

		let key = |s: &Series| s.fingerprint();
		let mut a = forward.request.series;
		let mut b = reversed.request.series;
		a.sort_by_key(key);
		b.sort_by_key(key);
		assert_eq!(a, b);
	}
}
