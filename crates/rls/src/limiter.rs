use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tracing::debug;

use crate::config::Config;
use crate::filter::{self, Caps, Projection};
use crate::metrics::Metrics;
use crate::parse::{Encoding, ParseError, ParsedWrite, parse_write_request};
use crate::pipeline::{PipelineStatus, unix_now};
use crate::reason::Reason;
use crate::tenant::{DenialLog, DenialRecord, Tenant, TenantLimits, TenantStore, Tick};
use crate::types::METRIC_NAME_LABEL;

/// The outcome of one authorization check.
#[derive(Debug)]
pub enum Decision {
	Allow {
		samples: u64,
		body_bytes: u64,
	},
	Deny {
		reason: Reason,
		observed: u64,
		limit: u64,
		samples: u64,
		body_bytes: u64,
		message: String,
	},
	Filter {
		projection: Projection,
		samples_before: u64,
		body_bytes: u64,
	},
}

impl Decision {
	pub fn reason(&self) -> Option<Reason> {
		match self {
			Decision::Deny { reason, .. } => Some(*reason),
			_ => None,
		}
	}

	fn deny(reason: Reason, observed: u64, limit: u64, samples: u64, body_bytes: u64) -> Decision {
		Decision::Deny {
			reason,
			observed,
			limit,
			samples,
			body_bytes,
			message: format!("{reason}: observed {observed}, limit {limit}"),
		}
	}
}

/// Everything about the incoming request the limiter needs besides the
/// body itself.
#[derive(Debug, Clone, Copy)]
pub struct RequestMeta<'a> {
	pub tenant_id: &'a str,
	pub route: &'a str,
	pub request_id: &'a str,
}

/// The decision engine. Owns no state of its own: tenants live in the
/// store, denials in the log, and both are shared with the admin API.
pub struct Limiter {
	store: Arc<TenantStore>,
	denials: Arc<DenialLog>,
	metrics: Arc<Metrics>,
	pipeline: Arc<PipelineStatus>,
	cfg: Arc<Config>,
}

impl Limiter {
	pub fn new(
		store: Arc<TenantStore>,
		denials: Arc<DenialLog>,
		metrics: Arc<Metrics>,
		pipeline: Arc<PipelineStatus>,
		cfg: Arc<Config>,
	) -> Self {
		Limiter {
			store,
			denials,
			metrics,
			pipeline,
			cfg,
		}
	}

	pub fn store(&self) -> &Arc<TenantStore> {
		&self.store
	}

	/// Parses and decides one write. Counters, denial records, and metrics
	/// are recorded here, exactly once per decision.
	pub fn check(&self, meta: RequestMeta<'_>, body: &[u8], encoding: Encoding) -> Decision {
		let now_unix = unix_now();
		let tenant = self.store.get_or_create(meta.tenant_id);
		tenant.touch(now_unix);
		let limits = tenant.limits();

		let bound = self.cfg.effective_body_limit(limits.max_body_bytes);
		let decision = match parse_write_request(body, encoding, bound) {
			Ok(parsed) => {
				self.pipeline.parse_succeeded();
				self.evaluate(&tenant, &limits, parsed)
			},
			Err(ParseError::BodyTooLarge { observed, limit }) => {
				Decision::deny(Reason::BodyTooLarge, observed, limit, 0, observed)
			},
			Err(err) => Decision::Deny {
				reason: Reason::ParseError,
				observed: 0,
				limit: 0,
				samples: 0,
				body_bytes: body.len() as u64,
				message: err.to_string(),
			},
		};

		self.record(&tenant, meta, &decision, now_unix);
		decision
	}

	/// Policy evaluation in spec order: body size, samples rate, structural
	/// caps. The bucket lock is held across the whole evaluation so that two
	/// requests for one tenant observe a consistent bucket; tokens are
	/// withdrawn only once the decision value exists.
	fn evaluate(&self, tenant: &Tenant, limits: &TenantLimits, parsed: ParsedWrite) -> Decision {
		let samples = parsed.request.sample_count();
		let series_count = parsed.request.series_count();
		let body_bytes = parsed.body_bytes;

		if limits.max_body_bytes > 0 && body_bytes > limits.max_body_bytes {
			return Decision::deny(
				Reason::BodyTooLarge,
				body_bytes,
				limits.max_body_bytes,
				samples,
				body_bytes,
			);
		}

		let caps = Caps::from(limits);
		let structural = analyze_structure(&parsed, &caps);

		let rate = limits.samples_per_second;
		let capacity = limits.burst_capacity();
		let unlimited = rate == 0.0;

		let mut bucket = tenant.bucket.lock();
		bucket.refill(rate, capacity, Instant::now());
		let over_rate = !unlimited && !bucket.has(samples);

		let decision = if !over_rate && structural.is_none() {
			Decision::Allow {
				samples,
				body_bytes,
			}
		} else if !self.cfg.selective_filter {
			// Filtering off: the first failing check in evaluation order
			// supplies the denial reason.
			if over_rate {
				Decision::deny(
					Reason::RateLimited,
					samples,
					bucket.available() as u64,
					samples,
					body_bytes,
				)
			} else {
				let s = structural.expect("structural failure present");
				Decision::deny(s.reason, s.observed, s.limit, samples, body_bytes)
			}
		} else {
			let budget = over_rate.then(|| bucket.available().floor() as u64);
			let projection = filter::project(parsed.request, &caps, budget);
			if projection.request.series.is_empty() {
				// Nothing survived the budget; an empty write is a denial,
				// not a filter.
				Decision::deny(
					Reason::RateLimited,
					samples,
					budget.unwrap_or_default(),
					samples,
					body_bytes,
				)
			} else if projection.changed() {
				Decision::Filter {
					projection,
					samples_before: samples,
					body_bytes,
				}
			} else {
				Decision::Allow {
					samples,
					body_bytes,
				}
			}
		};

		if !unlimited {
			match &decision {
				Decision::Allow { samples, .. } => bucket.withdraw(*samples),
				Decision::Filter { projection, .. } => {
					bucket.withdraw(projection.request.sample_count())
				},
				Decision::Deny { .. } => {},
			}
		}
		let tokens = bucket.available();
		drop(bucket);
		self.metrics.set_bucket_tokens(&tenant.id, tokens);

		debug!(
			tenant = tenant.id.as_ref(),
			samples,
			series = series_count,
			tokens,
			decision = ?decision.reason(),
			"write evaluated"
		);
		decision
	}

	fn record(&self, tenant: &Tenant, meta: RequestMeta<'_>, decision: &Decision, now_unix: u64) {
		let tick = match decision {
			Decision::Allow {
				samples,
				body_bytes,
			} => Tick::allow(*body_bytes, *samples),
			Decision::Deny {
				reason,
				samples,
				body_bytes,
				..
			} => Tick::deny(*reason, *body_bytes, *samples),
			Decision::Filter {
				projection,
				body_bytes,
				..
			} => Tick::filter(
				*body_bytes,
				projection.request.sample_count(),
				projection.samples_dropped,
			),
		};
		tenant.counters.record(now_unix, tick);

		if let Decision::Deny {
			reason,
			observed,
			limit,
			..
		} = decision
		{
			self.denials.push(DenialRecord {
				timestamp: Utc::now(),
				tenant: tenant.id.to_string(),
				reason: *reason,
				observed: *observed,
				limit: *limit,
				route: meta.route.to_string(),
				request_id: meta.request_id.to_string(),
			});
		}

		self.metrics.observe(&tenant.id, decision);
		self.pipeline.decision_made();
	}
}

struct StructuralFailure {
	reason: Reason,
	observed: u64,
	limit: u64,
}

/// First structural violation in evaluation order, if any.
fn analyze_structure(parsed: &ParsedWrite, caps: &Caps) -> Option<StructuralFailure> {
	for series in &parsed.request.series {
		if series.labels.len() as u64 > u64::from(caps.max_labels_per_series) {
			return Some(StructuralFailure {
				reason: Reason::LabelsLimit,
				observed: series.labels.len() as u64,
				limit: u64::from(caps.max_labels_per_series),
			});
		}
	}
	for series in &parsed.request.series {
		if let Some(label) = series
			.labels
			.iter()
			.find(|l| l.value.len() as u64 > u64::from(caps.max_label_value_length))
		{
			return Some(StructuralFailure {
				reason: Reason::LabelValueLength,
				observed: label.value.len() as u64,
				limit: u64::from(caps.max_label_value_length),
			});
		}
	}
	if parsed.request.series_count() > u64::from(caps.max_series_per_request) {
		return Some(StructuralFailure {
			reason: Reason::SeriesLimit,
			observed: parsed.request.series_count(),
			limit: u64::from(caps.max_series_per_request),
		});
	}
	if caps.max_global_series_per_metric > 0 {
		let mut groups: std::collections::HashMap<&str, u64> = std::collections::HashMap::new();
		for series in &parsed.request.series {
			let name = series
				.labels
				.iter()
				.find(|l| l.name == METRIC_NAME_LABEL)
				.map(|l| l.value.as_str())
				.unwrap_or_default();
			let count = groups.entry(name).or_default();
			*count += 1;
			if *count > u64::from(caps.max_global_series_per_metric) {
				return Some(StructuralFailure {
					reason: Reason::SeriesLimit,
					observed: *count,
					limit: u64::from(caps.max_global_series_per_metric),
				});
			}
		}
	}
	None
}
