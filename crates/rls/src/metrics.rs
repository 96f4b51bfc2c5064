use std::sync::atomic::AtomicU64;

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue, LabelValueEncoder};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

use crate::limiter::Decision;
use crate::reason::Reason;

#[derive(Clone, Hash, Debug, PartialEq, Eq, EncodeLabelSet)]
pub struct TenantLabels {
	pub tenant: String,
}

#[derive(Clone, Hash, Debug, PartialEq, Eq, EncodeLabelSet)]
pub struct DecisionLabels {
	pub tenant: String,
	pub decision: DecisionKind,
}

#[derive(Clone, Hash, Debug, PartialEq, Eq)]
pub enum DecisionKind {
	Allow,
	Deny,
	Filter,
}

impl EncodeLabelValue for DecisionKind {
	fn encode(&self, encoder: &mut LabelValueEncoder) -> Result<(), std::fmt::Error> {
		use std::fmt::Write;
		encoder.write_str(match self {
			DecisionKind::Allow => "allow",
			DecisionKind::Deny => "deny",
			DecisionKind::Filter => "filter",
		})
	}
}

#[derive(Clone, Hash, Debug, PartialEq, Eq, EncodeLabelSet)]
pub struct ReasonLabels {
	pub tenant: String,
	pub reason: String,
}

/// The stable enforcement metric families. Names are part of the external
/// interface; counters gain the `_total` suffix at encode time.
#[derive(Debug)]
pub struct Metrics {
	pub requests: Family<DecisionLabels, Counter>,
	pub samples_ingested: Family<TenantLabels, Counter>,
	pub samples_denied: Family<ReasonLabels, Counter>,
	pub bucket_tokens: Family<TenantLabels, Gauge<f64, AtomicU64>>,
	pub filter_dropped_series: Family<ReasonLabels, Counter>,
}

impl Metrics {
	pub fn new(registry: &mut Registry) -> Self {
		let requests = Family::default();
		registry.register(
			"rls_requests",
			"Authorization decisions by tenant and outcome",
			requests.clone(),
		);
		let samples_ingested = Family::default();
		registry.register(
			"rls_samples_ingested",
			"Samples admitted towards the distributor",
			samples_ingested.clone(),
		);
		let samples_denied = Family::default();
		registry.register(
			"rls_samples_denied",
			"Samples rejected or trimmed, by reason",
			samples_denied.clone(),
		);
		let bucket_tokens = Family::default();
		registry.register(
			"rls_bucket_tokens",
			"Tokens remaining in the tenant sample bucket",
			bucket_tokens.clone(),
		);
		let filter_dropped_series = Family::default();
		registry.register(
			"rls_filter_dropped_series",
			"Series removed by the selective filter, by reason",
			filter_dropped_series.clone(),
		);
		Metrics {
			requests,
			samples_ingested,
			samples_denied,
			bucket_tokens,
			filter_dropped_series,
		}
	}

	pub fn observe(&self, tenant: &str, decision: &Decision) {
		let kind = match decision {
			Decision::Allow { .. } => DecisionKind::Allow,
			Decision::Deny { .. } => DecisionKind::Deny,
			Decision::Filter { .. } => DecisionKind::Filter,
		};
		self
			.requests
			.get_or_create(&DecisionLabels {
				tenant: tenant.to_string(),
				decision: kind,
			})
			.inc();

		match decision {
			Decision::Allow { samples, .. } => {
				self
					.samples_ingested
					.get_or_create(&TenantLabels {
						tenant: tenant.to_string(),
					})
					.inc_by(*samples);
			},
			Decision::Deny {
				reason, samples, ..
			} => {
				self
					.samples_denied
					.get_or_create(&ReasonLabels {
						tenant: tenant.to_string(),
						reason: reason.as_str().to_string(),
					})
					.inc_by(*samples);
			},
			Decision::Filter { projection, .. } => {
				self
					.samples_ingested
					.get_or_create(&TenantLabels {
						tenant: tenant.to_string(),
					})
					.inc_by(projection.request.sample_count());
				self
					.samples_denied
					.get_or_create(&ReasonLabels {
						tenant: tenant.to_string(),
						reason: Reason::RateLimited.as_str().to_string(),
					})
					.inc_by(projection.samples_dropped);
				for (count, reason) in [
					(projection.series_dropped_series_limit, Reason::SeriesLimit),
					(projection.series_dropped_metric_limit, Reason::SeriesLimit),
					(projection.series_dropped_rate_limit, Reason::RateLimited),
				] {
					if count > 0 {
						self
							.filter_dropped_series
							.get_or_create(&ReasonLabels {
								tenant: tenant.to_string(),
								reason: reason.as_str().to_string(),
							})
							.inc_by(count);
					}
				}
			},
		}
	}

	pub fn set_bucket_tokens(&self, tenant: &str, tokens: f64) {
		self
			.bucket_tokens
			.get_or_create(&TenantLabels {
				tenant: tenant.to_string(),
			})
			.set(tokens);
	}
}
