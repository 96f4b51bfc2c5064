use serde::{Deserialize, Serialize};

/// Per-tenant enforcement limits. Immutable once constructed; the store
/// swaps the whole value atomically so a decision never observes a mix of
/// old and new fields.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TenantLimits {
	/// Samples admitted per second. Zero means unlimited.
	pub samples_per_second: f64,
	/// Burst headroom as a fraction of the rate; bucket capacity is
	/// `samples_per_second * (1 + burst_percent)`, floored at one token.
	#[serde(rename = "burst_pct")]
	pub burst_percent: f64,
	/// Post-decompression body bound in bytes. Zero means unlimited.
	pub max_body_bytes: u64,
	pub max_labels_per_series: u32,
	pub max_label_value_length: u32,
	pub max_series_per_request: u32,
	/// Zero means unlimited.
	#[serde(skip_serializing_if = "is_zero_u32")]
	#[serde(default)]
	pub max_global_series_per_user: u32,
	/// Zero means unlimited.
	#[serde(skip_serializing_if = "is_zero_u32")]
	#[serde(default)]
	pub max_global_series_per_metric: u32,
}

fn is_zero_u32(v: &u32) -> bool {
	*v == 0
}

impl Default for TenantLimits {
	fn default() -> Self {
		// The unknown-tenant default: unlimited rate and body, generous
		// structural caps. Real limits arrive with the first overrides push.
		TenantLimits {
			samples_per_second: 0.0,
			burst_percent: 0.0,
			max_body_bytes: 0,
			max_labels_per_series: 64,
			max_label_value_length: 2048,
			max_series_per_request: 100_000,
			max_global_series_per_user: 0,
			max_global_series_per_metric: 0,
		}
	}
}

impl TenantLimits {
	/// Token bucket capacity for this limit set.
	pub fn burst_capacity(&self) -> f64 {
		(self.samples_per_second * (1.0 + self.burst_percent)).max(1.0)
	}
}

/// Partial update as accepted by `PUT /api/tenants/{id}/limits`: omitted
/// fields preserve the tenant's current values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LimitsUpdate {
	#[serde(skip_serializing_if = "Option::is_none")]
	pub samples_per_second: Option<f64>,
	#[serde(rename = "burst_pct", skip_serializing_if = "Option::is_none")]
	pub burst_percent: Option<f64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub max_body_bytes: Option<u64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub max_labels_per_series: Option<u32>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub max_label_value_length: Option<u32>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub max_series_per_request: Option<u32>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub max_global_series_per_user: Option<u32>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub max_global_series_per_metric: Option<u32>,
}

impl LimitsUpdate {
	pub fn is_empty(&self) -> bool {
		*self == LimitsUpdate::default()
	}

	/// Applies this update on top of `current`, returning the resulting
	/// limit set.
	pub fn apply_to(&self, current: &TenantLimits) -> TenantLimits {
		TenantLimits {
			samples_per_second: self
				.samples_per_second
				.unwrap_or(current.samples_per_second),
			burst_percent: self.burst_percent.unwrap_or(current.burst_percent),
			max_body_bytes: self.max_body_bytes.unwrap_or(current.max_body_bytes),
			max_labels_per_series: self
				.max_labels_per_series
				.unwrap_or(current.max_labels_per_series),
			max_label_value_length: self
				.max_label_value_length
				.unwrap_or(current.max_label_value_length),
			max_series_per_request: self
				.max_series_per_request
				.unwrap_or(current.max_series_per_request),
			max_global_series_per_user: self
				.max_global_series_per_user
				.unwrap_or(current.max_global_series_per_user),
			max_global_series_per_metric: self
				.max_global_series_per_metric
				.unwrap_or(current.max_global_series_per_metric),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn burst_capacity_floors_at_one() {
		let mut limits = TenantLimits::default();
		assert_eq!(limits.burst_capacity(), 1.0);
		limits.samples_per_second = 1000.0;
		limits.burst_percent = 0.2;
		assert!((limits.burst_capacity() - 1200.0).abs() < f64::EPSILON);
	}

	#[test]
	fn update_preserves_omitted_fields() {
		let current = TenantLimits {
			samples_per_second: 100.0,
			max_body_bytes: 4096,
			..TenantLimits::default()
		};
		let update = LimitsUpdate {
			samples_per_second: Some(250.0),
			..LimitsUpdate::default()
		};
		let next = update.apply_to(&current);
		assert_eq!(next.samples_per_second, 250.0);
		assert_eq!(next.max_body_bytes, 4096);
		assert_eq!(next.max_labels_per_series, current.max_labels_per_series);
	}

	#[test]
	fn update_json_uses_wire_names() {
		let update: LimitsUpdate =
			serde_json::from_str(r#"{"samples_per_second": 1000, "burst_pct": 0.5}"#).unwrap();
		assert_eq!(update.samples_per_second, Some(1000.0));
		assert_eq!(update.burst_percent, Some(0.5));
	}
}
