use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// The key inside the ConfigMap that carries the overrides document.
pub const DOCUMENT_KEY: &str = "overrides.yaml";

/// One tenant's limits as pushed to the admin API. Fields the document does
/// not set stay `None` and are preserved server-side.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LimitsPatch {
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

#[derive(Debug, Error)]
pub enum DocumentError {
	#[error("document is not valid YAML: {0}")]
	Yaml(#[from] serde_yaml::Error),
	#[error("document root must be a mapping with an `overrides` key")]
	NotAMapping,
}

/// A field the parser had to skip; the rest of the tenant still applies.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldError {
	pub tenant: String,
	pub key: String,
	pub value: String,
	pub error: String,
}

#[derive(Debug, Default)]
pub struct ParsedDocument {
	pub tenants: BTreeMap<String, LimitsPatch>,
	pub field_errors: Vec<FieldError>,
}

/// Parses an `overrides.yaml` document:
///
/// ```yaml
/// overrides:
///   tenant-a:
///     ingestion_rate: 4e6
/// ```
///
/// Values may be strings, integers, or reals (scientific notation
/// included); upstream alias keys are accepted. Unknown keys warn and are
/// skipped; a value that does not fit its field produces a per-field error
/// and leaves the tenant's other fields intact. Only malformed YAML fails
/// the whole document.
pub fn parse(contents: &str) -> Result<ParsedDocument, DocumentError> {
	let root: serde_yaml::Value = serde_yaml::from_str(contents)?;
	if root.is_null() {
		return Ok(ParsedDocument::default());
	}
	let Some(mapping) = root.as_mapping() else {
		return Err(DocumentError::NotAMapping);
	};
	let overrides = mapping
		.iter()
		.find(|(key, _)| key.as_str() == Some("overrides"))
		.map(|(_, value)| value);
	let overrides = match overrides {
		Some(v) if v.is_null() => return Ok(ParsedDocument::default()),
		Some(v) => v.as_mapping().ok_or(DocumentError::NotAMapping)?,
		None => {
			warn!("document has no `overrides` key, treating as empty");
			return Ok(ParsedDocument::default());
		},
	};

	let mut out = ParsedDocument::default();
	for (tenant, fields) in overrides {
		let Some(tenant) = tenant.as_str() else {
			warn!(?tenant, "skipping non-string tenant id");
			continue;
		};
		let Some(fields) = fields.as_mapping() else {
			warn!(tenant, "skipping tenant whose overrides are not a mapping");
			out.tenants.insert(tenant.to_string(), LimitsPatch::default());
			continue;
		};
		let mut patch = LimitsPatch::default();
		for (key, value) in fields {
			let Some(key) = key.as_str() else { continue };
			let raw = normalize(value);
			let Some(raw) = raw else {
				out.field_errors.push(FieldError {
					tenant: tenant.to_string(),
					key: key.to_string(),
					value: format!("{value:?}"),
					error: "value must be a string or number".to_string(),
				});
				continue;
			};
			if let Err(error) = apply_field(&mut patch, key, &raw) {
				match error {
					FieldParse::UnknownKey => {
						warn!(tenant, key, "unknown override key, skipping");
					},
					FieldParse::Invalid(error) => {
						out.field_errors.push(FieldError {
							tenant: tenant.to_string(),
							key: key.to_string(),
							value: raw,
							error,
						});
					},
				}
			}
		}
		out.tenants.insert(tenant.to_string(), patch);
	}
	Ok(out)
}

/// Heterogeneous document values are normalized to a string and routed to
/// the typed parser for the canonical key.
fn normalize(value: &serde_yaml::Value) -> Option<String> {
	match value {
		serde_yaml::Value::String(s) => Some(s.trim().to_string()),
		serde_yaml::Value::Number(n) => Some(n.to_string()),
		_ => None,
	}
}

enum FieldParse {
	UnknownKey,
	Invalid(String),
}

fn apply_field(patch: &mut LimitsPatch, key: &str, raw: &str) -> Result<(), FieldParse> {
	match key {
		"samples_per_second" | "ingestion_rate" | "samples_per_sec" | "sps" => {
			patch.samples_per_second = Some(parse_rate(raw)?);
		},
		"burst_percent" | "burst_pct" | "burst_percentage" | "ingestion_burst_size" => {
			patch.burst_percent = Some(parse_rate(raw)?);
		},
		"max_body_bytes" | "max_request_size" | "max_request_body_size" | "request_rate_limit" => {
			patch.max_body_bytes = Some(parse_int::<u64>(raw)?);
		},
		"max_labels_per_series" | "max_labels_per_metric" | "labels_limit" => {
			patch.max_labels_per_series = Some(parse_int::<u32>(raw)?);
		},
		"max_label_value_length" | "max_label_name_length" | "label_length_limit" => {
			patch.max_label_value_length = Some(parse_int::<u32>(raw)?);
		},
		"max_series_per_request" | "max_series_per_metric" | "max_series_per_query"
		| "series_limit" => {
			patch.max_series_per_request = Some(parse_int::<u32>(raw)?);
		},
		"max_global_series_per_user" => {
			patch.max_global_series_per_user = Some(parse_int::<u32>(raw)?);
		},
		"max_global_series_per_metric" => {
			patch.max_global_series_per_metric = Some(parse_int::<u32>(raw)?);
		},
		_ => return Err(FieldParse::UnknownKey),
	}
	Ok(())
}

fn parse_rate(raw: &str) -> Result<f64, FieldParse> {
	let v: f64 = raw
		.parse()
		.map_err(|e| FieldParse::Invalid(format!("not a number: {e}")))?;
	if !v.is_finite() || v < 0.0 {
		return Err(FieldParse::Invalid(format!(
			"must be a finite non-negative number, got {raw}"
		)));
	}
	Ok(v)
}

/// Integer fields accept plain integers and scientific notation
/// (`4e6`, `1.5E+07`). Overflow of the target range is an error for that
/// field only.
fn parse_int<T>(raw: &str) -> Result<T, FieldParse>
where
	T: TryFrom<u64>,
{
	// Plain decimal integers keep full precision.
	let wide: u64 = if let Ok(v) = raw.parse::<u64>() {
		v
	} else {
		let v: f64 = raw
			.parse()
			.map_err(|e| FieldParse::Invalid(format!("not a number: {e}")))?;
		if !v.is_finite() || v < 0.0 {
			return Err(FieldParse::Invalid(format!(
				"must be a finite non-negative number, got {raw}"
			)));
		}
		if v.fract() != 0.0 {
			return Err(FieldParse::Invalid(format!(
				"must be an integer, got {raw}"
			)));
		}
		if v > u64::MAX as f64 {
			return Err(FieldParse::Invalid(format!("{raw} overflows the field")));
		}
		v as u64
	};
	T::try_from(wide).map_err(|_| FieldParse::Invalid(format!("{raw} overflows the field")))
}
