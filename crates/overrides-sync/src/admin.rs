use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::document::LimitsPatch;

/// The enforcement service's view of a tenant's limits, as returned by
/// `GET /api/tenants`. Field names follow the admin wire contract.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Limits {
	#[serde(default)]
	pub samples_per_second: f64,
	#[serde(rename = "burst_pct", default)]
	pub burst_percent: f64,
	#[serde(default)]
	pub max_body_bytes: u64,
	#[serde(default)]
	pub max_labels_per_series: u32,
	#[serde(default)]
	pub max_label_value_length: u32,
	#[serde(default)]
	pub max_series_per_request: u32,
	#[serde(default)]
	pub max_global_series_per_user: u32,
	#[serde(default)]
	pub max_global_series_per_metric: u32,
}

impl Limits {
	/// The limits that would result from pushing `patch` on top of `self`
	/// (the admin PUT preserves omitted fields).
	pub fn with_patch(&self, patch: &LimitsPatch) -> Limits {
		Limits {
			samples_per_second: patch.samples_per_second.unwrap_or(self.samples_per_second),
			burst_percent: patch.burst_percent.unwrap_or(self.burst_percent),
			max_body_bytes: patch.max_body_bytes.unwrap_or(self.max_body_bytes),
			max_labels_per_series: patch
				.max_labels_per_series
				.unwrap_or(self.max_labels_per_series),
			max_label_value_length: patch
				.max_label_value_length
				.unwrap_or(self.max_label_value_length),
			max_series_per_request: patch
				.max_series_per_request
				.unwrap_or(self.max_series_per_request),
			max_global_series_per_user: patch
				.max_global_series_per_user
				.unwrap_or(self.max_global_series_per_user),
			max_global_series_per_metric: patch
				.max_global_series_per_metric
				.unwrap_or(self.max_global_series_per_metric),
		}
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct TenantEntry {
	pub id: String,
	pub limits: Limits,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeleteReply {
	pub deleted: bool,
	#[serde(default)]
	pub retained: bool,
}

/// HTTP client for the enforcement service's admin API, with bounded
/// per-call retries.
pub struct AdminClient {
	http: reqwest::Client,
	base: String,
	attempts: u32,
	backoff: Duration,
}

impl AdminClient {
	pub fn new(
		base_url: &str,
		timeout: Duration,
		attempts: u32,
		backoff: Duration,
	) -> anyhow::Result<Self> {
		let http = reqwest::Client::builder()
			.timeout(timeout)
			.build()
			.context("build admin http client")?;
		Ok(AdminClient {
			http,
			base: base_url.trim_end_matches('/').to_string(),
			attempts: attempts.max(1),
			backoff,
		})
	}

	pub async fn list_tenants(&self) -> anyhow::Result<Vec<TenantEntry>> {
		let url = format!("{}/api/tenants", self.base);
		let resp = self
			.retrying(|| self.http.get(&url).send())
			.await
			.context("list tenants")?;
		Ok(resp.json().await?)
	}

	pub async fn put_limits(&self, tenant: &str, patch: &LimitsPatch) -> anyhow::Result<()> {
		let url = format!("{}/api/tenants/{tenant}/limits", self.base);
		self
			.retrying(|| self.http.put(&url).json(patch).send())
			.await
			.with_context(|| format!("push limits for {tenant}"))?;
		debug!(tenant, "limits pushed");
		Ok(())
	}

	/// Returns false when the service kept the tenant because it saw recent
	/// traffic. A tenant that is already gone counts as deleted.
	pub async fn delete_tenant(&self, tenant: &str) -> anyhow::Result<bool> {
		let url = format!("{}/api/tenants/{tenant}", self.base);
		for attempt in 1..=self.attempts {
			match self.http.delete(&url).send().await {
				Ok(resp) if resp.status() == reqwest::StatusCode::NOT_FOUND => return Ok(true),
				Ok(resp) if resp.status().is_success() => {
					let reply: DeleteReply = resp.json().await?;
					return Ok(reply.deleted);
				},
				Ok(resp) => {
					warn!(tenant, status = %resp.status(), attempt, "delete rejected");
				},
				Err(e) => {
					warn!(tenant, attempt, "delete failed: {e}");
				},
			}
			if attempt < self.attempts {
				tokio::time::sleep(self.backoff * attempt).await;
			}
		}
		anyhow::bail!("delete of {tenant} failed after {} attempts", self.attempts)
	}

	async fn retrying<F, Fut>(&self, mut call: F) -> anyhow::Result<reqwest::Response>
	where
		F: FnMut() -> Fut,
		Fut: Future<Output = Result<reqwest::Response, reqwest::Error>>,
	{
		let mut last_err: Option<anyhow::Error> = None;
		for attempt in 1..=self.attempts {
			match call().await {
				Ok(resp) if resp.status().is_success() => return Ok(resp),
				Ok(resp) => {
					last_err = Some(anyhow::anyhow!("unexpected status {}", resp.status()));
				},
				Err(e) => {
					last_err = Some(e.into());
				},
			}
			if attempt < self.attempts {
				tokio::time::sleep(self.backoff * attempt).await;
			}
		}
		Err(last_err.unwrap_or_else(|| anyhow::anyhow!("request failed")))
	}
}
