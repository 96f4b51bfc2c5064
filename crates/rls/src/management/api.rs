use std::sync::{Arc, Mutex};
use std::time::Instant;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use prometheus_client::registry::Registry;
use rls_core::readiness::Ready;
use rls_core::version::BuildInfo;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::Config;
use crate::pipeline::{PipelineStatus, unix_now};
use crate::tenant::{
	DeleteOutcome, DenialLog, LimitsUpdate, Lookup, Tenant, TenantLimits, TenantStore,
	WindowCounters,
};

#[derive(Clone)]
pub struct AdminState {
	pub store: Arc<TenantStore>,
	pub denials: Arc<DenialLog>,
	pub pipeline: Arc<PipelineStatus>,
	pub registry: Arc<Mutex<Registry>>,
	pub ready: Ready,
	pub cfg: Arc<Config>,
}

pub fn router(state: AdminState) -> Router {
	Router::new()
		.route("/healthz", get(|| async { "OK" }))
		.route("/readyz", get(handle_ready))
		.route("/api/tenants", get(list_tenants))
		.route("/api/tenants/{id}", get(get_tenant).delete(delete_tenant))
		.route("/api/tenants/{id}/limits", axum::routing::put(put_limits))
		.route("/api/overview", get(overview))
		.route("/api/denials", get(denials))
		.route("/api/export/csv", get(export_csv))
		.route("/api/pipeline/status", get(pipeline_status))
		.route("/metrics", get(scrape_metrics))
		.route("/logging", axum::routing::post(change_logging))
		.with_state(state)
}

#[derive(Debug, thiserror::Error)]
enum ApiError {
	#[error("unknown tenant {0}")]
	UnknownTenant(String),
	#[error("{0}")]
	BadRequest(String),
	#[error("{0}")]
	Internal(String),
}

impl IntoResponse for ApiError {
	fn into_response(self) -> Response {
		let status = match &self {
			ApiError::UnknownTenant(_) => StatusCode::NOT_FOUND,
			ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
			ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
		};
		let body = serde_json::json!({ "error": self.to_string() });
		(status, Json(body)).into_response()
	}
}

async fn handle_ready(State(state): State<AdminState>) -> Response {
	if state.ready.is_ready() {
		(StatusCode::OK, "READY").into_response()
	} else {
		let pending = state.ready.pending();
		(
			StatusCode::SERVICE_UNAVAILABLE,
			format!("awaiting: {pending:?}"),
		)
			.into_response()
	}
}

#[derive(Debug, Deserialize)]
struct RangeQuery {
	range: Option<String>,
}

fn range_minutes(range: Option<&str>) -> Result<u64, ApiError> {
	match range.unwrap_or("1h") {
		"15m" => Ok(15),
		"1h" => Ok(60),
		"24h" => Ok(24 * 60),
		"1w" => Ok(7 * 24 * 60),
		other => Err(ApiError::BadRequest(format!(
			"range must be one of 15m|1h|24h|1w, got {other:?}"
		))),
	}
}

#[derive(Debug, Serialize)]
struct TenantSummary {
	id: String,
	limits: TenantLimits,
	last_minute: WindowCounters,
	last_seen: Option<DateTime<Utc>>,
}

fn summarize(tenant: &Tenant, now_unix: u64) -> TenantSummary {
	TenantSummary {
		id: tenant.id.to_string(),
		limits: (*tenant.limits()).clone(),
		last_minute: tenant.counters.query(now_unix, 1),
		last_seen: tenant
			.last_seen()
			.and_then(|secs| DateTime::from_timestamp(secs as i64, 0)),
	}
}

async fn list_tenants(State(state): State<AdminState>) -> Json<Vec<TenantSummary>> {
	let now_unix = unix_now();
	Json(
		state
			.store
			.list()
			.iter()
			.map(|t| summarize(t, now_unix))
			.collect(),
	)
}

#[derive(Debug, Serialize)]
struct TenantDetail {
	id: String,
	limits: TenantLimits,
	bucket_tokens: f64,
	counters: WindowCounters,
	last_seen: Option<DateTime<Utc>>,
}

async fn get_tenant(
	State(state): State<AdminState>,
	Path(id): Path<String>,
	Query(query): Query<RangeQuery>,
) -> Result<Json<TenantDetail>, ApiError> {
	let minutes = range_minutes(query.range.as_deref())?;
	let tenant = match state.store.lookup(&id) {
		Lookup::Exact(t) | Lookup::CaseInsensitive(t) => t,
		Lookup::Missing => return Err(ApiError::UnknownTenant(id)),
	};
	Ok(Json(TenantDetail {
		id: tenant.id.to_string(),
		limits: (*tenant.limits()).clone(),
		bucket_tokens: tenant.observe_tokens(Instant::now()),
		counters: tenant.counters.query(unix_now(), minutes),
		last_seen: tenant
			.last_seen()
			.and_then(|secs| DateTime::from_timestamp(secs as i64, 0)),
	}))
}

#[derive(Debug, Serialize)]
struct LimitsReply {
	tenant: String,
	limits: TenantLimits,
	timestamp: DateTime<Utc>,
}

async fn put_limits(
	State(state): State<AdminState>,
	Path(id): Path<String>,
	payload: Result<Json<LimitsUpdate>, axum::extract::rejection::JsonRejection>,
) -> Result<Json<LimitsReply>, ApiError> {
	let Json(update) = payload.map_err(|e| ApiError::BadRequest(e.to_string()))?;

	let current = match state.store.get(&id) {
		Some(t) => (*t.limits()).clone(),
		None => TenantLimits::default(),
	};
	let next = update.apply_to(&current);
	state.store.upsert(&id, next.clone());
	state.pipeline.limits_pushed();
	info!(tenant = id, "limits replaced");
	Ok(Json(LimitsReply {
		tenant: id,
		limits: next,
		timestamp: Utc::now(),
	}))
}

#[derive(Debug, Serialize)]
struct DeleteReply {
	tenant: String,
	deleted: bool,
	/// Set when the tenant saw traffic inside the protection window and was
	/// kept despite the delete.
	retained: bool,
}

async fn delete_tenant(
	State(state): State<AdminState>,
	Path(id): Path<String>,
) -> Result<Json<DeleteReply>, ApiError> {
	let cutoff = unix_now().saturating_sub(state.cfg.tenant_idle_grace.as_secs());
	match state.store.delete_if_idle(&id, cutoff) {
		DeleteOutcome::Deleted => Ok(Json(DeleteReply {
			tenant: id,
			deleted: true,
			retained: false,
		})),
		DeleteOutcome::Retained => Ok(Json(DeleteReply {
			tenant: id,
			deleted: false,
			retained: true,
		})),
		DeleteOutcome::NotFound => Err(ApiError::UnknownTenant(id)),
	}
}

#[derive(Debug, Serialize)]
struct Overview {
	tenants: usize,
	window: WindowCounters,
	top: Vec<TopTenant>,
}

#[derive(Debug, Serialize)]
struct TopTenant {
	id: String,
	requests: u64,
	denied: u64,
}

#[derive(Debug, Deserialize)]
struct OverviewQuery {
	range: Option<String>,
	#[serde(default = "default_top")]
	top: usize,
}

fn default_top() -> usize {
	10
}

async fn overview(
	State(state): State<AdminState>,
	Query(query): Query<OverviewQuery>,
) -> Result<Json<Overview>, ApiError> {
	let minutes = range_minutes(query.range.as_deref())?;
	let now_unix = unix_now();
	let mut window = WindowCounters::default();
	let mut top: Vec<TopTenant> = Vec::new();
	for tenant in state.store.list() {
		let counters = tenant.counters.query(now_unix, minutes);
		window.requests += counters.requests;
		window.allowed += counters.allowed;
		window.denied += counters.denied;
		window.filtered += counters.filtered;
		window.bytes += counters.bytes;
		window.samples_ingested += counters.samples_ingested;
		window.samples_denied += counters.samples_denied;
		for (sum, v) in window.denial_reasons.iter_mut().zip(&counters.denial_reasons) {
			*sum += v;
		}
		top.push(TopTenant {
			id: tenant.id.to_string(),
			requests: counters.requests,
			denied: counters.denied,
		});
	}
	top.sort_by(|a, b| b.requests.cmp(&a.requests).then(a.id.cmp(&b.id)));
	top.truncate(query.top);
	Ok(Json(Overview {
		tenants: state.store.len(),
		window,
		top,
	}))
}

#[derive(Debug, Deserialize)]
struct DenialsQuery {
	since: Option<DateTime<Utc>>,
	tenant: Option<String>,
	#[serde(default = "default_denials_limit")]
	limit: usize,
}

fn default_denials_limit() -> usize {
	500
}

async fn denials(
	State(state): State<AdminState>,
	Query(query): Query<DenialsQuery>,
) -> Json<serde_json::Value> {
	let records = state
		.denials
		.query(query.since, query.tenant.as_deref(), query.limit);
	Json(serde_json::json!({ "denials": records }))
}

async fn export_csv(State(state): State<AdminState>) -> Response {
	let records = state.denials.query(None, None, usize::MAX);
	let mut csv = String::from("timestamp,tenant,reason,observed,limit,route,request_id\n");
	for r in records {
		csv.push_str(&format!(
			"{},{},{},{},{},{},{}\n",
			r.timestamp.to_rfc3339(),
			r.tenant,
			r.reason,
			r.observed,
			r.limit,
			r.route,
			r.request_id
		));
	}
	(
		StatusCode::OK,
		[(axum::http::header::CONTENT_TYPE, "text/csv; charset=utf-8")],
		csv,
	)
		.into_response()
}

async fn pipeline_status(State(state): State<AdminState>) -> Json<serde_json::Value> {
	Json(serde_json::json!({
		"pipeline": state.pipeline.snapshot(),
		"version": BuildInfo::new(),
		"tenants": state.store.len(),
		"denials_buffered": state.denials.len(),
	}))
}

#[derive(Debug, Deserialize)]
struct LoggingQuery {
	level: String,
}

async fn change_logging(Query(query): Query<LoggingQuery>) -> Result<String, ApiError> {
	rls_core::telemetry::set_level(&query.level)
		.map_err(|e| ApiError::BadRequest(format!("invalid level {:?}: {e}", query.level)))?;
	Ok(format!("log level set to {}\n", query.level))
}

async fn scrape_metrics(State(state): State<AdminState>) -> Result<Response, ApiError> {
	let mut buf = String::new();
	{
		let registry = state
			.registry
			.lock()
			.map_err(|_| ApiError::Internal("metrics registry poisoned".to_string()))?;
		prometheus_client::encoding::text::encode(&mut buf, &registry)
			.map_err(|e| ApiError::Internal(e.to_string()))?;
	}
	Ok(
		(
			StatusCode::OK,
			[(
				axum::http::header::CONTENT_TYPE,
				"application/openmetrics-text; version=1.0.0; charset=utf-8",
			)],
			buf,
		)
			.into_response(),
	)
}
