use std::io::Write;
use std::sync::Arc;

use tonic::{Request, Response, Status};
use tracing::{debug, warn};

use crate::config::Config;
use crate::limiter::{Decision, Limiter, RequestMeta};
use crate::parse::Encoding;
use crate::reason::Reason;

#[allow(warnings)]
#[allow(clippy::derive_partial_eq_without_eq)]
pub mod proto {
	tonic::include_proto!("envoy.service.auth.v3");
}

use proto::authorization_server::Authorization;
pub use proto::authorization_server::AuthorizationServer;
use proto::check_response::HttpResponse;
use proto::{
	CheckRequest, CheckResponse, DeniedHttpResponse, HeaderValue, HeaderValueOption, HttpStatus,
	OkHttpResponse,
};

// google.rpc canonical codes used in CheckResponse.status.
const RPC_OK: i32 = 0;
const RPC_INVALID_ARGUMENT: i32 = 3;
const RPC_PERMISSION_DENIED: i32 = 7;
const RPC_RESOURCE_EXHAUSTED: i32 = 8;
const RPC_INTERNAL: i32 = 13;

/// The per-request authorization endpoint: the proxy calls `Check` with the
/// write's metadata and body; the response either passes the write through
/// (possibly rewritten by the selective filter) or carries a ready-to-send
/// denial.
pub struct ExtAuthzService {
	limiter: Arc<Limiter>,
	cfg: Arc<Config>,
}

impl ExtAuthzService {
	pub fn new(limiter: Arc<Limiter>, cfg: Arc<Config>) -> Self {
		ExtAuthzService { limiter, cfg }
	}

	fn transient_failure(&self, reason: Reason) -> CheckResponse {
		if self.cfg.failure_mode_allows() {
			warn!(%reason, "enforcement failed, failure mode admits the write");
			allow_response(None, vec![])
		} else {
			deny_response(reason, 0, 0, format!("{reason}: enforcement unavailable"))
		}
	}
}

#[tonic::async_trait]
impl Authorization for ExtAuthzService {
	async fn check(
		&self,
		request: Request<CheckRequest>,
	) -> Result<Response<CheckResponse>, Status> {
		let http = request
			.into_inner()
			.attributes
			.and_then(|a| a.request)
			.and_then(|r| r.http)
			.unwrap_or_default();

		// Envoy lower-cases header keys; be lenient about it anyway.
		let header = |name: &str| {
			http
				.headers
				.iter()
				.find(|(k, _)| k.eq_ignore_ascii_case(name))
				.map(|(_, v)| v.clone())
		};
		let tenant = header(&self.cfg.tenant_header).unwrap_or_else(|| "unknown".to_string());
		let request_id = header("x-request-id").unwrap_or_else(|| http.id.clone());
		let encoding = match Encoding::from_content_encoding(header("content-encoding").as_deref())
		{
			Ok(e) => e,
			Err(err) => {
				return Ok(Response::new(deny_response(
					Reason::ParseError,
					0,
					0,
					err.to_string(),
				)));
			},
		};
		let body = if http.raw_body.is_empty() {
			http.body.clone().into_bytes()
		} else {
			http.raw_body.clone()
		};
		// Metadata-only proxy configurations omit the body entirely; there
		// is nothing to parse or meter, the quota endpoint covers that mode.
		if body.is_empty() {
			debug!(tenant, "no body attached, passing through");
			return Ok(Response::new(allow_response(None, vec![])));
		}
		let route = http.path.clone();

		let limiter = self.limiter.clone();
		let check = tokio::task::spawn_blocking(move || {
			limiter.check(
				RequestMeta {
					tenant_id: &tenant,
					route: &route,
					request_id: &request_id,
				},
				&body,
				encoding,
			)
		});

		let decision = match tokio::time::timeout(self.cfg.check_timeout, check).await {
			Ok(Ok(decision)) => decision,
			Ok(Err(join_err)) => {
				warn!(error = %join_err, "authorization check panicked");
				return Ok(Response::new(self.transient_failure(Reason::InternalError)));
			},
			Err(_) => {
				warn!(
					timeout_ms = self.cfg.check_timeout.as_millis() as u64,
					"authorization check exceeded its deadline"
				);
				return Ok(Response::new(self.transient_failure(
					Reason::DeadlineExceeded,
				)));
			},
		};

		Ok(Response::new(decision_response(decision, encoding)))
	}
}

fn decision_response(decision: Decision, encoding: Encoding) -> CheckResponse {
	match decision {
		Decision::Allow { .. } => allow_response(None, vec![]),
		Decision::Deny {
			reason,
			observed,
			limit,
			message,
			..
		} => deny_response(reason, observed, limit, message),
		Decision::Filter { projection, .. } => {
			let filtered_header = format!(
				"{},{}",
				projection.series_dropped(),
				projection.samples_dropped
			);
			let body = recompress(&projection.request.encode_proto(), encoding);
			allow_response(
				Some(body),
				vec![
					request_header("x-rls-decision", "filtered"),
					response_header("x-rls-filtered", &filtered_header),
				],
			)
		},
	}
}

enum HeaderTarget {
	Upstream(HeaderValueOption),
	Downstream(HeaderValueOption),
}

fn request_header(key: &str, value: &str) -> HeaderTarget {
	HeaderTarget::Upstream(header_option(key, value))
}

fn response_header(key: &str, value: &str) -> HeaderTarget {
	HeaderTarget::Downstream(header_option(key, value))
}

fn header_option(key: &str, value: &str) -> HeaderValueOption {
	HeaderValueOption {
		header: Some(HeaderValue {
			key: key.to_string(),
			value: value.to_string(),
			raw_value: vec![],
		}),
	}
}

fn allow_response(rewritten_body: Option<Vec<u8>>, headers: Vec<HeaderTarget>) -> CheckResponse {
	let mut ok = OkHttpResponse {
		headers: vec![],
		headers_to_remove: vec![],
		response_headers_to_add: vec![],
		rewritten_body: rewritten_body.unwrap_or_default(),
	};
	for h in headers {
		match h {
			HeaderTarget::Upstream(h) => ok.headers.push(h),
			HeaderTarget::Downstream(h) => ok.response_headers_to_add.push(h),
		}
	}
	CheckResponse {
		status: Some(proto::Status {
			code: RPC_OK,
			message: String::new(),
		}),
		http_response: Some(HttpResponse::OkResponse(ok)),
	}
}

fn deny_response(reason: Reason, observed: u64, limit: u64, message: String) -> CheckResponse {
	let rpc_code = match reason {
		Reason::ParseError => RPC_INVALID_ARGUMENT,
		Reason::BodyTooLarge
		| Reason::RateLimited
		| Reason::SeriesLimit
		| Reason::LabelsLimit
		| Reason::LabelValueLength => RPC_RESOURCE_EXHAUSTED,
		Reason::PolicyViolation => RPC_PERMISSION_DENIED,
		Reason::DeadlineExceeded | Reason::InternalError => RPC_INTERNAL,
	};
	let body = serde_json::json!({
		"reason": reason.as_str(),
		"message": message.clone(),
		"observed": observed,
		"limit": limit,
	});
	CheckResponse {
		status: Some(proto::Status {
			code: rpc_code,
			message,
		}),
		http_response: Some(HttpResponse::DeniedResponse(DeniedHttpResponse {
			status: Some(HttpStatus {
				code: i32::from(reason.http_status()),
			}),
			headers: vec![header_option("content-type", "application/json")],
			body: body.to_string(),
		})),
	}
}

/// Re-encodes the projected body with the same encoding the client used, so
/// the proxy can swap bodies without touching content-encoding.
fn recompress(raw: &[u8], encoding: Encoding) -> Vec<u8> {
	match encoding {
		Encoding::Identity => raw.to_vec(),
		Encoding::Snappy => snap::raw::Encoder::new()
			.compress_vec(raw)
			.unwrap_or_else(|_| raw.to_vec()),
		Encoding::Gzip => {
			let mut enc =
				flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
			if enc.write_all(raw).is_err() {
				return raw.to_vec();
			}
			enc.finish().unwrap_or_else(|_| raw.to_vec())
		},
	}
}

#[cfg(test)]
mod tests {
	use std::collections::HashMap;

	use prometheus_client::registry::Registry;

	use super::*;
	use crate::metrics::Metrics;
	use crate::pipeline::PipelineStatus;
	use crate::tenant::{DenialLog, TenantLimits, TenantStore};
	use crate::types::{WriteRequest, series};

	fn service(cfg: Config) -> (ExtAuthzService, Arc<TenantStore>) {
		let store = Arc::new(TenantStore::new(8));
		let mut registry = Registry::default();
		let cfg = Arc::new(cfg);
		let limiter = Arc::new(Limiter::new(
			store.clone(),
			Arc::new(DenialLog::default()),
			Arc::new(Metrics::new(&mut registry)),
			Arc::new(PipelineStatus::default()),
			cfg.clone(),
		));
		(ExtAuthzService::new(limiter, cfg), store)
	}

	fn check_request(tenant: Option<&str>, body: Vec<u8>) -> CheckRequest {
		let mut headers = HashMap::new();
		headers.insert("content-encoding".to_string(), "snappy".to_string());
		if let Some(t) = tenant {
			headers.insert("x-scope-orgid".to_string(), t.to_string());
		}
		CheckRequest {
			attributes: Some(proto::AttributeContext {
				request: Some(proto::attribute_context::Request {
					http: Some(proto::attribute_context::HttpRequest {
						id: "req-123".to_string(),
						method: "POST".to_string(),
						headers,
						path: "/api/v1/push".to_string(),
						raw_body: body,
						..Default::default()
					}),
				}),
				context_extensions: HashMap::new(),
			}),
		}
	}

	fn snappy_body(req: &WriteRequest) -> Vec<u8> {
		snap::raw::Encoder::new()
			.compress_vec(&req.encode_proto())
			.unwrap()
	}

	fn small_request() -> WriteRequest {
		WriteRequest {
			series: (0..4)
				.map(|i| series("up", &[("i", &i.to_string())], 5))
				.collect(),
		}
	}

	#[tokio::test]
	async fn allows_within_limits() {
		let (svc, store) = service(Config::for_tests());
		store.upsert(
			"acme",
			TenantLimits {
				samples_per_second: 1000.0,
				..TenantLimits::default()
			},
		);
		let resp = svc
			.check(Request::new(check_request(
				Some("acme"),
				snappy_body(&small_request()),
			)))
			.await
			.unwrap()
			.into_inner();
		assert_eq!(resp.status.unwrap().code, RPC_OK);
		assert!(matches!(
			resp.http_response,
			Some(HttpResponse::OkResponse(_))
		));
	}

	#[tokio::test]
	async fn denies_over_body_limit_with_413() {
		let (svc, store) = service(Config::for_tests());
		store.upsert(
			"acme",
			TenantLimits {
				max_body_bytes: 64,
				..TenantLimits::default()
			},
		);
		let resp = svc
			.check(Request::new(check_request(
				Some("acme"),
				snappy_body(&small_request()),
			)))
			.await
			.unwrap()
			.into_inner();
		let Some(HttpResponse::DeniedResponse(denied)) = resp.http_response else {
			panic!("expected denial");
		};
		assert_eq!(denied.status.unwrap().code, 413);
		let body: serde_json::Value = serde_json::from_str(&denied.body).unwrap();
		assert_eq!(body["reason"], "body_too_large");
		assert_eq!(body["limit"], 64);
	}

	#[tokio::test]
	async fn filtered_write_carries_markers_and_rewritten_body() {
		let (svc, store) = service(Config::for_tests());
		let tenant = store.upsert(
			"acme",
			TenantLimits {
				samples_per_second: 100.0,
				burst_percent: 0.2,
				..TenantLimits::default()
			},
		);
		tenant.bucket.lock().withdraw(110);

		let req = WriteRequest {
			series: (0..4)
				.map(|i| series("m", &[("i", &i.to_string())], 5))
				.collect(),
		};
		let resp = svc
			.check(Request::new(check_request(Some("acme"), snappy_body(&req))))
			.await
			.unwrap()
			.into_inner();
		let Some(HttpResponse::OkResponse(ok)) = resp.http_response else {
			panic!("expected ok response");
		};
		assert!(!ok.rewritten_body.is_empty());
		let decision_header = ok.headers.iter().find_map(|h| {
			let h = h.header.as_ref()?;
			(h.key == "x-rls-decision").then(|| h.value.clone())
		});
		assert_eq!(decision_header.as_deref(), Some("filtered"));
		let filtered_header = ok.response_headers_to_add.iter().find_map(|h| {
			let h = h.header.as_ref()?;
			(h.key == "x-rls-filtered").then(|| h.value.clone())
		});
		// 10 tokens were left: 20 samples in, 10 dropped, no whole series.
		assert_eq!(filtered_header.as_deref(), Some("0,10"));

		// The rewritten body decodes to the projected request.
		let raw = snap::raw::Decoder::new()
			.decompress_vec(&ok.rewritten_body)
			.unwrap();
		let projected =
			crate::parse::parse_write_request(&raw, Encoding::Identity, u64::MAX).unwrap();
		assert_eq!(projected.request.sample_count(), 10);
	}

	#[tokio::test]
	async fn missing_tenant_header_is_treated_as_unknown() {
		let (svc, store) = service(Config::for_tests());
		let resp = svc
			.check(Request::new(check_request(
				None,
				snappy_body(&small_request()),
			)))
			.await
			.unwrap()
			.into_inner();
		assert_eq!(resp.status.unwrap().code, RPC_OK);
		assert!(store.get("unknown").is_some());
	}

	#[tokio::test]
	async fn metadata_only_check_passes_through() {
		let (svc, _) = service(Config::for_tests());
		let resp = svc
			.check(Request::new(check_request(Some("acme"), vec![])))
			.await
			.unwrap()
			.into_inner();
		assert_eq!(resp.status.unwrap().code, RPC_OK);
	}

	#[tokio::test]
	async fn unsupported_encoding_is_a_parse_denial() {
		let (svc, _) = service(Config::for_tests());
		let mut req = check_request(Some("acme"), vec![1, 2, 3]);
		if let Some(http) = req
			.attributes
			.as_mut()
			.and_then(|a| a.request.as_mut())
			.and_then(|r| r.http.as_mut())
		{
			http
				.headers
				.insert("content-encoding".to_string(), "zstd".to_string());
		}
		let resp = svc.check(Request::new(req)).await.unwrap().into_inner();
		let Some(HttpResponse::DeniedResponse(denied)) = resp.http_response else {
			panic!("expected denial");
		};
		assert_eq!(denied.status.unwrap().code, 400);
	}
}
