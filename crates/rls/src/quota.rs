use std::sync::Arc;
use std::time::Instant;

use tonic::{Request, Response, Status};
use tracing::debug;

use crate::metrics::Metrics;
use crate::pipeline::unix_now;
use crate::tenant::TenantStore;

#[allow(warnings)]
#[allow(clippy::derive_partial_eq_without_eq)]
pub mod proto {
	tonic::include_proto!("envoy.service.ratelimit.v3");
}

use proto::rate_limit_response::rate_limit::Unit;
use proto::rate_limit_response::{Code, DescriptorStatus, RateLimit};
use proto::rate_limit_service_server::RateLimitService;
pub use proto::rate_limit_service_server::RateLimitServiceServer;
use proto::{RateLimitRequest, RateLimitResponse};

/// The descriptor-based quota endpoint: the proxy sends `("tenant", id)`
/// tuples (optionally with a `("route", name)` dimension) and receives a
/// per-descriptor verdict plus remaining-quota hints. Used for cheap
/// metadata-only admission, before the body is ever forwarded.
pub struct QuotaService {
	store: Arc<TenantStore>,
	metrics: Arc<Metrics>,
}

impl QuotaService {
	pub fn new(store: Arc<TenantStore>, metrics: Arc<Metrics>) -> Self {
		QuotaService { store, metrics }
	}
}

#[tonic::async_trait]
impl RateLimitService for QuotaService {
	async fn should_rate_limit(
		&self,
		request: Request<RateLimitRequest>,
	) -> Result<Response<RateLimitResponse>, Status> {
		let request = request.into_inner();
		let default_hits = u64::from(request.hits_addend.max(1));
		let mut statuses = Vec::with_capacity(request.descriptors.len());
		let mut overall = Code::Ok;

		for descriptor in &request.descriptors {
			let tenant_id = descriptor
				.entries
				.iter()
				.find(|e| e.key == "tenant")
				.map(|e| e.value.as_str());
			let route = descriptor
				.entries
				.iter()
				.find(|e| e.key == "route")
				.map(|e| e.value.as_str());
			let hits = descriptor.hits_addend.unwrap_or(default_hits).max(1);

			let status = match tenant_id {
				// A descriptor without a tenant dimension has nothing to
				// meter against; admit it.
				None => DescriptorStatus {
					code: Code::Ok as i32,
					current_limit: None,
					limit_remaining: u32::MAX,
				},
				Some(id) => {
					let tenant = self.store.get_or_create(id);
					tenant.touch(unix_now());
					let limits = tenant.limits();
					if limits.samples_per_second == 0.0 {
						DescriptorStatus {
							code: Code::Ok as i32,
							current_limit: None,
							limit_remaining: u32::MAX,
						}
					} else {
						let capacity = limits.burst_capacity();
						let mut bucket = tenant.bucket.lock();
						bucket.refill(limits.samples_per_second, capacity, Instant::now());
						let code = if bucket.has(hits) {
							bucket.withdraw(hits);
							Code::Ok
						} else {
							Code::OverLimit
						};
						let remaining = bucket.available().floor() as u32;
						drop(bucket);
						self.metrics.set_bucket_tokens(id, f64::from(remaining));

						debug!(
							tenant = id,
							route = route.unwrap_or_default(),
							hits,
							remaining,
							over = code == Code::OverLimit,
							"quota descriptor evaluated"
						);
						if code == Code::OverLimit {
							overall = Code::OverLimit;
						}
						DescriptorStatus {
							code: code as i32,
							current_limit: Some(RateLimit {
								requests_per_unit: limits.samples_per_second as u32,
								unit: Unit::Second as i32,
							}),
							limit_remaining: remaining,
						}
					}
				},
			};
			statuses.push(status);
		}

		Ok(Response::new(RateLimitResponse {
			overall_code: overall as i32,
			statuses,
			response_headers_to_add: vec![],
			request_headers_to_add: vec![],
			raw_body: vec![],
		}))
	}
}

#[cfg(test)]
mod tests {
	use prometheus_client::registry::Registry;

	use super::*;
	use crate::tenant::TenantLimits;

	fn service() -> (QuotaService, Arc<TenantStore>) {
		let store = Arc::new(TenantStore::new(8));
		let mut registry = Registry::default();
		(
			QuotaService::new(store.clone(), Arc::new(Metrics::new(&mut registry))),
			store,
		)
	}

	fn descriptor(tenant: &str, hits: Option<u64>) -> proto::RateLimitDescriptor {
		proto::RateLimitDescriptor {
			entries: vec![proto::rate_limit_descriptor::Entry {
				key: "tenant".to_string(),
				value: tenant.to_string(),
			}],
			hits_addend: hits,
		}
	}

	#[tokio::test]
	async fn admits_until_bucket_is_empty() {
		let (svc, store) = service();
		store.upsert(
			"acme",
			TenantLimits {
				samples_per_second: 10.0,
				..TenantLimits::default()
			},
		);

		let ok = svc
			.should_rate_limit(Request::new(RateLimitRequest {
				domain: "rls".to_string(),
				descriptors: vec![descriptor("acme", Some(10))],
				hits_addend: 0,
			}))
			.await
			.unwrap()
			.into_inner();
		assert_eq!(ok.overall_code, Code::Ok as i32);

		let over = svc
			.should_rate_limit(Request::new(RateLimitRequest {
				domain: "rls".to_string(),
				descriptors: vec![descriptor("acme", Some(10))],
				hits_addend: 0,
			}))
			.await
			.unwrap()
			.into_inner();
		assert_eq!(over.overall_code, Code::OverLimit as i32);
		assert_eq!(over.statuses[0].code, Code::OverLimit as i32);
		assert_eq!(over.statuses[0].limit_remaining, 0);
	}

	#[tokio::test]
	async fn unlimited_tenant_is_always_ok() {
		let (svc, _) = service();
		for _ in 0..5 {
			let resp = svc
				.should_rate_limit(Request::new(RateLimitRequest {
					domain: "rls".to_string(),
					descriptors: vec![descriptor("free", Some(1_000_000))],
					hits_addend: 0,
				}))
				.await
				.unwrap()
				.into_inner();
			assert_eq!(resp.overall_code, Code::Ok as i32);
		}
	}

	#[tokio::test]
	async fn descriptor_without_tenant_is_admitted() {
		let (svc, _) = service();
		let resp = svc
			.should_rate_limit(Request::new(RateLimitRequest {
				domain: "rls".to_string(),
				descriptors: vec![proto::RateLimitDescriptor {
					entries: vec![proto::rate_limit_descriptor::Entry {
						key: "route".to_string(),
						value: "push".to_string(),
					}],
					hits_addend: None,
				}],
				hits_addend: 0,
			}))
			.await
			.unwrap()
			.into_inner();
		assert_eq!(resp.overall_code, Code::Ok as i32);
		assert_eq!(resp.statuses.len(), 1);
	}
}
