use std::pin::Pin;
use std::time::Duration;

use rls_core::readiness::Ready;
use tokio_stream::{Stream, StreamExt, wrappers::IntervalStream};
use tonic::{Request, Response, Status};

#[allow(warnings)]
pub mod proto {
	tonic::include_proto!("grpc.health.v1");
}

use proto::health_check_response::ServingStatus;
use proto::health_server::Health;
pub use proto::health_server::HealthServer;
use proto::{HealthCheckRequest, HealthCheckResponse};

/// grpc.health.v1 for the authorization ports: serving once startup tasks
/// (initial overrides sync included) have completed.
pub struct HealthService {
	ready: Ready,
}

impl HealthService {
	pub fn new(ready: Ready) -> Self {
		HealthService { ready }
	}

	fn status(&self) -> ServingStatus {
		if self.ready.is_ready() {
			ServingStatus::Serving
		} else {
			ServingStatus::NotServing
		}
	}
}

#[tonic::async_trait]
impl Health for HealthService {
	async fn check(
		&self,
		_request: Request<HealthCheckRequest>,
	) -> Result<Response<HealthCheckResponse>, Status> {
		Ok(Response::new(HealthCheckResponse {
			status: self.status() as i32,
		}))
	}

	type WatchStream =
		Pin<Box<dyn Stream<Item = Result<HealthCheckResponse, Status>> + Send + 'static>>;

	async fn watch(
		&self,
		_request: Request<HealthCheckRequest>,
	) -> Result<Response<Self::WatchStream>, Status> {
		let ready = self.ready.clone();
		let interval = tokio::time::interval(Duration::from_secs(5));
		let stream = IntervalStream::new(interval).map(move |_| {
			let status = if ready.is_ready() {
				ServingStatus::Serving
			} else {
				ServingStatus::NotServing
			};
			Ok(HealthCheckResponse {
				status: status as i32,
			})
		});
		Ok(Response::new(Box::pin(stream)))
	}
}
