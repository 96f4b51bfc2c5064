use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use prometheus_client::encoding::text::encode;
use prometheus_client::registry::Registry;
use rls_core::drain::DrainWatcher;
use rls_core::prelude::*;
use rls_core::readiness::Ready;

use crate::reconciler::Reconciler;

#[derive(Clone)]
pub struct AppState {
	pub ready: Ready,
	pub registry: Arc<Mutex<Registry>>,
	pub reconciler: Arc<Reconciler>,
}

/// Probe, scrape, and status surface for the sidecar.
pub fn router(state: AppState) -> Router {
	Router::new()
		.route("/healthz", get(|| async { (StatusCode::OK, "OK") }))
		.route("/readyz", get(handle_ready))
		.route("/status", get(handle_status))
		.route("/metrics", get(handle_metrics))
		.with_state(state)
}

async fn handle_status(State(state): State<AppState>) -> impl IntoResponse {
	axum::Json(serde_json::json!({ "last_cycle": state.reconciler.status() }))
}

async fn handle_ready(State(state): State<AppState>) -> impl IntoResponse {
	if state.ready.is_ready() {
		(StatusCode::OK, "READY".to_string())
	} else {
		(
			StatusCode::SERVICE_UNAVAILABLE,
			"NOT READY: awaiting initial sync".to_string(),
		)
	}
}

async fn handle_metrics(State(state): State<AppState>) -> impl IntoResponse {
	let mut buf = String::new();
	let Ok(registry) = state.registry.lock() else {
		return (
			StatusCode::INTERNAL_SERVER_ERROR,
			"registry poisoned".to_string(),
		);
	};
	match encode(&mut buf, &registry) {
		Ok(()) => (StatusCode::OK, buf),
		Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
	}
}

pub async fn serve(
	addr: SocketAddr,
	state: AppState,
	drain: DrainWatcher,
) -> anyhow::Result<()> {
	let listener = tokio::net::TcpListener::bind(addr)
		.await
		.context("bind sidecar listener")?;
	info!(address = %listener.local_addr()?, component = "sidecar-http", "listener established");
	let serve = axum::serve(listener, router(state)).with_graceful_shutdown(async move {
		drop(drain.wait_for_drain().await);
	});
	serve.await.context("sidecar http server")
}

#[cfg(test)]
mod tests {
	use axum::body::Body;
	use axum::http::Request;
	use http_body_util::BodyExt;
	use tower::ServiceExt;

	use super::*;

	use std::time::Duration;

	use crate::admin::AdminClient;
	use crate::metrics::SyncMetrics;

	fn state() -> AppState {
		let mut registry = Registry::default();
		let metrics = Arc::new(SyncMetrics::new(&mut registry));
		let admin = AdminClient::new(
			"http://127.0.0.1:1",
			Duration::from_secs(1),
			1,
			Duration::from_millis(1),
		)
		.unwrap();
		AppState {
			ready: Ready::new(),
			registry: Arc::new(Mutex::new(registry)),
			reconciler: Arc::new(Reconciler::new(admin, metrics, true)),
		}
	}

	#[tokio::test]
	async fn healthz_always_ok() {
		let resp = router(state())
			.oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
			.await
			.unwrap();
		assert_eq!(resp.status(), StatusCode::OK);
	}

	#[tokio::test]
	async fn readyz_gated_on_initial_sync() {
		let s = state();
		let task = s.ready.register_task("initial sync");
		let app = router(s.clone());

		let resp = app
			.clone()
			.oneshot(Request::get("/readyz").body(Body::empty()).unwrap())
			.await
			.unwrap();
		assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

		drop(task);
		let resp = app
			.oneshot(Request::get("/readyz").body(Body::empty()).unwrap())
			.await
			.unwrap();
		assert_eq!(resp.status(), StatusCode::OK);
		let body = resp.into_body().collect().await.unwrap().to_bytes();
		assert_eq!(&body[..], b"READY");
	}

	#[tokio::test]
	async fn metrics_scrape_works() {
		let resp = router(state())
			.oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
			.await
			.unwrap();
		assert_eq!(resp.status(), StatusCode::OK);
	}

	#[tokio::test]
	async fn status_is_null_before_first_cycle() {
		let resp = router(state())
			.oneshot(Request::get("/status").body(Body::empty()).unwrap())
			.await
			.unwrap();
		assert_eq!(resp.status(), StatusCode::OK);
		let bytes = resp.into_body().collect().await.unwrap().to_bytes();
		let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
		assert!(body["last_cycle"].is_null());
	}
}
