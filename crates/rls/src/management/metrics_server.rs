use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::Router;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use prometheus_client::encoding::text::encode;
use prometheus_client::registry::Registry;
use rls_core::drain::DrainWatcher;
use rls_core::prelude::*;

/// Dedicated scrape endpoint, kept off the admin port so a slow dashboard
/// query can never delay a scrape.
pub struct Server {
	listener: tokio::net::TcpListener,
	router: Router,
	drain: DrainWatcher,
}

impl Server {
	pub async fn bind(
		addr: SocketAddr,
		registry: Arc<Mutex<Registry>>,
		drain: DrainWatcher,
	) -> anyhow::Result<Self> {
		let listener = tokio::net::TcpListener::bind(addr)
			.await
			.context("bind stats listener")?;
		let router = Router::new()
			.route("/metrics", get(handle_metrics))
			.route("/stats/prometheus", get(handle_metrics))
			.with_state(registry);
		Ok(Server {
			listener,
			router,
			drain,
		})
	}

	pub fn address(&self) -> SocketAddr {
		self
			.listener
			.local_addr()
			.expect("listener has a local address")
	}

	pub fn spawn(self) {
		let address = self.address();
		info!(%address, component = "stats", "listener established");
		let drain = self.drain;
		tokio::spawn(async move {
			let serve = axum::serve(self.listener, self.router).with_graceful_shutdown(
				async move {
					let release = drain.wait_for_drain().await;
					drop(release);
				},
			);
			if let Err(e) = serve.await {
				warn!(component = "stats", "server error: {e}");
			}
		});
	}
}

async fn handle_metrics(
	State(registry): State<Arc<Mutex<Registry>>>,
	headers: HeaderMap,
) -> Response {
	let mut buf = String::new();
	{
		let Ok(registry) = registry.lock() else {
			return (StatusCode::INTERNAL_SERVER_ERROR, "registry poisoned").into_response();
		};
		if let Err(err) = encode(&mut buf, &registry) {
			return (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response();
		}
	}
	(
		StatusCode::OK,
		[(header::CONTENT_TYPE, content_type(&headers))],
		buf,
	)
		.into_response()
}

// Mirror the scrape content negotiation Prometheus expects: OpenMetrics
// only when the client asks for it.
fn content_type(headers: &HeaderMap) -> &'static str {
	let openmetrics = headers
		.get_all(header::ACCEPT)
		.iter()
		.filter_map(|v| v.to_str().ok())
		.any(|accept| {
			accept
				.split(',')
				.any(|part| part.trim().starts_with("application/openmetrics-text"))
		});
	if openmetrics {
		"application/openmetrics-text;charset=utf-8;version=1.0.0"
	} else {
		"text/plain; charset=utf-8"
	}
}
