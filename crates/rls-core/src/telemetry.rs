use std::sync::OnceLock;
use std::time::Instant;

use tracing_subscriber::filter::{EnvFilter, LevelFilter};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{Registry, reload};

pub static APPLICATION_START_TIME: OnceLock<Instant> = OnceLock::new();

static LOG_HANDLE: OnceLock<LogHandle> = OnceLock::new();

type LogHandle = reload::Handle<EnvFilter, Registry>;

/// Initializes process-wide logging. The level comes from `LOG_LEVEL` (or
/// `RUST_LOG`), defaulting to `info`. Returns an error if called twice.
pub fn setup_logging() -> anyhow::Result<()> {
	APPLICATION_START_TIME.get_or_init(Instant::now);

	let filter = default_filter();
	let (filter_layer, reload_handle) = reload::Layer::new(filter);
	tracing_subscriber::registry()
		.with(filter_layer)
		.with(
			tracing_subscriber::fmt::layer()
				.with_target(true)
				.with_writer(std::io::stderr),
		)
		.try_init()?;
	LOG_HANDLE
		.set(reload_handle)
		.map_err(|_| anyhow::anyhow!("logging already initialized"))?;
	Ok(())
}

fn default_filter() -> EnvFilter {
	let directives = std::env::var("LOG_LEVEL")
		.or_else(|_| std::env::var("RUST_LOG"))
		.unwrap_or_else(|_| "info".to_string());
	EnvFilter::builder()
		.with_default_directive(LevelFilter::INFO.into())
		.parse_lossy(directives)
}

/// Replaces the active log filter, e.g. `debug` or `rls=trace,info`.
pub fn set_level(directives: &str) -> anyhow::Result<()> {
	let Some(handle) = LOG_HANDLE.get() else {
		anyhow::bail!("logging is not initialized");
	};
	let filter = EnvFilter::builder()
		.with_default_directive(LevelFilter::INFO.into())
		.parse(directives)?;
	handle.reload(filter)?;
	Ok(())
}
