use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use rls_core::{telemetry, version};
use tracing::info;

#[derive(Parser, Debug)]
#[command(about = "Edge enforcement for multi-tenant remote-write", long_about = None)]
struct Args {
	/// Read configuration from a YAML file (environment variables win).
	#[arg(short, long, value_name = "file")]
	file: Option<PathBuf>,

	/// Parse the configuration and exit.
	#[arg(long)]
	validate_only: bool,

	/// Print version and exit.
	#[arg(short = 'V', long = "version")]
	version: bool,
}

fn main() -> anyhow::Result<()> {
	let args = Args::parse();
	if args.version {
		println!("{}", version::BuildInfo::new());
		return Ok(());
	}
	telemetry::setup_logging()?;

	let contents = match &args.file {
		Some(path) => Some(std::fs::read_to_string(path)?),
		None => None,
	};
	let config = rls::config::parse_config(contents.as_deref())?;
	if args.validate_only {
		println!("Configuration is valid!");
		return Ok(());
	}

	tokio::runtime::Builder::new_multi_thread()
		.enable_all()
		.build()?
		.block_on(async move {
			info!("version: {}", version::BuildInfo::new());
			rls::app::run(Arc::new(config)).await?.wait_termination().await
		})
}
