//! Service keeping external directories in sync with the local store
use std::{path::Path, process::ExitCode, str::FromStr};

use anyhow::{Context, Result};
use directory_sync::Config;
use tracing::level_filters::LevelFilter;

#[tokio::main]
async fn main() -> ExitCode {
	match run_service().await {
		Ok(_) => ExitCode::SUCCESS,
		Err(e) => {
			tracing::error!("{:?}", e);
			ExitCode::FAILURE
		}
	}
}

/// Load the configuration, set up logging and hand over to the service
#[allow(clippy::print_stderr)]
async fn run_service() -> Result<()> {
	let config = {
		let config_path = std::env::var("DIRECTORY_SYNC_CONFIG").unwrap_or("config.yaml".into());
		let config_path = Path::new(&config_path);
		match Config::new(config_path) {
			Ok(config) => config,
			Err(error) => {
				// Tracing subscriber is not yet configured, so we
				// need to manually log this
				eprintln!("Failed to load config file from {:?}: {}", config_path, error);
				anyhow::bail!(error);
			}
		}
	};

	let subscriber = tracing_subscriber::FmtSubscriber::builder()
		.with_max_level(
			config
				.log_level
				.as_ref()
				.map_or(Ok(LevelFilter::INFO), |s| LevelFilter::from_str(s))?,
		)
		.finish();
	tracing::subscriber::set_global_default(subscriber)
		.context("Setting default tracing subscriber failed")?;

	tracing::info!(
		version = env!("CARGO_PKG_VERSION"),
		build_date = env!("VERGEN_BUILD_DATE"),
		"Starting directory sync"
	);
	directory_sync::run(config).await
}
