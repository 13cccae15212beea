//! Synchronization engine mirroring external identity directories
//! (Google Workspace, Microsoft Graph) into a local entity store, and
//! pushing bulk administrative changes back to them.
use std::sync::Arc;

use anyhow::{bail, Context, Result};

pub mod config;
pub mod credentials;
pub mod dispatch;
pub mod engine;
pub mod entity;
pub mod error;
pub mod hash;
pub mod orchestrator;
pub mod provider;
pub mod reconcile;
pub mod run;
pub mod scheduler;
pub mod store;
pub mod test_helpers;

pub use config::{Config, FeatureFlag};
use credentials::{CredentialStore, MemoryCredentialStore, PlaintextCipher};
pub use engine::SyncEngine;
pub use error::{ProviderError, SyncError, SyncResult};
use orchestrator::SyncOrchestrator;
use provider::{HttpConnector, RetryPolicy};
use run::{RunLedger, SyncStatus};
pub use scheduler::Scheduler;
use store::{EntityStore, MemoryStore};

/// Assemble an engine talking to the real provider APIs.
///
/// Connections listed in the configuration are stored as credentials.
pub async fn build_engine(config: &Config) -> Result<Arc<SyncEngine>> {
	let store: Arc<dyn EntityStore> = match &config.store.snapshot_path {
		Some(path) => Arc::new(
			MemoryStore::open(path)
				.await
				.with_context(|| format!("Failed to open store snapshot {}", path.display()))?,
		),
		None => Arc::new(MemoryStore::new()),
	};

	let credentials = Arc::new(
		MemoryCredentialStore::new(Arc::new(PlaintextCipher))
			.with_max_auth_failures(config.retry.max_auth_failures),
	);
	for organization in &config.organizations {
		for connection in &organization.connections {
			credentials
				.store(&organization.id, connection.provider, connection.credential())
				.await
				.with_context(|| {
					format!("Failed to store {} credential of {}", connection.provider, organization.id)
				})?;
		}
	}

	let connector =
		Arc::new(HttpConnector::new(config.providers.clone(), RetryPolicy::from(&config.retry)));
	let dry_run = config.feature_flags.is_enabled(FeatureFlag::DryRun);
	if dry_run {
		tracing::warn!("Dry run enabled, nothing will be written");
	}

	let orchestrator = Arc::new(
		SyncOrchestrator::new(
			store,
			credentials.clone(),
			connector.clone(),
			Arc::new(RunLedger::new()),
		)
		.with_dry_run(dry_run),
	);
	Ok(Arc::new(
		SyncEngine::new(orchestrator, credentials, connector, (&config.batch).into())
			.with_dry_run(dry_run),
	))
}

/// Run the service as configured: either sync every connection once, or
/// keep syncing on a schedule until interrupted
pub async fn run(config: Config) -> Result<()> {
	let engine = build_engine(&config).await?;
	if config.scheduler.enabled {
		serve(engine, &config).await
	} else {
		sync_once(&engine, &config).await
	}
}

/// Sync every configured connection once, sequentially
async fn sync_once(engine: &SyncEngine, config: &Config) -> Result<()> {
	let mut failed = 0;
	for organization in &config.organizations {
		for provider in organization.providers() {
			let run = engine.orchestrator().run_once(&organization.id, provider).await;
			if run.status == SyncStatus::Failed {
				failed += 1;
			}
		}
	}
	if failed > 0 {
		bail!("{failed} sync runs failed");
	}
	tracing::info!("Finished syncing all organizations");
	Ok(())
}

/// Schedule every configured organization until ctrl-c
async fn serve(engine: Arc<SyncEngine>, config: &Config) -> Result<()> {
	let scheduler =
		Scheduler::new(engine, config.scheduler.interval(), config.scheduler.run_on_start);
	for organization in &config.organizations {
		scheduler.add_organization(organization.id.clone(), organization.providers()).await;
	}

	tokio::signal::ctrl_c().await.context("Failed to listen for shutdown signal")?;
	tracing::info!("Shutting down, waiting for running syncs");
	scheduler.stop_all().await;
	Ok(())
}
