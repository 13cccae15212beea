//! Public entry points of the synchronization engine.

use std::{fmt, sync::Arc};

use tokio::{sync::Mutex, task::JoinSet};

use crate::{
	credentials::CredentialStore,
	dispatch::{self, BatchOptions, BatchResult, Operation, OperationResult, ProgressFn},
	entity::{OrganizationId, Provider},
	error::{SyncError, SyncResult},
	orchestrator::SyncOrchestrator,
	provider::ProviderConnector,
	run::{SyncRun, SyncStatus},
};

/// Triggers background sync runs and dispatches bulk operations
pub struct SyncEngine {
	/// Runs sync phases
	orchestrator: Arc<SyncOrchestrator>,
	/// Provider credentials, for bulk dispatch
	credentials: Arc<dyn CredentialStore>,
	/// Builds provider clients, for bulk dispatch
	connector: Arc<dyn ProviderConnector>,
	/// Rate limits of bulk dispatches
	batch_options: BatchOptions,
	/// Skip provider writes
	dry_run: bool,
	/// Runs executing in the background
	running: Mutex<JoinSet<()>>,
}

impl fmt::Debug for SyncEngine {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("SyncEngine")
			.field("orchestrator", &self.orchestrator)
			.field("batch_options", &self.batch_options)
			.field("dry_run", &self.dry_run)
			.finish_non_exhaustive()
	}
}

impl SyncEngine {
	/// Create an engine
	pub fn new(
		orchestrator: Arc<SyncOrchestrator>,
		credentials: Arc<dyn CredentialStore>,
		connector: Arc<dyn ProviderConnector>,
		batch_options: BatchOptions,
	) -> Self {
		Self {
			orchestrator,
			credentials,
			connector,
			batch_options,
			dry_run: false,
			running: Mutex::new(JoinSet::new()),
		}
	}

	/// Log bulk operations instead of sending them
	#[must_use]
	pub fn with_dry_run(mut self, dry_run: bool) -> Self {
		self.dry_run = dry_run;
		self
	}

	/// The orchestrator running sync phases
	#[must_use]
	pub fn orchestrator(&self) -> &Arc<SyncOrchestrator> {
		&self.orchestrator
	}

	/// Start a sync run in the background.
	///
	/// Returns the new run in the `Syncing` state right away. While a run
	/// is active for the same organization and provider, no second run is
	/// started and the active one is returned instead.
	pub async fn trigger_sync(&self, organization_id: &OrganizationId, provider: Provider) -> SyncRun {
		let run = match self.orchestrator.begin(organization_id, provider).await {
			Ok(run) => run,
			Err(active) => {
				tracing::info!(%organization_id, %provider, run_id = %active.id, "Sync already running, ignoring trigger");
				return active;
			}
		};

		let orchestrator = self.orchestrator.clone();
		let started = run.clone();
		let mut running = self.running.lock().await;
		// reap finished runs so the set does not grow forever
		while running.try_join_next().is_some() {}
		running.spawn(async move {
			orchestrator.execute(run).await;
		});
		started
	}

	/// The latest run of an organization and provider, if any
	pub async fn get_sync_status(
		&self,
		organization_id: &OrganizationId,
		provider: Provider,
	) -> Option<SyncRun> {
		self.orchestrator.ledger().latest(organization_id, provider).await
	}

	/// Lifecycle state of an organization and provider
	pub async fn sync_state(&self, organization_id: &OrganizationId, provider: Provider) -> SyncStatus {
		self.orchestrator.ledger().status(organization_id, provider).await
	}

	/// Retained runs of an organization and provider, newest first
	pub async fn sync_history(
		&self,
		organization_id: &OrganizationId,
		provider: Provider,
	) -> Vec<SyncRun> {
		self.orchestrator.ledger().history(organization_id, provider).await
	}

	/// Push a list of mutations to a provider in rate-limited batches.
	///
	/// Fails as a whole only when no provider client can be built; single
	/// operation failures are reported in the result.
	pub async fn dispatch_bulk_operation(
		&self,
		organization_id: &OrganizationId,
		provider: Provider,
		operations: Vec<Operation>,
		progress: Option<&ProgressFn>,
	) -> SyncResult<BatchResult> {
		let credential = self.credentials.load(organization_id, provider).await?.ok_or_else(|| {
			SyncError::Credential(format!(
				"{provider} is not connected for organization {organization_id}"
			))
		})?;
		let client = self.connector.connect(provider, credential)?;

		let estimate = dispatch::estimate_duration(operations.len(), &self.batch_options);
		tracing::info!(
			%organization_id,
			%provider,
			operations = operations.len(),
			batches = estimate.batch_count,
			estimated_seconds = estimate.estimated_seconds,
			"Dispatching bulk operation"
		);

		if self.dry_run {
			for operation in &operations {
				tracing::warn!(id = %operation.id, "Not executing `{}` during a dry run", operation.mutation);
			}
			let results = operations
				.iter()
				.map(|operation| OperationResult {
					id: operation.id.clone(),
					success: true,
					error: None,
					status_code: None,
				})
				.collect();
			return Ok(BatchResult::from_results(results));
		}

		Ok(dispatch::dispatch(client.as_ref(), &operations, &self.batch_options, progress).await)
	}

	/// Wait until every background run has finished
	pub async fn wait_idle(&self) {
		loop {
			// triggers must not wait on the lock while runs are drained
			let mut running = std::mem::take(&mut *self.running.lock().await);
			if running.is_empty() {
				return;
			}
			while let Some(result) = running.join_next().await {
				if let Err(error) = result {
					tracing::error!("Sync task failed: {}", error);
				}
			}
		}
	}
}
