//! A full sync run of one organization against one provider.
//!
//! Phases run strictly in order: users, groups, memberships, licenses.
//! Each entity phase classifies every fetched entity by content hash,
//! writes only the changed ones and then reconciles removals. A failing
//! phase fails the run; earlier phases stay committed and are redone
//! idempotently by the next run.

use std::{collections::HashSet, fmt, sync::Arc};

use chrono::Utc;

use crate::{
	credentials::CredentialStore,
	entity::{EntityKey, EntityKind, FetchedEntity, OrganizationId, Provider},
	error::{SyncError, SyncResult},
	hash::{classify, ChangeAction},
	provider::{DirectoryProvider, ProviderConnector},
	reconcile::Reconciler,
	run::{RunLedger, SyncRun, SyncStats},
	store::EntityStore,
};

/// Counters of one entity phase
#[derive(Debug, Default)]
struct PhaseOutcome {
	/// Entities seen for the first time
	created: usize,
	/// Entities whose content changed
	updated: usize,
	/// Entities removed because they disappeared upstream
	removed: usize,
	/// IDs in the provider listing
	observed: Vec<String>,
}

/// Runs sync phases and records their outcome in the run ledger
pub struct SyncOrchestrator {
	/// Local entity store
	store: Arc<dyn EntityStore>,
	/// Provider credentials
	credentials: Arc<dyn CredentialStore>,
	/// Builds provider clients
	connector: Arc<dyn ProviderConnector>,
	/// Removal of vanished entities
	reconciler: Reconciler,
	/// Run history and single-flight guard
	ledger: Arc<RunLedger>,
	/// Only log what would change
	dry_run: bool,
}

impl fmt::Debug for SyncOrchestrator {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("SyncOrchestrator").field("dry_run", &self.dry_run).finish_non_exhaustive()
	}
}

impl SyncOrchestrator {
	/// Create an orchestrator
	pub fn new(
		store: Arc<dyn EntityStore>,
		credentials: Arc<dyn CredentialStore>,
		connector: Arc<dyn ProviderConnector>,
		ledger: Arc<RunLedger>,
	) -> Self {
		Self {
			reconciler: Reconciler::new(store.clone()),
			store,
			credentials,
			connector,
			ledger,
			dry_run: false,
		}
	}

	/// Read from providers without writing anything
	#[must_use]
	pub fn with_dry_run(mut self, dry_run: bool) -> Self {
		self.dry_run = dry_run;
		self
	}

	/// The run ledger
	#[must_use]
	pub fn ledger(&self) -> &Arc<RunLedger> {
		&self.ledger
	}

	/// Register a new run, or return the active one as `Err`
	pub async fn begin(
		&self,
		organization_id: &OrganizationId,
		provider: Provider,
	) -> Result<SyncRun, SyncRun> {
		self.ledger.begin(organization_id, provider).await
	}

	/// Start and execute a run in the calling task. When a run is already
	/// active, that run is returned without starting another one.
	pub async fn run_once(&self, organization_id: &OrganizationId, provider: Provider) -> SyncRun {
		match self.begin(organization_id, provider).await {
			Ok(run) => self.execute(run).await,
			Err(active) => {
				tracing::info!(%organization_id, %provider, run_id = %active.id, "Sync already running");
				active
			}
		}
	}

	/// Execute a run returned by [`SyncOrchestrator::begin`] and record
	/// its outcome. Never fails; failures end up in the returned run.
	pub async fn execute(&self, run: SyncRun) -> SyncRun {
		let organization_id = &run.organization_id;
		let provider = run.provider;
		tracing::info!(%organization_id, %provider, run_id = %run.id, dry_run = self.dry_run, "Starting sync");

		let mut stats = SyncStats::default();
		let mut authenticated = false;
		let result = self.sync(organization_id, provider, &mut stats, &mut authenticated).await;

		if let Err(error) = self.store.flush().await {
			tracing::error!(%organization_id, %provider, "Failed to persist store: {}", error);
		}

		match result {
			Ok(()) => {
				if let Err(error) = self.credentials.mark_validated(organization_id, provider).await {
					tracing::warn!(%organization_id, %provider, "Failed to mark credential valid: {}", error);
				}
				let finished = self.ledger.complete(&run, stats).await;
				tracing::info!(%organization_id, %provider, run_id = %run.id, stats = ?finished.stats, "Sync completed");
				finished
			}
			Err(error) => {
				if authenticated && error.is_credential_error() {
					self.record_auth_failure(organization_id, provider, &error).await;
				}
				tracing::error!(%organization_id, %provider, run_id = %run.id, "Sync failed: {}", error);
				self.ledger.fail(&run, stats, error.to_string()).await
			}
		}
	}

	/// Count a rejected credential, which may invalidate it
	async fn record_auth_failure(
		&self,
		organization_id: &OrganizationId,
		provider: Provider,
		error: &SyncError,
	) {
		match self.credentials.record_auth_failure(organization_id, provider, &error.to_string()).await
		{
			Ok(true) => tracing::warn!(
				%organization_id,
				%provider,
				"Credential invalidated after repeated auth failures, reconnect required"
			),
			Ok(false) => {}
			Err(error) => {
				tracing::warn!(%organization_id, %provider, "Failed to record auth failure: {}", error);
			}
		}
	}

	/// All phases of a run. `authenticated` is set once a provider client
	/// was built from a stored credential.
	async fn sync(
		&self,
		organization_id: &OrganizationId,
		provider: Provider,
		stats: &mut SyncStats,
		authenticated: &mut bool,
	) -> SyncResult<()> {
		let credential = self.credentials.load(organization_id, provider).await?.ok_or_else(|| {
			SyncError::Credential(format!(
				"{provider} is not connected for organization {organization_id}"
			))
		})?;
		let client = self.connector.connect(provider, credential)?;
		*authenticated = true;

		let users = client.list_users().await?;
		let outcome = self.sync_kind(organization_id, provider, EntityKind::User, users).await?;
		stats.users_created = outcome.created;
		stats.users_updated = outcome.updated;
		stats.users_removed = outcome.removed;

		let groups = client.list_groups().await?;
		let outcome = self.sync_kind(organization_id, provider, EntityKind::Group, groups).await?;
		stats.groups_created = outcome.created;
		stats.groups_updated = outcome.updated;
		stats.groups_removed = outcome.removed;

		stats.memberships_synced =
			self.sync_memberships(client.as_ref(), organization_id, &outcome.observed).await?;

		let licenses = client.list_license_skus().await?;
		let outcome =
			self.sync_kind(organization_id, provider, EntityKind::License, licenses).await?;
		stats.licenses_synced = outcome.created + outcome.updated;
		stats.licenses_removed = outcome.removed;

		Ok(())
	}

	/// Write changed entities of one kind, then remove vanished ones
	async fn sync_kind(
		&self,
		organization_id: &OrganizationId,
		provider: Provider,
		kind: EntityKind,
		entities: Vec<FetchedEntity>,
	) -> SyncResult<PhaseOutcome> {
		let existing = self.store.hashes(organization_id, provider, kind).await?;
		let mut outcome = PhaseOutcome::default();
		let mut observed = HashSet::with_capacity(entities.len());
		let mut unchanged = HashSet::new();

		for entity in entities {
			if entity.canonical.kind() != kind {
				tracing::warn!(%provider, %kind, id = %entity.provider_entity_id, "Skipping entity of unexpected kind");
				continue;
			}
			if !observed.insert(entity.provider_entity_id.clone()) {
				tracing::debug!(%provider, %kind, id = %entity.provider_entity_id, "Skipping duplicate entity");
				continue;
			}
			outcome.observed.push(entity.provider_entity_id.clone());

			let classification = classify(
				existing.get(&entity.provider_entity_id).map(String::as_str),
				&entity.canonical,
			);
			match classification.action {
				ChangeAction::Unchanged => {
					unchanged.insert(entity.provider_entity_id);
					continue;
				}
				ChangeAction::Created => outcome.created += 1,
				ChangeAction::Updated => outcome.updated += 1,
			}

			if self.dry_run {
				tracing::info!(%provider, %kind, id = %entity.provider_entity_id, action = ?classification.action, "Would write entity");
				continue;
			}
			let key = EntityKey::new(organization_id, provider, kind, entity.provider_entity_id);
			self.store
				.upsert(key, entity.canonical, entity.raw.to_string(), classification.hash)
				.await?;
		}

		if self.dry_run {
			let vanished = existing.keys().filter(|id| !observed.contains(*id)).count();
			tracing::info!(%organization_id, %provider, %kind, vanished, "Would remove vanished entities");
			return Ok(outcome);
		}

		if !unchanged.is_empty() {
			self.store.mark_synced(organization_id, provider, kind, &unchanged, Utc::now()).await?;
		}
		outcome.removed = self.reconciler.reconcile(organization_id, provider, kind, &observed).await?;

		tracing::info!(
			%organization_id,
			%provider,
			%kind,
			created = outcome.created,
			updated = outcome.updated,
			unchanged = unchanged.len(),
			removed = outcome.removed,
			"Synced entities"
		);
		Ok(outcome)
	}

	/// Replace the stored memberships of every listed group
	async fn sync_memberships(
		&self,
		client: &dyn DirectoryProvider,
		organization_id: &OrganizationId,
		group_ids: &[String],
	) -> SyncResult<usize> {
		let provider = client.provider();
		let mut synced = 0;
		for group_id in group_ids {
			let members = client.list_group_members(group_id).await?;
			if self.dry_run {
				tracing::debug!(%provider, group_id, members = members.len(), "Would replace memberships");
				continue;
			}
			synced +=
				self.store.replace_memberships(organization_id, provider, group_id, &members).await?;
		}
		tracing::info!(%organization_id, %provider, groups = group_ids.len(), memberships = synced, "Synced memberships");
		Ok(synced)
	}
}
