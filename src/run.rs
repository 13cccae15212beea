//! Sync run records and the single-flight ledger.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::entity::{OrganizationId, Provider};

/// Finished runs kept per organization and provider
const HISTORY_LIMIT: usize = 50;

/// Lifecycle state of a sync run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
	/// No run was recorded yet
	Idle,
	/// A run is in progress
	Syncing,
	/// The last run finished successfully
	Completed,
	/// The last run failed
	Failed,
}

/// Per-run counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncStats {
	/// Users inserted into the store
	pub users_created: usize,
	/// Users whose content changed
	pub users_updated: usize,
	/// Users deleted because they disappeared upstream
	pub users_removed: usize,
	/// Groups inserted into the store
	pub groups_created: usize,
	/// Groups whose content changed
	pub groups_updated: usize,
	/// Groups deleted because they disappeared upstream
	pub groups_removed: usize,
	/// Membership rows written
	pub memberships_synced: usize,
	/// License SKUs inserted or changed
	pub licenses_synced: usize,
	/// License SKUs deleted because they disappeared upstream
	pub licenses_removed: usize,
}

/// One sync run of an organization against a provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncRun {
	/// Run ID
	pub id: Uuid,
	/// Organization being synced
	pub organization_id: OrganizationId,
	/// Provider being synced
	pub provider: Provider,
	/// Current state
	pub status: SyncStatus,
	/// When the run started
	pub started_at: DateTime<Utc>,
	/// When the run reached a terminal state
	pub finished_at: Option<DateTime<Utc>>,
	/// Failure description of a failed run
	pub error: Option<String>,
	/// Counters, also kept for failed runs up to the failing phase
	pub stats: SyncStats,
}

impl SyncRun {
	/// Whether the run is still in progress
	#[must_use]
	pub fn is_active(&self) -> bool {
		self.status == SyncStatus::Syncing
	}
}

/// Run history with at most one active run per organization and provider
#[derive(Debug, Default)]
pub struct RunLedger {
	/// Runs by scope, oldest first
	runs: Mutex<HashMap<(OrganizationId, Provider), Vec<SyncRun>>>,
}

impl RunLedger {
	/// Create an empty ledger
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	/// Start a run unless one is already active for the scope.
	///
	/// Returns the new run, or the active one as `Err`.
	pub async fn begin(
		&self,
		organization_id: &OrganizationId,
		provider: Provider,
	) -> Result<SyncRun, SyncRun> {
		let mut runs = self.runs.lock().await;
		let history = runs.entry((organization_id.clone(), provider)).or_default();
		if let Some(active) = history.last().filter(|run| run.is_active()) {
			return Err(active.clone());
		}

		let run = SyncRun {
			id: Uuid::new_v4(),
			organization_id: organization_id.clone(),
			provider,
			status: SyncStatus::Syncing,
			started_at: Utc::now(),
			finished_at: None,
			error: None,
			stats: SyncStats::default(),
		};
		history.push(run.clone());
		if history.len() > HISTORY_LIMIT {
			history.drain(..history.len() - HISTORY_LIMIT);
		}
		Ok(run)
	}

	/// Mark an active run completed
	pub async fn complete(&self, run: &SyncRun, stats: SyncStats) -> SyncRun {
		self.finish(run, SyncStatus::Completed, stats, None).await
	}

	/// Mark an active run failed
	pub async fn fail(&self, run: &SyncRun, stats: SyncStats, error: String) -> SyncRun {
		self.finish(run, SyncStatus::Failed, stats, Some(error)).await
	}

	/// Move a run into a terminal state. Runs that already finished are
	/// returned unchanged.
	async fn finish(
		&self,
		run: &SyncRun,
		status: SyncStatus,
		stats: SyncStats,
		error: Option<String>,
	) -> SyncRun {
		let mut runs = self.runs.lock().await;
		let Some(stored) = runs
			.get_mut(&(run.organization_id.clone(), run.provider))
			.and_then(|history| history.iter_mut().rev().find(|stored| stored.id == run.id))
		else {
			tracing::warn!(run_id = %run.id, "Finishing a run the ledger does not know");
			return run.clone();
		};

		if !stored.is_active() {
			tracing::warn!(run_id = %run.id, status = ?stored.status, "Run already finished");
			return stored.clone();
		}

		stored.status = status;
		stored.stats = stats;
		stored.error = error;
		stored.finished_at = Some(Utc::now());
		stored.clone()
	}

	/// The most recent run of a scope
	pub async fn latest(
		&self,
		organization_id: &OrganizationId,
		provider: Provider,
	) -> Option<SyncRun> {
		self.runs
			.lock()
			.await
			.get(&(organization_id.clone(), provider))
			.and_then(|history| history.last().cloned())
	}

	/// State of a scope, [`SyncStatus::Idle`] when it never ran
	pub async fn status(&self, organization_id: &OrganizationId, provider: Provider) -> SyncStatus {
		self.latest(organization_id, provider).await.map_or(SyncStatus::Idle, |run| run.status)
	}

	/// Retained runs of a scope, newest first
	pub async fn history(&self, organization_id: &OrganizationId, provider: Provider) -> Vec<SyncRun> {
		self.runs
			.lock()
			.await
			.get(&(organization_id.clone(), provider))
			.map(|history| history.iter().rev().cloned().collect())
			.unwrap_or_default()
	}

	/// Every run currently in progress
	pub async fn active(&self) -> Vec<SyncRun> {
		self.runs
			.lock()
			.await
			.values()
			.filter_map(|history| history.last().filter(|run| run.is_active()).cloned())
			.collect()
	}
}
