//! Periodic sync scheduling per organization.

use std::{
	collections::HashMap,
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc,
	},
	time::Duration,
};

use tokio::{
	sync::{watch, Mutex},
	task::JoinHandle,
	time::{Instant, MissedTickBehavior},
};
use tokio_stream::{wrappers::IntervalStream, StreamExt};

use crate::{
	engine::SyncEngine,
	entity::{OrganizationId, Provider},
	run::SyncRun,
};

/// A running schedule loop
#[derive(Debug)]
struct Schedule {
	/// Providers synced on every tick
	providers: Vec<Provider>,
	/// Stops the loop at its next wakeup
	shutdown: watch::Sender<bool>,
	/// The loop task
	handle: JoinHandle<()>,
}

impl Schedule {
	/// Stop the loop and wait for it to exit
	async fn stop(self) {
		self.shutdown.send_replace(true);
		if let Err(error) = self.handle.await {
			tracing::error!("Schedule loop failed: {}", error);
		}
	}
}

/// Triggers a sync of every scheduled organization at a fixed interval
#[derive(Debug)]
pub struct Scheduler {
	/// Engine runs are triggered on
	engine: Arc<SyncEngine>,
	/// Time between two runs of an organization
	interval: Duration,
	/// Trigger the first run immediately
	run_on_start: bool,
	/// Loops by organization
	schedules: Mutex<HashMap<OrganizationId, Schedule>>,
	/// Set once [`Scheduler::stop_all`] was called
	stopped: AtomicBool,
}

impl Scheduler {
	/// Create a scheduler without organizations
	pub fn new(engine: Arc<SyncEngine>, interval: Duration, run_on_start: bool) -> Self {
		Self {
			engine,
			interval,
			run_on_start,
			schedules: Mutex::new(HashMap::new()),
			stopped: AtomicBool::new(false),
		}
	}

	/// Start syncing an organization periodically, replacing any previous
	/// schedule of it
	pub async fn add_organization(&self, organization_id: OrganizationId, providers: Vec<Provider>) {
		if self.stopped.load(Ordering::SeqCst) {
			tracing::warn!(%organization_id, "Scheduler stopped, not scheduling organization");
			return;
		}

		let (shutdown, shutdown_rx) = watch::channel(false);
		let handle = tokio::spawn(schedule_loop(
			self.engine.clone(),
			organization_id.clone(),
			providers.clone(),
			self.first_tick(),
			self.interval,
			shutdown_rx,
		));
		tracing::info!(%organization_id, ?providers, interval = ?self.interval, "Scheduled organization");

		let previous = self
			.schedules
			.lock()
			.await
			.insert(organization_id, Schedule { providers, shutdown, handle });
		if let Some(previous) = previous {
			previous.stop().await;
		}
	}

	/// Stop syncing an organization. Runs already in progress finish.
	/// Returns whether the organization was scheduled.
	pub async fn remove_organization(&self, organization_id: &OrganizationId) -> bool {
		let removed = self.schedules.lock().await.remove(organization_id);
		match removed {
			Some(schedule) => {
				schedule.stop().await;
				tracing::info!(%organization_id, "Unscheduled organization");
				true
			}
			None => false,
		}
	}

	/// Organizations currently scheduled
	pub async fn organizations(&self) -> Vec<OrganizationId> {
		self.schedules.lock().await.keys().cloned().collect()
	}

	/// Trigger an immediate sync of every provider of a scheduled
	/// organization
	pub async fn start_organization_sync(&self, organization_id: &OrganizationId) -> Vec<SyncRun> {
		if self.stopped.load(Ordering::SeqCst) {
			tracing::warn!(%organization_id, "Scheduler stopped, ignoring sync request");
			return Vec::new();
		}
		let providers = match self.schedules.lock().await.get(organization_id) {
			Some(schedule) => schedule.providers.clone(),
			None => {
				tracing::warn!(%organization_id, "Organization is not scheduled");
				return Vec::new();
			}
		};

		let mut runs = Vec::with_capacity(providers.len());
		for provider in providers {
			runs.push(self.engine.trigger_sync(organization_id, provider).await);
		}
		runs
	}

	/// Stop every schedule loop and wait for in-flight runs to finish
	pub async fn stop_all(&self) {
		self.stopped.store(true, Ordering::SeqCst);
		let schedules: Vec<_> = self.schedules.lock().await.drain().collect();
		for (organization_id, schedule) in schedules {
			schedule.stop().await;
			tracing::debug!(%organization_id, "Stopped schedule");
		}
		self.engine.wait_idle().await;
		tracing::info!("Scheduler stopped");
	}

	/// When a newly added organization first syncs
	fn first_tick(&self) -> Instant {
		if self.run_on_start {
			Instant::now()
		} else {
			Instant::now() + self.interval
		}
	}
}

/// Trigger runs on every tick until shut down
async fn schedule_loop(
	engine: Arc<SyncEngine>,
	organization_id: OrganizationId,
	providers: Vec<Provider>,
	start: Instant,
	period: Duration,
	mut shutdown: watch::Receiver<bool>,
) {
	let mut interval = tokio::time::interval_at(start, period);
	// a run that outlasts the interval must not cause a burst of triggers
	interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
	let mut ticks = IntervalStream::new(interval);

	loop {
		tokio::select! {
			_ = shutdown.changed() => break,
			tick = ticks.next() => {
				if tick.is_none() {
					break;
				}
				for provider in &providers {
					engine.trigger_sync(&organization_id, *provider).await;
				}
			}
		}
	}
	tracing::debug!(%organization_id, "Schedule loop exited");
}

#[cfg(test)]
mod tests {
	#![allow(clippy::expect_used, clippy::unwrap_used)]

	use super::*;
	use crate::{
		credentials::{CredentialStore, MemoryCredentialStore, PlaintextCipher, ProviderCredential},
		dispatch::BatchOptions,
		orchestrator::SyncOrchestrator,
		provider::ProviderConnector,
		run::{RunLedger, SyncStatus},
		store::MemoryStore,
		test_helpers::{user, StaticConnector, StaticDirectory},
	};

	fn org() -> OrganizationId {
		OrganizationId::new("org1")
	}

	async fn engine(directory: Arc<StaticDirectory>) -> Arc<SyncEngine> {
		let credentials = Arc::new(MemoryCredentialStore::new(Arc::new(PlaintextCipher)));
		credentials
			.store(
				&org(),
				Provider::Google,
				ProviderCredential {
					secret: "{}".to_owned(),
					principal: "admin@example.com".to_owned(),
					domain: "example.com".to_owned(),
				},
			)
			.await
			.unwrap();
		let connector: Arc<dyn ProviderConnector> =
			Arc::new(StaticConnector::new().with(directory));
		let orchestrator = Arc::new(SyncOrchestrator::new(
			Arc::new(MemoryStore::new()),
			credentials.clone(),
			connector.clone(),
			Arc::new(RunLedger::new()),
		));
		Arc::new(SyncEngine::new(orchestrator, credentials, connector, BatchOptions::default()))
	}

	#[tokio::test(start_paused = true)]
	async fn test_runs_on_start_and_every_interval() {
		let directory = Arc::new(StaticDirectory::new(Provider::Google));
		directory.set_users(vec![user("u1", "a@example.com")]).await;
		let engine = engine(directory.clone()).await;
		let scheduler = Scheduler::new(engine.clone(), Duration::from_secs(60), true);

		scheduler.add_organization(org(), vec![Provider::Google]).await;
		tokio::time::sleep(Duration::from_secs(150)).await;
		scheduler.stop_all().await;

		// ticks at 0s, 60s and 120s
		assert_eq!(directory.user_listings().await, 3);
		assert_eq!(engine.sync_history(&org(), Provider::Google).await.len(), 3);
	}

	#[tokio::test(start_paused = true)]
	async fn test_removed_organization_stops_syncing() {
		let directory = Arc::new(StaticDirectory::new(Provider::Google));
		directory.set_users(vec![user("u1", "a@example.com")]).await;
		let engine = engine(directory.clone()).await;
		let scheduler = Scheduler::new(engine.clone(), Duration::from_secs(60), false);

		scheduler.add_organization(org(), vec![Provider::Google]).await;
		assert!(scheduler.remove_organization(&org()).await);
		assert!(!scheduler.remove_organization(&org()).await);
		tokio::time::sleep(Duration::from_secs(300)).await;
		scheduler.stop_all().await;

		assert_eq!(directory.user_listings().await, 0);
		assert!(scheduler.organizations().await.is_empty());
	}

	#[tokio::test(start_paused = true)]
	async fn test_manual_sync_is_single_flight() {
		let directory = Arc::new(StaticDirectory::new(Provider::Google));
		directory.set_users(vec![user("u1", "a@example.com")]).await;
		directory.hold_listings();
		let engine = engine(directory.clone()).await;
		let scheduler = Scheduler::new(engine.clone(), Duration::from_secs(3600), false);
		scheduler.add_organization(org(), vec![Provider::Google]).await;

		let first = scheduler.start_organization_sync(&org()).await;
		let second = scheduler.start_organization_sync(&org()).await;
		assert_eq!(first.len(), 1);
		assert_eq!(first[0].id, second[0].id);
		assert_eq!(second[0].status, SyncStatus::Syncing);

		directory.release_listings();
		scheduler.stop_all().await;

		assert_eq!(directory.user_listings().await, 1);
		let latest = engine.get_sync_status(&org(), Provider::Google).await.unwrap();
		assert_eq!(latest.status, SyncStatus::Completed);
		assert!(scheduler.start_organization_sync(&org()).await.is_empty());
	}
}
