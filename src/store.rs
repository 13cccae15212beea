//! Local entity store.
//!
//! All writes go through the narrow upsert, membership-replace and
//! delete contracts of [`EntityStore`]. Deletes always remove dependent
//! membership rows before the parent rows.

use std::{
	collections::{BTreeSet, HashMap, HashSet},
	path::{Path, PathBuf},
};

use anyhow::{bail, Context};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::{
	entity::{
		CanonicalEntity, EntityKey, EntityKind, GroupMembership, OrganizationId, Provider,
		SyncedEntity,
	},
	error::{SyncError, SyncResult},
};

/// Whether an upsert inserted or replaced a row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
	/// A new row was inserted
	Created,
	/// An existing row was overwritten
	Updated,
}

/// Persistence for synced entities and memberships
#[async_trait]
pub trait EntityStore: Send + Sync {
	/// Stored content hashes of one kind, by provider entity ID
	async fn hashes(
		&self,
		organization_id: &OrganizationId,
		provider: Provider,
		kind: EntityKind,
	) -> SyncResult<HashMap<String, String>>;

	/// Insert or fully overwrite an entity
	async fn upsert(
		&self,
		key: EntityKey,
		canonical: CanonicalEntity,
		raw_snapshot: String,
		hash: String,
	) -> SyncResult<UpsertOutcome>;

	/// Refresh `last_synced_at` of entities that were observed unchanged
	async fn mark_synced(
		&self,
		organization_id: &OrganizationId,
		provider: Provider,
		kind: EntityKind,
		ids: &HashSet<String>,
		synced_at: DateTime<Utc>,
	) -> SyncResult<()>;

	/// Replace all membership rows of a group with `user_ids`
	async fn replace_memberships(
		&self,
		organization_id: &OrganizationId,
		provider: Provider,
		group_id: &str,
		user_ids: &[String],
	) -> SyncResult<usize>;

	/// Delete rows that reference the given entities
	async fn delete_dependents(
		&self,
		organization_id: &OrganizationId,
		provider: Provider,
		kind: EntityKind,
		ids: &HashSet<String>,
	) -> SyncResult<usize>;

	/// Delete the entity rows themselves
	async fn delete_entities(
		&self,
		organization_id: &OrganizationId,
		provider: Provider,
		kind: EntityKind,
		ids: &HashSet<String>,
	) -> SyncResult<usize>;

	/// Look up a single entity
	async fn get(&self, key: &EntityKey) -> SyncResult<Option<SyncedEntity>>;

	/// All memberships of an organization and provider
	async fn memberships(
		&self,
		organization_id: &OrganizationId,
		provider: Provider,
	) -> SyncResult<Vec<GroupMembership>>;

	/// Persist buffered state, if the store buffers anything
	async fn flush(&self) -> SyncResult<()> {
		Ok(())
	}

	/// IDs of all stored entities of one kind
	async fn current_ids(
		&self,
		organization_id: &OrganizationId,
		provider: Provider,
		kind: EntityKind,
	) -> SyncResult<HashSet<String>> {
		Ok(self.hashes(organization_id, provider, kind).await?.into_keys().collect())
	}

	/// Delete entities together with their dependents, dependents first.
	/// Returns the number of entity rows removed.
	async fn delete_many(
		&self,
		organization_id: &OrganizationId,
		provider: Provider,
		kind: EntityKind,
		ids: &HashSet<String>,
	) -> SyncResult<usize> {
		if ids.is_empty() {
			return Ok(0);
		}
		let dependents = self.delete_dependents(organization_id, provider, kind, ids).await?;
		tracing::debug!(%organization_id, %provider, %kind, dependents, "Deleted dependent rows");
		self.delete_entities(organization_id, provider, kind, ids).await
	}
}

/// Serializable contents of a [`MemoryStore`]
#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreState {
	/// Entities by natural key
	entities: HashMap<EntityKey, SyncedEntity>,
	/// Membership join rows
	memberships: BTreeSet<GroupMembership>,
}

/// In-memory entity store, optionally snapshotted to disk
#[derive(Debug, Default)]
pub struct MemoryStore {
	/// Store contents
	state: RwLock<StoreState>,
	/// Where [`EntityStore::flush`] writes the snapshot
	snapshot_path: Option<PathBuf>,
}

impl MemoryStore {
	/// Create an empty store that is never persisted
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	/// Open a store backed by a snapshot file, loading it if it exists
	pub async fn open(snapshot_path: &Path) -> anyhow::Result<Self> {
		let state = match tokio::fs::read(snapshot_path).await {
			Ok(data) => {
				bincode::deserialize(&data).context("store snapshot deserialization failed")?
			}
			Err(err) => {
				if err.kind() == std::io::ErrorKind::NotFound {
					tracing::info!("Store snapshot missing, starting empty");
					StoreState::default()
				} else {
					bail!(err)
				}
			}
		};
		Ok(Self { state: RwLock::new(state), snapshot_path: Some(snapshot_path.to_path_buf()) })
	}

	/// Number of stored entities across all organizations
	pub async fn len(&self) -> usize {
		self.state.read().await.entities.len()
	}

	/// Whether the store holds no entities
	pub async fn is_empty(&self) -> bool {
		self.state.read().await.entities.is_empty()
	}
}

/// Whether an entity key belongs to the given scope
fn in_scope(
	key: &EntityKey,
	organization_id: &OrganizationId,
	provider: Provider,
	kind: EntityKind,
) -> bool {
	key.kind == kind && key.provider == provider && &key.organization_id == organization_id
}

#[async_trait]
impl EntityStore for MemoryStore {
	async fn hashes(
		&self,
		organization_id: &OrganizationId,
		provider: Provider,
		kind: EntityKind,
	) -> SyncResult<HashMap<String, String>> {
		let state = self.state.read().await;
		Ok(state
			.entities
			.iter()
			.filter(|(key, _)| in_scope(key, organization_id, provider, kind))
			.map(|(key, entity)| (key.provider_entity_id.clone(), entity.content_hash.clone()))
			.collect())
	}

	async fn upsert(
		&self,
		key: EntityKey,
		canonical: CanonicalEntity,
		raw_snapshot: String,
		hash: String,
	) -> SyncResult<UpsertOutcome> {
		let entity = SyncedEntity {
			key: key.clone(),
			canonical,
			content_hash: hash,
			raw_snapshot,
			last_synced_at: Utc::now(),
		};
		let previous = self.state.write().await.entities.insert(key, entity);
		Ok(if previous.is_some() { UpsertOutcome::Updated } else { UpsertOutcome::Created })
	}

	async fn mark_synced(
		&self,
		organization_id: &OrganizationId,
		provider: Provider,
		kind: EntityKind,
		ids: &HashSet<String>,
		synced_at: DateTime<Utc>,
	) -> SyncResult<()> {
		let mut state = self.state.write().await;
		for (key, entity) in &mut state.entities {
			if in_scope(key, organization_id, provider, kind) && ids.contains(&key.provider_entity_id)
			{
				entity.last_synced_at = synced_at;
			}
		}
		Ok(())
	}

	async fn replace_memberships(
		&self,
		organization_id: &OrganizationId,
		provider: Provider,
		group_id: &str,
		user_ids: &[String],
	) -> SyncResult<usize> {
		let mut state = self.state.write().await;
		state.memberships.retain(|membership| {
			!(membership.group_id == group_id
				&& membership.provider == provider
				&& &membership.organization_id == organization_id)
		});
		let before = state.memberships.len();
		state.memberships.extend(user_ids.iter().map(|user_id| GroupMembership {
			organization_id: organization_id.clone(),
			provider,
			group_id: group_id.to_owned(),
			user_id: user_id.clone(),
		}));
		Ok(state.memberships.len() - before)
	}

	async fn delete_dependents(
		&self,
		organization_id: &OrganizationId,
		provider: Provider,
		kind: EntityKind,
		ids: &HashSet<String>,
	) -> SyncResult<usize> {
		let mut state = self.state.write().await;
		let before = state.memberships.len();
		state.memberships.retain(|membership| {
			let referenced = match kind {
				EntityKind::User => ids.contains(&membership.user_id),
				EntityKind::Group => ids.contains(&membership.group_id),
				EntityKind::License => false,
			};
			!(referenced
				&& membership.provider == provider
				&& &membership.organization_id == organization_id)
		});
		Ok(before - state.memberships.len())
	}

	async fn delete_entities(
		&self,
		organization_id: &OrganizationId,
		provider: Provider,
		kind: EntityKind,
		ids: &HashSet<String>,
	) -> SyncResult<usize> {
		let mut state = self.state.write().await;
		let before = state.entities.len();
		state.entities.retain(|key, _| {
			!(in_scope(key, organization_id, provider, kind)
				&& ids.contains(&key.provider_entity_id))
		});
		Ok(before - state.entities.len())
	}

	async fn get(&self, key: &EntityKey) -> SyncResult<Option<SyncedEntity>> {
		Ok(self.state.read().await.entities.get(key).cloned())
	}

	async fn memberships(
		&self,
		organization_id: &OrganizationId,
		provider: Provider,
	) -> SyncResult<Vec<GroupMembership>> {
		Ok(self
			.state
			.read()
			.await
			.memberships
			.iter()
			.filter(|membership| {
				membership.provider == provider && &membership.organization_id == organization_id
			})
			.cloned()
			.collect())
	}

	async fn flush(&self) -> SyncResult<()> {
		let Some(path) = &self.snapshot_path else {
			return Ok(());
		};
		let data = {
			let state = self.state.read().await;
			bincode::serialize(&*state)
				.map_err(|error| SyncError::Store(format!("failed to serialize snapshot: {error}")))?
		};
		tokio::fs::write(path, data).await.map_err(|error| {
			SyncError::Store(format!("failed to write snapshot to {}: {error}", path.display()))
		})
	}
}
