//! In-memory fakes for exercising the engine without a real provider.

use std::{
	collections::{HashMap, HashSet},
	sync::Arc,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::{watch, Mutex};

use crate::{
	credentials::ProviderCredential,
	entity::{
		CanonicalEntity, CanonicalGroup, CanonicalLicense, CanonicalUser, EntityKey, EntityKind,
		FetchedEntity, GroupMembership, OrganizationId, Provider, SyncedEntity,
	},
	error::{ProviderError, SyncError, SyncResult},
	provider::{DirectoryProvider, ProviderConnector, UserPatch},
	store::{EntityStore, MemoryStore, UpsertOutcome},
};

/// A fetched user with predictable fields
#[must_use]
pub fn user(id: &str, email: &str) -> FetchedEntity {
	let (local, _) = email.split_once('@').unwrap_or((email, ""));
	FetchedEntity {
		provider_entity_id: id.to_owned(),
		canonical: CanonicalEntity::User(CanonicalUser {
			email: email.to_lowercase(),
			given_name: local.to_owned(),
			family_name: "Example".to_owned(),
			display_name: format!("{local} Example"),
			active: true,
			org_unit: Some("/".to_owned()),
			job_title: None,
			is_admin: false,
		}),
		raw: json!({ "id": id, "primaryEmail": email }),
	}
}

/// A fetched group with predictable fields
#[must_use]
pub fn group(id: &str, name: &str) -> FetchedEntity {
	FetchedEntity {
		provider_entity_id: id.to_owned(),
		canonical: CanonicalEntity::Group(CanonicalGroup {
			email: format!("{name}@example.com"),
			name: name.to_owned(),
			description: None,
		}),
		raw: json!({ "id": id, "name": name }),
	}
}

/// A fetched license SKU
#[must_use]
pub fn license(sku_id: &str, name: &str, assigned_units: u64) -> FetchedEntity {
	FetchedEntity {
		provider_entity_id: sku_id.to_owned(),
		canonical: CanonicalEntity::License(CanonicalLicense {
			sku_id: sku_id.to_owned(),
			sku_name: name.to_owned(),
			product_id: None,
			assigned_units,
			total_units: None,
		}),
		raw: json!({ "skuId": sku_id, "consumedUnits": assigned_units }),
	}
}

/// Mutable contents of a [`StaticDirectory`]
#[derive(Debug, Default)]
struct DirectoryState {
	/// Listed users
	users: Vec<FetchedEntity>,
	/// Listed groups
	groups: Vec<FetchedEntity>,
	/// Members by group ID
	members: HashMap<String, Vec<String>>,
	/// Listed license SKUs
	licenses: Vec<FetchedEntity>,
	/// Errors returned by listings of a kind
	listing_failures: HashMap<EntityKind, ProviderError>,
	/// Errors returned by writes, by write key
	write_failures: HashMap<String, ProviderError>,
	/// Keys of all writes that were attempted
	writes: Vec<String>,
	/// Number of user listings served
	user_listings: usize,
}

/// A provider serving fixed listings and recording writes.
///
/// Write keys look like `update_user:<user>` or
/// `insert_group_member:<group>:<user>`.
#[derive(Debug)]
pub struct StaticDirectory {
	/// Provider this directory pretends to be
	provider: Provider,
	/// Listings and recorded calls
	state: Mutex<DirectoryState>,
	/// Listings wait while this is `false`
	gate: watch::Sender<bool>,
}

impl StaticDirectory {
	/// An empty directory
	#[must_use]
	pub fn new(provider: Provider) -> Self {
		Self { provider, state: Mutex::new(DirectoryState::default()), gate: watch::channel(true).0 }
	}

	/// Replace the user listing
	pub async fn set_users(&self, users: Vec<FetchedEntity>) {
		self.state.lock().await.users = users;
	}

	/// Replace the group listing
	pub async fn set_groups(&self, groups: Vec<FetchedEntity>) {
		self.state.lock().await.groups = groups;
	}

	/// Replace the members of a group
	pub async fn set_members(&self, group_id: &str, user_ids: &[&str]) {
		self.state
			.lock()
			.await
			.members
			.insert(group_id.to_owned(), user_ids.iter().map(ToString::to_string).collect());
	}

	/// Replace the license listing
	pub async fn set_licenses(&self, licenses: Vec<FetchedEntity>) {
		self.state.lock().await.licenses = licenses;
	}

	/// Make listings of `kind` fail, or succeed again with `None`
	pub async fn fail_listing(&self, kind: EntityKind, error: Option<ProviderError>) {
		let mut state = self.state.lock().await;
		match error {
			Some(error) => state.listing_failures.insert(kind, error),
			None => state.listing_failures.remove(&kind),
		};
	}

	/// Make the write with the given key fail
	pub async fn fail_write(&self, key: &str, error: ProviderError) {
		self.state.lock().await.write_failures.insert(key.to_owned(), error);
	}

	/// Keys of the writes attempted so far
	pub async fn writes(&self) -> Vec<String> {
		self.state.lock().await.writes.clone()
	}

	/// Number of user listings served so far
	pub async fn user_listings(&self) -> usize {
		self.state.lock().await.user_listings
	}

	/// Hold all listings until [`StaticDirectory::release_listings`]
	pub fn hold_listings(&self) {
		self.gate.send_replace(false);
	}

	/// Let held listings continue
	pub fn release_listings(&self) {
		self.gate.send_replace(true);
	}

	/// Wait for the gate, then return the listing of `kind`
	async fn listing(&self, kind: EntityKind) -> Result<Vec<FetchedEntity>, ProviderError> {
		let mut gate = self.gate.subscribe();
		while !*gate.borrow_and_update() {
			if gate.changed().await.is_err() {
				break;
			}
		}

		let mut state = self.state.lock().await;
		if let Some(error) = state.listing_failures.get(&kind) {
			return Err(error.clone());
		}
		Ok(match kind {
			EntityKind::User => {
				state.user_listings += 1;
				state.users.clone()
			}
			EntityKind::Group => state.groups.clone(),
			EntityKind::License => state.licenses.clone(),
		})
	}

	/// Record a write and return its configured outcome
	async fn write(&self, key: String) -> Result<(), ProviderError> {
		let mut state = self.state.lock().await;
		let outcome = state.write_failures.get(&key).cloned().map_or(Ok(()), Err);
		state.writes.push(key);
		outcome
	}
}

#[async_trait]
impl DirectoryProvider for StaticDirectory {
	fn provider(&self) -> Provider {
		self.provider
	}

	async fn list_users(&self) -> Result<Vec<FetchedEntity>, ProviderError> {
		self.listing(EntityKind::User).await
	}

	async fn list_groups(&self) -> Result<Vec<FetchedEntity>, ProviderError> {
		self.listing(EntityKind::Group).await
	}

	async fn list_group_members(&self, group_id: &str) -> Result<Vec<String>, ProviderError> {
		Ok(self.state.lock().await.members.get(group_id).cloned().unwrap_or_default())
	}

	async fn list_license_skus(&self) -> Result<Vec<FetchedEntity>, ProviderError> {
		self.listing(EntityKind::License).await
	}

	async fn update_user(&self, user_id: &str, _patch: &UserPatch) -> Result<(), ProviderError> {
		self.write(format!("update_user:{user_id}")).await
	}

	async fn insert_group_member(
		&self,
		group_id: &str,
		user_id: &str,
	) -> Result<(), ProviderError> {
		self.write(format!("insert_group_member:{group_id}:{user_id}")).await
	}

	async fn delete_group_member(
		&self,
		group_id: &str,
		user_id: &str,
	) -> Result<(), ProviderError> {
		self.write(format!("delete_group_member:{group_id}:{user_id}")).await
	}

	async fn assign_license(&self, user_id: &str, sku_id: &str) -> Result<(), ProviderError> {
		self.write(format!("assign_license:{user_id}:{sku_id}")).await
	}

	async fn remove_license(&self, user_id: &str, sku_id: &str) -> Result<(), ProviderError> {
		self.write(format!("remove_license:{user_id}:{sku_id}")).await
	}
}

/// Connector handing out prepared [`StaticDirectory`] instances
#[derive(Debug, Default)]
pub struct StaticConnector {
	/// Directories by provider
	directories: HashMap<Provider, Arc<StaticDirectory>>,
}

impl StaticConnector {
	/// A connector without directories
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	/// Serve `directory` for its provider
	#[must_use]
	pub fn with(mut self, directory: Arc<StaticDirectory>) -> Self {
		self.directories.insert(directory.provider(), directory);
		self
	}
}

impl ProviderConnector for StaticConnector {
	fn connect(
		&self,
		provider: Provider,
		_credential: ProviderCredential,
	) -> SyncResult<Arc<dyn DirectoryProvider>> {
		match self.directories.get(&provider) {
			Some(directory) => Ok(directory.clone()),
			None => Err(SyncError::Credential(format!("{provider} is not connected"))),
		}
	}
}

/// A [`MemoryStore`] that records every write it receives.
///
/// Log entries look like `upsert:user:u1` or `delete_entities:user:u1,u2`.
#[derive(Debug, Default)]
pub struct RecordingStore {
	/// Backing store
	inner: MemoryStore,
	/// Write log
	log: Mutex<Vec<String>>,
}

impl RecordingStore {
	/// An empty recording store
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	/// All writes so far
	pub async fn log(&self) -> Vec<String> {
		self.log.lock().await.clone()
	}

	/// Number of upserts so far
	pub async fn upserts(&self) -> usize {
		self.log.lock().await.iter().filter(|entry| entry.starts_with("upsert:")).count()
	}

	/// Forget the recorded writes
	pub async fn clear_log(&self) {
		self.log.lock().await.clear();
	}

	/// Append a log entry
	async fn record(&self, entry: String) {
		self.log.lock().await.push(entry);
	}
}

/// Sorted, comma-separated IDs
fn joined(ids: &HashSet<String>) -> String {
	let mut ids: Vec<&str> = ids.iter().map(String::as_str).collect();
	ids.sort_unstable();
	ids.join(",")
}

#[async_trait]
impl EntityStore for RecordingStore {
	async fn hashes(
		&self,
		organization_id: &OrganizationId,
		provider: Provider,
		kind: EntityKind,
	) -> SyncResult<HashMap<String, String>> {
		self.inner.hashes(organization_id, provider, kind).await
	}

	async fn upsert(
		&self,
		key: EntityKey,
		canonical: CanonicalEntity,
		raw_snapshot: String,
		hash: String,
	) -> SyncResult<UpsertOutcome> {
		self.record(format!("upsert:{}:{}", key.kind, key.provider_entity_id)).await;
		self.inner.upsert(key, canonical, raw_snapshot, hash).await
	}

	async fn mark_synced(
		&self,
		organization_id: &OrganizationId,
		provider: Provider,
		kind: EntityKind,
		ids: &HashSet<String>,
		synced_at: DateTime<Utc>,
	) -> SyncResult<()> {
		self.record(format!("mark_synced:{kind}:{}", joined(ids))).await;
		self.inner.mark_synced(organization_id, provider, kind, ids, synced_at).await
	}

	async fn replace_memberships(
		&self,
		organization_id: &OrganizationId,
		provider: Provider,
		group_id: &str,
		user_ids: &[String],
	) -> SyncResult<usize> {
		self.record(format!("replace_memberships:{group_id}")).await;
		self.inner.replace_memberships(organization_id, provider, group_id, user_ids).await
	}

	async fn delete_dependents(
		&self,
		organization_id: &OrganizationId,
		provider: Provider,
		kind: EntityKind,
		ids: &HashSet<String>,
	) -> SyncResult<usize> {
		self.record(format!("delete_dependents:{kind}:{}", joined(ids))).await;
		self.inner.delete_dependents(organization_id, provider, kind, ids).await
	}

	async fn delete_entities(
		&self,
		organization_id: &OrganizationId,
		provider: Provider,
		kind: EntityKind,
		ids: &HashSet<String>,
	) -> SyncResult<usize> {
		self.record(format!("delete_entities:{kind}:{}", joined(ids))).await;
		self.inner.delete_entities(organization_id, provider, kind, ids).await
	}

	async fn get(&self, key: &EntityKey) -> SyncResult<Option<SyncedEntity>> {
		self.inner.get(key).await
	}

	async fn memberships(
		&self,
		organization_id: &OrganizationId,
		provider: Provider,
	) -> SyncResult<Vec<GroupMembership>> {
		self.inner.memberships(organization_id, provider).await
	}
}
