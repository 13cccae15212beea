//! Data model shared by every stage of a sync run.
//!
//! Provider payloads never travel past the provider client: each client
//! extracts the fields we care about into a [`CanonicalEntity`] and keeps
//! the untouched payload as an opaque raw snapshot.

use std::fmt::{self, Display};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of a tenant organization
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrganizationId(String);

impl OrganizationId {
	/// Wrap an organization identifier
	pub fn new(id: impl Into<String>) -> Self {
		Self(id.into())
	}

	/// The raw identifier
	#[must_use]
	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl Display for OrganizationId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl From<&str> for OrganizationId {
	fn from(value: &str) -> Self {
		Self::new(value)
	}
}

/// External directory providers we can sync with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
	/// Google Workspace Admin SDK directory
	Google,
	/// Microsoft Graph directory
	Microsoft,
}

impl Display for Provider {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Google => f.write_str("google"),
			Self::Microsoft => f.write_str("microsoft"),
		}
	}
}

/// The categories of entities a sync run processes, in processing order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
	/// Directory users
	User,
	/// Directory groups
	Group,
	/// License SKUs
	License,
}

impl Display for EntityKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::User => f.write_str("user"),
			Self::Group => f.write_str("group"),
			Self::License => f.write_str("license"),
		}
	}
}

/// Natural key of a synced entity
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
	/// Owning organization
	pub organization_id: OrganizationId,
	/// Provider the entity was read from
	pub provider: Provider,
	/// Kind of the entity
	pub kind: EntityKind,
	/// The provider's own identifier
	pub provider_entity_id: String,
}

impl EntityKey {
	/// Build a key
	pub fn new(
		organization_id: &OrganizationId,
		provider: Provider,
		kind: EntityKind,
		provider_entity_id: impl Into<String>,
	) -> Self {
		Self {
			organization_id: organization_id.clone(),
			provider,
			kind,
			provider_entity_id: provider_entity_id.into(),
		}
	}
}

/// Canonical user fields
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalUser {
	/// Primary email or user principal name, lowercased
	pub email: String,
	/// Given name
	pub given_name: String,
	/// Family name
	pub family_name: String,
	/// Display name as the provider reports it
	pub display_name: String,
	/// Whether the account may sign in
	pub active: bool,
	/// Organizational unit path or department
	pub org_unit: Option<String>,
	/// Job title
	pub job_title: Option<String>,
	/// Whether the provider flags the user as an administrator
	pub is_admin: bool,
}

/// Canonical group fields
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalGroup {
	/// Group mail address, lowercased; empty for groups without one
	pub email: String,
	/// Display name
	pub name: String,
	/// Free-form description
	pub description: Option<String>,
}

/// Canonical license SKU fields
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalLicense {
	/// SKU identifier
	pub sku_id: String,
	/// Human-readable SKU name
	pub sku_name: String,
	/// Product the SKU belongs to
	pub product_id: Option<String>,
	/// Seats currently consumed
	pub assigned_units: u64,
	/// Seats purchased, when the provider reports it
	pub total_units: Option<u64>,
}

/// Strongly-typed projection of a provider entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CanonicalEntity {
	/// A user
	User(CanonicalUser),
	/// A group
	Group(CanonicalGroup),
	/// A license SKU
	License(CanonicalLicense),
}

impl CanonicalEntity {
	/// The kind of this entity
	#[must_use]
	pub fn kind(&self) -> EntityKind {
		match self {
			Self::User(_) => EntityKind::User,
			Self::Group(_) => EntityKind::Group,
			Self::License(_) => EntityKind::License,
		}
	}
}

/// An entity exactly as fetched from a provider
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedEntity {
	/// The provider's identifier for the entity
	pub provider_entity_id: String,
	/// Fields extracted for change detection and storage
	pub canonical: CanonicalEntity,
	/// The untouched provider payload
	pub raw: serde_json::Value,
}

/// An entity persisted in the local store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncedEntity {
	/// Natural key
	pub key: EntityKey,
	/// Canonical fields of the last observed state
	pub canonical: CanonicalEntity,
	/// Content hash of `canonical`
	pub content_hash: String,
	/// Provider payload serialized as JSON text
	pub raw_snapshot: String,
	/// When a run last wrote this entity
	pub last_synced_at: DateTime<Utc>,
}

/// A user's membership in a group
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupMembership {
	/// Owning organization
	pub organization_id: OrganizationId,
	/// Provider the membership was read from
	pub provider: Provider,
	/// Provider identifier of the group
	pub group_id: String,
	/// Provider identifier of the member
	pub user_id: String,
}
