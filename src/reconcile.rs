//! Removal of local entities that disappeared upstream.

use std::{collections::HashSet, sync::Arc};

use crate::{
	entity::{EntityKind, OrganizationId, Provider},
	error::{SyncError, SyncResult},
	store::EntityStore,
};

/// Deletes stored entities that are missing from a full provider listing
#[derive(Clone)]
pub struct Reconciler {
	/// Store to reconcile
	store: Arc<dyn EntityStore>,
}

impl std::fmt::Debug for Reconciler {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Reconciler").finish_non_exhaustive()
	}
}

impl Reconciler {
	/// Create a reconciler over a store
	pub fn new(store: Arc<dyn EntityStore>) -> Self {
		Self { store }
	}

	/// Remove every stored entity of `kind` whose ID is not in
	/// `observed_ids`, returning how many were removed.
	///
	/// An empty listing while entities are stored is treated as a provider
	/// fault: nothing is deleted and [`SyncError::SuspiciousEmptyListing`]
	/// is returned.
	pub async fn reconcile(
		&self,
		organization_id: &OrganizationId,
		provider: Provider,
		kind: EntityKind,
		observed_ids: &HashSet<String>,
	) -> SyncResult<usize> {
		let current = self.store.current_ids(organization_id, provider, kind).await?;

		if observed_ids.is_empty() {
			if current.is_empty() {
				return Ok(0);
			}
			tracing::error!(
				%organization_id,
				%provider,
				%kind,
				known = current.len(),
				"Provider returned an empty listing, skipping reconciliation"
			);
			return Err(SyncError::SuspiciousEmptyListing { kind, known: current.len() });
		}

		let to_remove: HashSet<String> = current.difference(observed_ids).cloned().collect();
		if to_remove.is_empty() {
			return Ok(0);
		}

		let removed = self.store.delete_many(organization_id, provider, kind, &to_remove).await?;
		tracing::info!(%organization_id, %provider, %kind, removed, "Removed entities missing upstream");
		Ok(removed)
	}
}
