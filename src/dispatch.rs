//! Bulk mutations pushed back to a provider.
//!
//! Operations run in batches: concurrently within a batch, each item
//! staggered a little behind the previous one, with a fixed pause between
//! batches. A failing item never affects its siblings.

use std::{fmt, time::Duration};

use futures::future::join_all;
use serde::{Deserialize, Serialize};

use crate::{
	error::ProviderError,
	provider::{DirectoryProvider, UserPatch},
};

/// Rate and concurrency settings of a dispatch, passed in per call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchOptions {
	/// Operations per batch
	pub batch_size: usize,
	/// Pause between two batches
	pub inter_batch_delay: Duration,
	/// Offset between the start of two operations in the same batch
	pub per_item_stagger: Duration,
	/// Typical provider round trip, only used for estimates
	pub expected_call_latency: Duration,
}

impl Default for BatchOptions {
	fn default() -> Self {
		Self {
			batch_size: 50,
			inter_batch_delay: Duration::from_millis(1000),
			per_item_stagger: Duration::from_millis(50),
			expected_call_latency: Duration::from_millis(250),
		}
	}
}

/// A single write against the provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Mutation {
	/// Block sign-in for a user
	SuspendUser {
		/// Target user
		user_id: String,
	},
	/// Allow sign-in again
	ReactivateUser {
		/// Target user
		user_id: String,
	},
	/// Move a user to another organizational unit or department
	MoveUser {
		/// Target user
		user_id: String,
		/// Destination unit
		destination: String,
	},
	/// Add a user to a group
	AddGroupMember {
		/// Target group
		group_id: String,
		/// User to add
		user_id: String,
	},
	/// Remove a user from a group
	RemoveGroupMember {
		/// Target group
		group_id: String,
		/// User to remove
		user_id: String,
	},
	/// Assign a license SKU
	AssignLicense {
		/// Target user
		user_id: String,
		/// SKU to assign
		sku_id: String,
	},
	/// Remove a license SKU
	RemoveLicense {
		/// Target user
		user_id: String,
		/// SKU to remove
		sku_id: String,
	},
}

impl Mutation {
	/// Whether `error` means the desired end state already holds
	#[must_use]
	pub fn already_applied(&self, error: &ProviderError) -> bool {
		match self {
			Self::AddGroupMember { .. } | Self::AssignLicense { .. } => error.is_already_exists(),
			Self::RemoveGroupMember { .. } | Self::RemoveLicense { .. } => error.is_not_found(),
			Self::SuspendUser { .. } | Self::ReactivateUser { .. } | Self::MoveUser { .. } => false,
		}
	}
}

impl fmt::Display for Mutation {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::SuspendUser { user_id } => write!(f, "suspend {user_id}"),
			Self::ReactivateUser { user_id } => write!(f, "reactivate {user_id}"),
			Self::MoveUser { user_id, destination } => write!(f, "move {user_id} to {destination}"),
			Self::AddGroupMember { group_id, user_id } => write!(f, "add {user_id} to {group_id}"),
			Self::RemoveGroupMember { group_id, user_id } => {
				write!(f, "remove {user_id} from {group_id}")
			}
			Self::AssignLicense { user_id, sku_id } => write!(f, "assign {sku_id} to {user_id}"),
			Self::RemoveLicense { user_id, sku_id } => write!(f, "remove {sku_id} from {user_id}"),
		}
	}
}

/// A caller-identified mutation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
	/// Caller-chosen ID echoed in the result
	pub id: String,
	/// What to do
	#[serde(flatten)]
	pub mutation: Mutation,
}

/// Outcome of one operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperationResult {
	/// ID of the operation
	pub id: String,
	/// Whether the end state now holds
	pub success: bool,
	/// Failure description
	pub error: Option<String>,
	/// HTTP-like status of the failure
	pub status_code: Option<u16>,
}

impl OperationResult {
	/// A successful result
	fn succeeded(id: &str) -> Self {
		Self { id: id.to_owned(), success: true, error: None, status_code: None }
	}
}

/// Outcome of a whole dispatch
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchResult {
	/// Operations that succeeded
	pub success_count: usize,
	/// Operations that failed
	pub failure_count: usize,
	/// Per-operation results in input order
	pub results: Vec<OperationResult>,
}

impl BatchResult {
	/// Build a result from per-operation results
	#[must_use]
	pub fn from_results(results: Vec<OperationResult>) -> Self {
		let success_count = results.iter().filter(|result| result.success).count();
		Self { success_count, failure_count: results.len() - success_count, results }
	}
}

/// Planning estimate for a dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DurationEstimate {
	/// Number of batches the operations are split into
	pub batch_count: usize,
	/// Expected wall-clock duration, rounded up to whole seconds
	pub estimated_seconds: u64,
}

/// Callback receiving `(processed, total)` after every batch
pub type ProgressFn = dyn Fn(usize, usize) + Send + Sync;

/// Estimate how long dispatching `item_count` operations takes with `options`
#[must_use]
pub fn estimate_duration(item_count: usize, options: &BatchOptions) -> DurationEstimate {
	let batch_size = options.batch_size.max(1);
	let batch_count = item_count.div_ceil(batch_size);
	if batch_count == 0 {
		return DurationEstimate { batch_count: 0, estimated_seconds: 0 };
	}

	let last_batch = item_count - (batch_count - 1) * batch_size;
	let staggers = (batch_count - 1) * (batch_size - 1) + (last_batch - 1);
	let total = options.per_item_stagger.saturating_mul(saturating_u32(staggers))
		+ options.expected_call_latency.saturating_mul(saturating_u32(batch_count))
		+ options.inter_batch_delay.saturating_mul(saturating_u32(batch_count - 1));

	let estimated_seconds = total.as_secs() + u64::from(total.subsec_nanos() > 0);
	DurationEstimate { batch_count, estimated_seconds }
}

/// Convert a count for duration arithmetic
fn saturating_u32(value: usize) -> u32 {
	u32::try_from(value).unwrap_or(u32::MAX)
}

/// Execute `operations` against `provider` in rate-limited batches.
///
/// Never fails as a whole: every operation's outcome is reported in the
/// returned [`BatchResult`], in input order.
pub async fn dispatch(
	provider: &dyn DirectoryProvider,
	operations: &[Operation],
	options: &BatchOptions,
	progress: Option<&ProgressFn>,
) -> BatchResult {
	let total = operations.len();
	let batch_size = options.batch_size.max(1);
	let mut results = Vec::with_capacity(total);

	for (index, batch) in operations.chunks(batch_size).enumerate() {
		if index > 0 && !options.inter_batch_delay.is_zero() {
			tokio::time::sleep(options.inter_batch_delay).await;
		}

		let outcomes = join_all(batch.iter().enumerate().map(|(position, operation)| async move {
			let stagger = options.per_item_stagger.saturating_mul(saturating_u32(position));
			if !stagger.is_zero() {
				tokio::time::sleep(stagger).await;
			}
			execute(provider, operation).await
		}))
		.await;

		let failed = outcomes.iter().filter(|outcome| !outcome.success).count();
		results.extend(outcomes);
		tracing::debug!(
			provider = %provider.provider(),
			batch = index + 1,
			size = batch.len(),
			failed,
			processed = results.len(),
			total,
			"Dispatched batch"
		);
		if let Some(progress) = progress {
			progress(results.len(), total);
		}
	}

	let result = BatchResult::from_results(results);
	tracing::info!(
		provider = %provider.provider(),
		succeeded = result.success_count,
		failed = result.failure_count,
		"Bulk dispatch finished"
	);
	result
}

/// Run one operation and capture its outcome
async fn execute(provider: &dyn DirectoryProvider, operation: &Operation) -> OperationResult {
	let outcome = match &operation.mutation {
		Mutation::SuspendUser { user_id } => {
			provider.update_user(user_id, &UserPatch { suspended: Some(true), org_unit: None }).await
		}
		Mutation::ReactivateUser { user_id } => {
			provider.update_user(user_id, &UserPatch { suspended: Some(false), org_unit: None }).await
		}
		Mutation::MoveUser { user_id, destination } => {
			let patch = UserPatch { suspended: None, org_unit: Some(destination.clone()) };
			provider.update_user(user_id, &patch).await
		}
		Mutation::AddGroupMember { group_id, user_id } => {
			provider.insert_group_member(group_id, user_id).await
		}
		Mutation::RemoveGroupMember { group_id, user_id } => {
			provider.delete_group_member(group_id, user_id).await
		}
		Mutation::AssignLicense { user_id, sku_id } => provider.assign_license(user_id, sku_id).await,
		Mutation::RemoveLicense { user_id, sku_id } => provider.remove_license(user_id, sku_id).await,
	};

	match outcome {
		Ok(()) => OperationResult::succeeded(&operation.id),
		Err(error) if operation.mutation.already_applied(&error) => {
			tracing::debug!(id = %operation.id, "`{}` already applied: {}", operation.mutation, error);
			OperationResult::succeeded(&operation.id)
		}
		Err(error) => {
			tracing::warn!(id = %operation.id, "`{}` failed: {}", operation.mutation, error);
			OperationResult {
				id: operation.id.clone(),
				success: false,
				status_code: error.status_code(),
				error: Some(error.to_string()),
			}
		}
	}
}
