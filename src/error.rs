//! Error taxonomy of the synchronization engine.

use http::StatusCode;
use thiserror::Error;

use crate::entity::EntityKind;

/// Result alias for engine operations
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that stop a sync run or a bulk dispatch as a whole.
///
/// Per-item dispatch failures never surface as a `SyncError`; they are
/// recorded in the item's [`crate::dispatch::OperationResult`] instead.
#[derive(Debug, Error)]
pub enum SyncError {
	/// Missing, invalidated or rejected provider credential. Requires
	/// an external reconnect, so it is never retried.
	#[error("credential error: {0}")]
	Credential(String),

	/// Network, rate-limit or 5xx failure that outlasted the retry budget
	#[error("provider unavailable after retries: {0}")]
	ProviderTransient(String),

	/// Any other provider failure
	#[error("provider error: {0}")]
	Provider(ProviderError),

	/// The provider returned nothing for a kind we hold local entities
	/// for; reconciliation refused to delete them.
	#[error("provider returned an empty {kind} listing while {known} are stored locally, refusing to reconcile")]
	SuspiciousEmptyListing {
		/// Entity kind that came back empty
		kind: EntityKind,
		/// Number of locally stored entities of that kind
		known: usize,
	},

	/// The local entity store failed
	#[error("local store error: {0}")]
	Store(String),
}

impl From<ProviderError> for SyncError {
	fn from(error: ProviderError) -> Self {
		match error {
			ProviderError::Unauthorized(message) | ProviderError::Forbidden(message) => {
				Self::Credential(message)
			}
			ProviderError::Transient(message) => Self::ProviderTransient(message),
			other => Self::Provider(other),
		}
	}
}

impl SyncError {
	/// Whether the failure was caused by the credential itself
	#[must_use]
	pub fn is_credential_error(&self) -> bool {
		matches!(self, Self::Credential(_))
	}
}

/// An error reported by a provider client.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
	/// 401, or the token exchange was refused
	#[error("unauthorized: {0}")]
	Unauthorized(String),

	/// 403 that is not a rate-limit or quota response
	#[error("forbidden: {0}")]
	Forbidden(String),

	/// Connection failure, 429, throttling 403 or 5xx; retried by the transport before
	/// it is escalated
	#[error("transient failure: {0}")]
	Transient(String),

	/// The provider rejected the request
	#[error("{status} {code}: {message}")]
	Rejected {
		/// HTTP status returned by the provider
		status: StatusCode,
		/// Provider-specific error code, if the body carried one
		code: String,
		/// Human-readable message from the provider
		message: String,
	},

	/// The response body could not be decoded
	#[error("failed to decode provider response: {0}")]
	Decode(String),
}

impl ProviderError {
	/// The HTTP status associated with this error, if any
	#[must_use]
	pub fn status_code(&self) -> Option<u16> {
		match self {
			Self::Rejected { status, .. } => Some(status.as_u16()),
			Self::Unauthorized(_) => Some(StatusCode::UNAUTHORIZED.as_u16()),
			Self::Forbidden(_) => Some(StatusCode::FORBIDDEN.as_u16()),
			Self::Transient(_) | Self::Decode(_) => None,
		}
	}

	/// Whether this error says the target already exists
	#[must_use]
	pub fn is_already_exists(&self) -> bool {
		match self {
			Self::Rejected { status, code, message } => {
				*status == StatusCode::CONFLICT
					|| contains_any(code, &["duplicate", "alreadyexists", "already_exists"])
					|| contains_any(message, &["already exist", "already assigned", "duplicate"])
			}
			_ => false,
		}
	}

	/// Whether this error says the target does not exist
	#[must_use]
	pub fn is_not_found(&self) -> bool {
		match self {
			Self::Rejected { status, code, message } => {
				*status == StatusCode::NOT_FOUND
					|| contains_any(code, &["notfound", "not_found", "resourcenotfound"])
					|| contains_any(message, &["not found", "does not exist"])
			}
			_ => false,
		}
	}
}

/// Case-insensitive substring check over a list of needles
fn contains_any(haystack: &str, needles: &[&str]) -> bool {
	let haystack = haystack.to_lowercase();
	needles.iter().any(|needle| haystack.contains(needle))
}
