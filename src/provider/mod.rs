//! Directory provider clients.
//!
//! Callers depend only on [`DirectoryProvider`]; each provider has one
//! implementation that turns provider payloads into canonical entities.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use crate::{
	config::ProvidersConfig,
	credentials::ProviderCredential,
	entity::{FetchedEntity, Provider},
	error::{ProviderError, SyncError, SyncResult},
};

pub mod google;
pub mod microsoft;
mod transport;

pub use transport::RetryPolicy;

/// Partial update of a user
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserPatch {
	/// Suspend (`true`) or reactivate (`false`) the account
	pub suspended: Option<bool>,
	/// Move the user to another organizational unit or department
	pub org_unit: Option<String>,
}

/// Read and write capabilities against one external directory
#[async_trait]
pub trait DirectoryProvider: Send + Sync {
	/// Which provider this client talks to
	fn provider(&self) -> Provider;

	/// Full listing of users
	async fn list_users(&self) -> Result<Vec<FetchedEntity>, ProviderError>;

	/// Full listing of groups
	async fn list_groups(&self) -> Result<Vec<FetchedEntity>, ProviderError>;

	/// Provider IDs of the users that are direct members of a group
	async fn list_group_members(&self, group_id: &str) -> Result<Vec<String>, ProviderError>;

	/// Full listing of license SKUs
	async fn list_license_skus(&self) -> Result<Vec<FetchedEntity>, ProviderError>;

	/// Apply a partial update to a user
	async fn update_user(&self, user_id: &str, patch: &UserPatch) -> Result<(), ProviderError>;

	/// Add a user to a group
	async fn insert_group_member(&self, group_id: &str, user_id: &str)
		-> Result<(), ProviderError>;

	/// Remove a user from a group
	async fn delete_group_member(&self, group_id: &str, user_id: &str)
		-> Result<(), ProviderError>;

	/// Assign a license SKU to a user
	async fn assign_license(&self, user_id: &str, sku_id: &str) -> Result<(), ProviderError>;

	/// Remove a license SKU from a user
	async fn remove_license(&self, user_id: &str, sku_id: &str) -> Result<(), ProviderError>;
}

/// Builds provider clients from decrypted credentials
pub trait ProviderConnector: Send + Sync {
	/// Create a client for `provider` authenticated with `credential`
	fn connect(
		&self,
		provider: Provider,
		credential: ProviderCredential,
	) -> SyncResult<Arc<dyn DirectoryProvider>>;
}

/// Connector creating the HTTP clients for the real provider APIs
#[derive(Debug, Clone)]
pub struct HttpConnector {
	/// Endpoint configuration
	providers: ProvidersConfig,
	/// Retry policy shared by all clients
	retry: RetryPolicy,
	/// Shared connection pool
	client: reqwest::Client,
}

impl HttpConnector {
	/// Create a connector
	#[must_use]
	pub fn new(providers: ProvidersConfig, retry: RetryPolicy) -> Self {
		Self { providers, retry, client: reqwest::Client::new() }
	}
}

impl ProviderConnector for HttpConnector {
	fn connect(
		&self,
		provider: Provider,
		credential: ProviderCredential,
	) -> SyncResult<Arc<dyn DirectoryProvider>> {
		Ok(match provider {
			Provider::Google => Arc::new(google::GoogleDirectory::new(
				self.client.clone(),
				self.providers.google.clone(),
				self.retry.clone(),
				&credential,
			)?),
			Provider::Microsoft => Arc::new(microsoft::GraphDirectory::new(
				self.client.clone(),
				self.providers.microsoft.clone(),
				self.retry.clone(),
				&credential,
			)?),
		})
	}
}

/// Parse the provider-specific JSON document stored as a credential secret
fn parse_secret<T: for<'de> Deserialize<'de>>(
	provider: Provider,
	credential: &ProviderCredential,
) -> SyncResult<T> {
	serde_json::from_str(&credential.secret).map_err(|error| {
		SyncError::Credential(format!("malformed {provider} credential secret: {error}"))
	})
}

/// Decode a raw provider item into its typed form, keeping the raw value
fn decode_item<T: for<'de> Deserialize<'de>>(
	item: &serde_json::Value,
) -> Result<T, ProviderError> {
	serde_json::from_value(item.clone()).map_err(|error| ProviderError::Decode(error.to_string()))
}

/// Trim a string and turn blanks into `None`
fn non_blank(value: Option<String>) -> Option<String> {
	value.map(|value| value.trim().to_owned()).filter(|value| !value.is_empty())
}
