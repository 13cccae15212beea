//! Provider credentials per organization.
//!
//! Secrets are held encrypted by a [`SecretCipher`]; the actual symmetric
//! encryption is infrastructure and plugs in behind that trait.

use std::{collections::HashMap, fmt, sync::Arc};

use anyhow::Context;
use async_trait::async_trait;
use base64::prelude::{Engine, BASE64_STANDARD};
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::{
	entity::{OrganizationId, Provider},
	error::{SyncError, SyncResult},
};

/// Consecutive auth failures after which a credential is invalidated
pub const DEFAULT_MAX_AUTH_FAILURES: u32 = 3;

/// Opaque encrypt/decrypt capability for stored secrets
pub trait SecretCipher: Send + Sync + fmt::Debug {
	/// Encrypt a plaintext secret
	fn encrypt(&self, plaintext: &str) -> anyhow::Result<String>;
	/// Decrypt a stored secret
	fn decrypt(&self, ciphertext: &str) -> anyhow::Result<String>;
}

/// Encodes secrets as base64 without any confidentiality.
///
/// Only meant for development setups and tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlaintextCipher;

impl SecretCipher for PlaintextCipher {
	fn encrypt(&self, plaintext: &str) -> anyhow::Result<String> {
		Ok(BASE64_STANDARD.encode(plaintext))
	}

	fn decrypt(&self, ciphertext: &str) -> anyhow::Result<String> {
		let bytes = BASE64_STANDARD.decode(ciphertext).context("secret is not valid base64")?;
		String::from_utf8(bytes).context("secret is not valid UTF-8")
	}
}

/// A stored credential record
#[derive(Clone)]
pub struct Credential {
	/// Owning organization
	pub organization_id: OrganizationId,
	/// Provider the credential is for
	pub provider: Provider,
	/// Secret as produced by the store's cipher
	pub encrypted_secret: String,
	/// Admin principal the secret acts as
	pub principal_email: String,
	/// Directory domain or tenant
	pub domain: String,
	/// Cleared after repeated auth failures, set again on reconnect
	pub is_valid: bool,
	/// Why the credential was invalidated
	pub invalid_reason: Option<String>,
	/// Last time a run authenticated successfully with it
	pub last_validated_at: Option<DateTime<Utc>>,
	/// Auth failures since the last success
	pub consecutive_auth_failures: u32,
}

impl fmt::Debug for Credential {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Credential")
			.field("organization_id", &self.organization_id)
			.field("provider", &self.provider)
			.field("encrypted_secret", &"***")
			.field("principal_email", &self.principal_email)
			.field("domain", &self.domain)
			.field("is_valid", &self.is_valid)
			.field("invalid_reason", &self.invalid_reason)
			.field("last_validated_at", &self.last_validated_at)
			.finish()
	}
}

/// A decrypted credential handed to provider clients
#[derive(Clone)]
pub struct ProviderCredential {
	/// Decrypted secret; its format is provider-specific
	pub secret: String,
	/// Admin principal
	pub principal: String,
	/// Directory domain or tenant
	pub domain: String,
}

impl fmt::Debug for ProviderCredential {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("ProviderCredential")
			.field("secret", &"***")
			.field("principal", &self.principal)
			.field("domain", &self.domain)
			.finish()
	}
}

/// Credential persistence and lifecycle
#[async_trait]
pub trait CredentialStore: Send + Sync {
	/// Connect or reconnect a provider, replacing any previous credential
	async fn store(
		&self,
		organization_id: &OrganizationId,
		provider: Provider,
		credential: ProviderCredential,
	) -> SyncResult<()>;

	/// Load and decrypt a credential. Returns `Ok(None)` when the provider
	/// was never connected and a [`SyncError::Credential`] when it was
	/// invalidated.
	async fn load(
		&self,
		organization_id: &OrganizationId,
		provider: Provider,
	) -> SyncResult<Option<ProviderCredential>>;

	/// Mark a credential invalid without deleting it
	async fn invalidate(
		&self,
		organization_id: &OrganizationId,
		provider: Provider,
		reason: &str,
	) -> SyncResult<()>;

	/// Record a successful authentication
	async fn mark_validated(
		&self,
		organization_id: &OrganizationId,
		provider: Provider,
	) -> SyncResult<()>;

	/// Record a failed authentication. Returns whether this failure
	/// invalidated the credential.
	async fn record_auth_failure(
		&self,
		organization_id: &OrganizationId,
		provider: Provider,
		reason: &str,
	) -> SyncResult<bool>;
}

/// Credential store keeping encrypted records in memory
#[derive(Debug)]
pub struct MemoryCredentialStore {
	/// Cipher for secrets at rest
	cipher: Arc<dyn SecretCipher>,
	/// Records by organization and provider
	credentials: RwLock<HashMap<(OrganizationId, Provider), Credential>>,
	/// Consecutive failures before invalidation
	max_auth_failures: u32,
}

impl MemoryCredentialStore {
	/// Create an empty store
	pub fn new(cipher: Arc<dyn SecretCipher>) -> Self {
		Self {
			cipher,
			credentials: RwLock::new(HashMap::new()),
			max_auth_failures: DEFAULT_MAX_AUTH_FAILURES,
		}
	}

	/// Override how many consecutive auth failures invalidate a credential
	#[must_use]
	pub fn with_max_auth_failures(mut self, max_auth_failures: u32) -> Self {
		self.max_auth_failures = max_auth_failures.max(1);
		self
	}

	/// The stored record, secret still encrypted
	pub async fn record(
		&self,
		organization_id: &OrganizationId,
		provider: Provider,
	) -> Option<Credential> {
		self.credentials.read().await.get(&(organization_id.clone(), provider)).cloned()
	}
}

/// Error for operations on a credential that was never stored
fn missing(organization_id: &OrganizationId, provider: Provider) -> SyncError {
	SyncError::Credential(format!("no {provider} credential for organization {organization_id}"))
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
	async fn store(
		&self,
		organization_id: &OrganizationId,
		provider: Provider,
		credential: ProviderCredential,
	) -> SyncResult<()> {
		let encrypted_secret = self
			.cipher
			.encrypt(&credential.secret)
			.map_err(|error| SyncError::Credential(format!("failed to encrypt secret: {error:#}")))?;
		let record = Credential {
			organization_id: organization_id.clone(),
			provider,
			encrypted_secret,
			principal_email: credential.principal,
			domain: credential.domain,
			is_valid: true,
			invalid_reason: None,
			last_validated_at: None,
			consecutive_auth_failures: 0,
		};
		self.credentials.write().await.insert((organization_id.clone(), provider), record);
		tracing::info!(%organization_id, %provider, "Stored provider credential");
		Ok(())
	}

	async fn load(
		&self,
		organization_id: &OrganizationId,
		provider: Provider,
	) -> SyncResult<Option<ProviderCredential>> {
		let Some(record) = self.record(organization_id, provider).await else {
			return Ok(None);
		};
		if !record.is_valid {
			return Err(SyncError::Credential(format!(
				"{provider} credential for organization {organization_id} is invalid: {}",
				record.invalid_reason.as_deref().unwrap_or("unknown reason")
			)));
		}
		let secret = self
			.cipher
			.decrypt(&record.encrypted_secret)
			.map_err(|error| SyncError::Credential(format!("failed to decrypt secret: {error:#}")))?;
		Ok(Some(ProviderCredential {
			secret,
			principal: record.principal_email,
			domain: record.domain,
		}))
	}

	async fn invalidate(
		&self,
		organization_id: &OrganizationId,
		provider: Provider,
		reason: &str,
	) -> SyncResult<()> {
		let mut credentials = self.credentials.write().await;
		let record = credentials
			.get_mut(&(organization_id.clone(), provider))
			.ok_or_else(|| missing(organization_id, provider))?;
		record.is_valid = false;
		record.invalid_reason = Some(reason.to_owned());
		tracing::warn!(%organization_id, %provider, reason, "Invalidated provider credential");
		Ok(())
	}

	async fn mark_validated(
		&self,
		organization_id: &OrganizationId,
		provider: Provider,
	) -> SyncResult<()> {
		let mut credentials = self.credentials.write().await;
		let record = credentials
			.get_mut(&(organization_id.clone(), provider))
			.ok_or_else(|| missing(organization_id, provider))?;
		record.last_validated_at = Some(Utc::now());
		record.consecutive_auth_failures = 0;
		Ok(())
	}

	async fn record_auth_failure(
		&self,
		organization_id: &OrganizationId,
		provider: Provider,
		reason: &str,
	) -> SyncResult<bool> {
		let failures = {
			let mut credentials = self.credentials.write().await;
			let record = credentials
				.get_mut(&(organization_id.clone(), provider))
				.ok_or_else(|| missing(organization_id, provider))?;
			record.consecutive_auth_failures += 1;
			record.consecutive_auth_failures
		};
		if failures >= self.max_auth_failures {
			self.invalidate(organization_id, provider, reason).await?;
			return Ok(true);
		}
		tracing::warn!(%organization_id, %provider, failures, "Provider rejected credential");
		Ok(false)
	}
}

#[cfg(test)]
mod tests {
	#![allow(clippy::expect_used, clippy::unwrap_used)]

	use super::*;

	fn org() -> OrganizationId {
		OrganizationId::new("org1")
	}

	fn credential() -> ProviderCredential {
		ProviderCredential {
			secret: r#"{"client_id":"id","client_secret":"hunter2"}"#.to_owned(),
			principal: "admin@example.com".to_owned(),
			domain: "example.com".to_owned(),
		}
	}

	#[tokio::test]
	async fn test_secret_is_stored_encrypted() {
		let store = MemoryCredentialStore::new(Arc::new(PlaintextCipher));
		store.store(&org(), Provider::Microsoft, credential()).await.unwrap();

		let record = store.record(&org(), Provider::Microsoft).await.expect("record missing");
		assert_ne!(record.encrypted_secret, credential().secret);
		assert!(!format!("{record:?}").contains("hunter2"));

		let loaded = store.load(&org(), Provider::Microsoft).await.unwrap().expect("not loaded");
		assert_eq!(loaded.secret, credential().secret);
		assert_eq!(loaded.domain, "example.com");
	}

	#[tokio::test]
	async fn test_load_missing_credential() {
		let store = MemoryCredentialStore::new(Arc::new(PlaintextCipher));
		assert!(store.load(&org(), Provider::Google).await.unwrap().is_none());
	}

	#[tokio::test]
	async fn test_repeated_auth_failures_invalidate() {
		let store = MemoryCredentialStore::new(Arc::new(PlaintextCipher)).with_max_auth_failures(2);
		store.store(&org(), Provider::Google, credential()).await.unwrap();

		assert!(!store.record_auth_failure(&org(), Provider::Google, "401").await.unwrap());
		assert!(store.record_auth_failure(&org(), Provider::Google, "401").await.unwrap());

		let error = store.load(&org(), Provider::Google).await.expect_err("credential still valid");
		assert!(error.is_credential_error());
		let record = store.record(&org(), Provider::Google).await.expect("record was deleted");
		assert_eq!(record.invalid_reason.as_deref(), Some("401"));

		store.store(&org(), Provider::Google, credential()).await.unwrap();
		assert!(store.load(&org(), Provider::Google).await.unwrap().is_some());
	}

	#[tokio::test]
	async fn test_success_resets_failure_count() {
		let store = MemoryCredentialStore::new(Arc::new(PlaintextCipher)).with_max_auth_failures(2);
		store.store(&org(), Provider::Google, credential()).await.unwrap();

		store.record_auth_failure(&org(), Provider::Google, "401").await.unwrap();
		store.mark_validated(&org(), Provider::Google).await.unwrap();
		assert!(!store.record_auth_failure(&org(), Provider::Google, "401").await.unwrap());

		let record = store.record(&org(), Provider::Google).await.unwrap();
		assert!(record.is_valid);
		assert!(record.last_validated_at.is_some());
	}
}
