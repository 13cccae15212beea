//! Service configuration.
//!
//! Loaded from a YAML file, with any key overridable through
//! `DIRECTORY_SYNC__`-prefixed environment variables (nested keys are
//! separated by `__`, e.g. `DIRECTORY_SYNC__BATCH__BATCH_SIZE`).

use std::{
	fmt,
	path::{Path, PathBuf},
	time::Duration,
};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::{
	credentials::{ProviderCredential, DEFAULT_MAX_AUTH_FAILURES},
	dispatch::BatchOptions,
	entity::{OrganizationId, Provider},
	provider::{google::GoogleConfig, microsoft::MicrosoftConfig, RetryPolicy},
};

/// Prefix of environment variable overrides
const ENV_PREFIX: &str = "DIRECTORY_SYNC";

/// Top-level configuration
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Config {
	/// Maximum tracing level, `INFO` when unset
	pub log_level: Option<String>,
	/// Local entity store
	#[serde(default)]
	pub store: StoreConfig,
	/// Periodic sync scheduling
	#[serde(default)]
	pub scheduler: SchedulerConfig,
	/// Bulk dispatch rate limits
	#[serde(default)]
	pub batch: BatchConfig,
	/// Transport retries and credential failure threshold
	#[serde(default)]
	pub retry: RetryConfig,
	/// Provider API endpoints
	#[serde(default)]
	pub providers: ProvidersConfig,
	/// Organizations to keep in sync
	#[serde(default)]
	pub organizations: Vec<OrganizationConfig>,
	/// Optional behavior switches
	#[serde(default)]
	pub feature_flags: FeatureFlags,
}

impl Config {
	/// Load the configuration file at `path` and apply environment overrides
	pub fn new(path: &Path) -> Result<Self> {
		config::Config::builder()
			.add_source(config::File::from(path).required(false))
			.add_source(
				config::Environment::with_prefix(ENV_PREFIX)
					.separator("__")
					.try_parsing(true),
			)
			.build()
			.context("Failed to read configuration")?
			.try_deserialize()
			.context("Failed to parse configuration")
	}
}

/// Local entity store settings
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct StoreConfig {
	/// Snapshot file; the store is memory-only when unset
	pub snapshot_path: Option<PathBuf>,
}

/// Scheduler settings
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SchedulerConfig {
	/// Keep running and sync periodically; when disabled every configured
	/// connection is synced once and the process exits
	pub enabled: bool,
	/// Seconds between two scheduled runs of an organization
	pub interval_secs: u64,
	/// Sync each organization right away instead of after one interval
	pub run_on_start: bool,
}

impl Default for SchedulerConfig {
	fn default() -> Self {
		Self { enabled: true, interval_secs: 3600, run_on_start: true }
	}
}

impl SchedulerConfig {
	/// Time between two scheduled runs
	#[must_use]
	pub fn interval(&self) -> Duration {
		Duration::from_secs(self.interval_secs.max(1))
	}
}

/// Bulk dispatch settings
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BatchConfig {
	/// Operations per batch
	pub batch_size: usize,
	/// Pause between batches
	pub inter_batch_delay_ms: u64,
	/// Offset between operations of one batch
	pub per_item_stagger_ms: u64,
	/// Typical provider round trip used for estimates
	pub expected_call_latency_ms: u64,
}

impl Default for BatchConfig {
	fn default() -> Self {
		Self {
			batch_size: 50,
			inter_batch_delay_ms: 1000,
			per_item_stagger_ms: 50,
			expected_call_latency_ms: 250,
		}
	}
}

impl From<&BatchConfig> for BatchOptions {
	fn from(config: &BatchConfig) -> Self {
		Self {
			batch_size: config.batch_size.max(1),
			inter_batch_delay: Duration::from_millis(config.inter_batch_delay_ms),
			per_item_stagger: Duration::from_millis(config.per_item_stagger_ms),
			expected_call_latency: Duration::from_millis(config.expected_call_latency_ms),
		}
	}
}

/// Retry and failure threshold settings
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetryConfig {
	/// Attempts per provider call, including the first
	pub max_attempts: u32,
	/// Backoff before the first retry, doubled for every further one
	pub base_delay_ms: u64,
	/// Consecutive auth failures after which a credential is invalidated
	pub max_auth_failures: u32,
}

impl Default for RetryConfig {
	fn default() -> Self {
		Self { max_attempts: 3, base_delay_ms: 500, max_auth_failures: DEFAULT_MAX_AUTH_FAILURES }
	}
}

impl From<&RetryConfig> for RetryPolicy {
	fn from(config: &RetryConfig) -> Self {
		Self {
			max_attempts: config.max_attempts.max(1),
			base_delay: Duration::from_millis(config.base_delay_ms),
		}
	}
}

/// API endpoints of all providers
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProvidersConfig {
	/// Google Workspace endpoints
	pub google: GoogleConfig,
	/// Microsoft Graph endpoints
	pub microsoft: MicrosoftConfig,
}

/// An organization and its connected providers
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct OrganizationConfig {
	/// Organization ID
	pub id: OrganizationId,
	/// Provider connections seeded into the credential store at startup
	#[serde(default)]
	pub connections: Vec<ConnectionConfig>,
}

impl OrganizationConfig {
	/// Providers this organization is connected to
	#[must_use]
	pub fn providers(&self) -> Vec<Provider> {
		self.connections.iter().map(|connection| connection.provider).collect()
	}
}

/// A provider connection of an organization
#[derive(Clone, Deserialize, PartialEq, Eq)]
pub struct ConnectionConfig {
	/// Provider to connect
	pub provider: Provider,
	/// Admin principal the secret acts as
	pub principal: String,
	/// Directory domain or tenant ID
	pub domain: String,
	/// Provider-specific secret, either a JSON document or a string
	/// holding one
	pub secret: serde_json::Value,
}

impl ConnectionConfig {
	/// The connection as a credential for the credential store
	#[must_use]
	pub fn credential(&self) -> ProviderCredential {
		let secret = match &self.secret {
			serde_json::Value::String(secret) => secret.clone(),
			other => other.to_string(),
		};
		ProviderCredential { secret, principal: self.principal.clone(), domain: self.domain.clone() }
	}
}

impl fmt::Debug for ConnectionConfig {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("ConnectionConfig")
			.field("provider", &self.provider)
			.field("principal", &self.principal)
			.field("domain", &self.domain)
			.field("secret", &"***")
			.finish()
	}
}

/// Optional behavior switches
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FeatureFlag {
	/// Read from providers and log what would change, without writing to
	/// the store or the provider
	DryRun,
}

/// Set of enabled feature flags
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct FeatureFlags(Vec<FeatureFlag>);

impl FeatureFlags {
	/// Whether `flag` is enabled
	#[must_use]
	pub fn is_enabled(&self, flag: FeatureFlag) -> bool {
		self.0.contains(&flag)
	}
}

impl From<Vec<FeatureFlag>> for FeatureFlags {
	fn from(flags: Vec<FeatureFlag>) -> Self {
		Self(flags)
	}
}
