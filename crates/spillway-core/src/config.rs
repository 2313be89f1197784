//! Configuration records for identities, the pool, the rate controller,
//! and bulk operations.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Error, Result};
use crate::types::IdentityName;

/// An addressable credential with its own quota against the server.
///
/// Multiple identities may target the same endpoint; each is rate limited
/// independently by the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Stable unique name of this identity
    pub name: IdentityName,

    /// Target endpoint URL
    pub url: Url,

    /// Optional cap on concurrent checkouts for this identity.
    /// When absent the pool-wide per-identity limit applies.
    pub max_concurrent: Option<usize>,

    /// Opaque credential material consumed by the channel factory
    pub credential: serde_json::Value,
}

impl ConnectionConfig {
    /// Create an identity config with no credential material attached
    pub fn new(name: impl Into<IdentityName>, url: Url) -> Self {
        Self {
            name: name.into(),
            url,
            max_concurrent: None,
            credential: serde_json::Value::Null,
        }
    }

    /// Cap concurrent checkouts for this identity
    #[must_use]
    pub fn max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = Some(max);
        self
    }

    /// Attach opaque credential material
    #[must_use]
    pub fn credential(mut self, credential: serde_json::Value) -> Self {
        self.credential = credential;
        self
    }
}

/// Environment-level settings shared by a set of identities.
///
/// Expansion into per-identity configs is a plain copy step at load time:
/// each seed inherits the environment URL and tenant unless it carries its
/// own.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    /// Default endpoint URL for identities that do not override it
    pub url: Url,

    /// Tenant identifier copied into each identity's credential material
    pub tenant_id: Option<String>,

    /// Identity seeds to expand
    pub identities: Vec<IdentitySeed>,
}

/// One identity declaration inside an [`EnvironmentConfig`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentitySeed {
    /// Stable unique name of the identity
    pub name: IdentityName,

    /// Endpoint override; absent means the environment URL
    pub url: Option<Url>,

    /// Optional cap on concurrent checkouts
    pub max_concurrent: Option<usize>,

    /// Opaque credential material
    pub credential: serde_json::Value,
}

impl EnvironmentConfig {
    /// Expand the seeds into standalone per-identity configurations
    pub fn expand(&self) -> Vec<ConnectionConfig> {
        self.identities
            .iter()
            .map(|seed| {
                let mut credential = seed.credential.clone();
                if let (Some(tenant), serde_json::Value::Object(map)) =
                    (&self.tenant_id, &mut credential)
                {
                    map.entry("tenant_id")
                        .or_insert_with(|| serde_json::Value::String(tenant.clone()));
                }
                ConnectionConfig {
                    name: seed.name.clone(),
                    url: seed.url.clone().unwrap_or_else(|| self.url.clone()),
                    max_concurrent: seed.max_concurrent,
                    credential,
                }
            })
            .collect()
    }
}

/// Which selection strategy the pool uses to pick an identity per checkout
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategyKind {
    /// Monotonic counter over identities in insertion order
    RoundRobin,
    /// Identity with the fewest active checkouts
    LeastConnections,
    /// Round-robin over identities that are not currently throttled
    #[default]
    ThrottleAware,
}

/// Connection pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Maximum channels (idle + active) per identity
    pub max_connections_per_identity: usize,

    /// Overall channel cap; 0 derives the cap from the per-identity totals
    pub max_pool_size: usize,

    /// Idle channels kept alive through idle eviction
    pub min_pool_size: usize,

    /// How long an acquire waits for a channel before failing
    pub acquire_timeout: Duration,

    /// Idle channels older than this are evicted
    pub max_idle_time: Duration,

    /// Channels older than this are closed instead of reused
    pub max_lifetime: Duration,

    /// Minimum spacing between eviction sweeps
    pub eviction_interval: Duration,

    /// Ask the factory to disable server affinity cookies on new channels,
    /// spreading load across back-end nodes
    pub disable_affinity_cookie: bool,

    /// Identity selection strategy
    pub selection_strategy: SelectionStrategyKind,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections_per_identity: 52,
            max_pool_size: 0,
            min_pool_size: 5,
            acquire_timeout: Duration::from_secs(30),
            max_idle_time: Duration::from_secs(300),
            max_lifetime: Duration::from_secs(3600),
            eviction_interval: Duration::from_secs(30),
            disable_affinity_cookie: true,
            selection_strategy: SelectionStrategyKind::ThrottleAware,
        }
    }
}

impl PoolConfig {
    /// Start building a pool configuration from the defaults
    #[must_use]
    pub fn builder() -> PoolConfigBuilder {
        PoolConfigBuilder::new()
    }

    /// Effective overall cap for `identities` configured identities
    pub fn effective_max_pool_size(&self, identities: usize) -> usize {
        if self.max_pool_size == 0 {
            self.max_connections_per_identity * identities
        } else {
            self.max_pool_size
        }
    }
}

/// Builder for [`PoolConfig`]
#[derive(Debug, Clone)]
pub struct PoolConfigBuilder {
    config: PoolConfig,
}

impl Default for PoolConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PoolConfigBuilder {
    /// Create a builder seeded with the default configuration
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: PoolConfig::default(),
        }
    }

    /// Set the per-identity channel cap
    #[must_use]
    pub fn max_connections_per_identity(mut self, max: usize) -> Self {
        self.config.max_connections_per_identity = max;
        self
    }

    /// Set the overall channel cap (0 = derive from per-identity totals)
    #[must_use]
    pub fn max_pool_size(mut self, max: usize) -> Self {
        self.config.max_pool_size = max;
        self
    }

    /// Set the idle floor kept through eviction
    #[must_use]
    pub fn min_pool_size(mut self, min: usize) -> Self {
        self.config.min_pool_size = min;
        self
    }

    /// Set the acquire timeout
    #[must_use]
    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.config.acquire_timeout = timeout;
        self
    }

    /// Set the idle eviction threshold
    #[must_use]
    pub fn max_idle_time(mut self, max_idle: Duration) -> Self {
        self.config.max_idle_time = max_idle;
        self
    }

    /// Set the channel lifetime ceiling
    #[must_use]
    pub fn max_lifetime(mut self, max_lifetime: Duration) -> Self {
        self.config.max_lifetime = max_lifetime;
        self
    }

    /// Set the eviction sweep spacing
    #[must_use]
    pub fn eviction_interval(mut self, interval: Duration) -> Self {
        self.config.eviction_interval = interval;
        self
    }

    /// Toggle affinity-cookie suppression on new channels
    #[must_use]
    pub fn disable_affinity_cookie(mut self, disable: bool) -> Self {
        self.config.disable_affinity_cookie = disable;
        self
    }

    /// Pick the identity selection strategy
    #[must_use]
    pub fn selection_strategy(mut self, strategy: SelectionStrategyKind) -> Self {
        self.config.selection_strategy = strategy;
        self
    }

    /// Validate and produce the configuration
    pub fn build(self) -> Result<PoolConfig> {
        let config = self.config;
        if config.max_connections_per_identity == 0 {
            return Err(Error::Configuration(
                "max_connections_per_identity must be greater than 0".to_string(),
            ));
        }
        if config.acquire_timeout < Duration::from_millis(100) {
            return Err(Error::Configuration(
                "acquire_timeout must be at least 100ms".to_string(),
            ));
        }
        if config.max_lifetime < config.max_idle_time {
            return Err(Error::Configuration(
                "max_lifetime must not be shorter than max_idle_time".to_string(),
            ));
        }
        Ok(config)
    }
}

/// Tunables for the per-identity AIMD parallelism governor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptiveRateConfig {
    /// Fraction of the server DOP ceiling used on init and reset
    pub initial_factor: f64,

    /// Floor for the recommended parallelism
    pub min_parallelism: usize,

    /// Additive step applied per stabilization
    pub increase_step: usize,

    /// Multiplicative cut applied on throttle
    pub decrease_factor: f64,

    /// Successful batches required before probing higher
    pub stabilization_batches: u32,

    /// Minimum spacing between increases
    pub min_increase_interval: Duration,

    /// Increase-rate multiplier while below the last known good value
    pub recovery_multiplier: f64,

    /// Idle span after which the last-known-good baseline is stale
    pub last_known_good_ttl: Duration,

    /// Inactivity span after which identity state is fully reset
    pub idle_reset_period: Duration,
}

impl Default for AdaptiveRateConfig {
    fn default() -> Self {
        Self {
            initial_factor: 0.5,
            min_parallelism: 1,
            increase_step: 2,
            decrease_factor: 0.5,
            stabilization_batches: 3,
            min_increase_interval: Duration::from_secs(5),
            recovery_multiplier: 2.0,
            last_known_good_ttl: Duration::from_secs(300),
            idle_reset_period: Duration::from_secs(300),
        }
    }
}

/// Which classes of server-side custom logic a request bypasses
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BypassCustomLogic {
    /// Run all custom logic
    #[default]
    None,
    /// Bypass synchronous logic only
    Synchronous,
    /// Bypass asynchronous logic only
    Asynchronous,
    /// Bypass both
    All,
}

/// Options applied to one bulk operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkOperationOptions {
    /// Records per batch (the last batch may be short)
    pub batch_size: usize,

    /// Keep dispatching when individual records fail
    pub continue_on_error: bool,

    /// Custom-logic bypass selection
    pub bypass_custom_logic: BypassCustomLogic,

    /// Skip Power-Automate-style flow triggers
    pub bypass_power_automate_flows: bool,

    /// Skip server duplicate detection
    pub suppress_duplicate_detection: bool,

    /// Free-form correlation tag attached to every request
    pub tag: Option<String>,

    /// Cap on concurrently dispatched batches; `None` derives the cap
    /// from the pool's total recommended parallelism
    pub max_parallel_batches: Option<usize>,

    /// Times a batch may be re-enqueued after transient failures
    pub max_batch_attempts: u32,
}

impl Default for BulkOperationOptions {
    fn default() -> Self {
        Self {
            batch_size: 100,
            continue_on_error: true,
            bypass_custom_logic: BypassCustomLogic::None,
            bypass_power_automate_flows: false,
            suppress_duplicate_detection: false,
            tag: None,
            max_parallel_batches: None,
            max_batch_attempts: 5,
        }
    }
}

impl BulkOperationOptions {
    /// Set the batch size
    #[must_use]
    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// Toggle continue-on-error
    #[must_use]
    pub fn continue_on_error(mut self, continue_on_error: bool) -> Self {
        self.continue_on_error = continue_on_error;
        self
    }

    /// Pick the custom-logic bypass mode
    #[must_use]
    pub fn bypass_custom_logic(mut self, bypass: BypassCustomLogic) -> Self {
        self.bypass_custom_logic = bypass;
        self
    }

    /// Toggle flow-trigger bypass
    #[must_use]
    pub fn bypass_power_automate_flows(mut self, bypass: bool) -> Self {
        self.bypass_power_automate_flows = bypass;
        self
    }

    /// Toggle duplicate-detection suppression
    #[must_use]
    pub fn suppress_duplicate_detection(mut self, suppress: bool) -> Self {
        self.suppress_duplicate_detection = suppress;
        self
    }

    /// Attach a correlation tag
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    /// Cap concurrently dispatched batches
    #[must_use]
    pub fn max_parallel_batches(mut self, max: usize) -> Self {
        self.max_parallel_batches = Some(max);
        self
    }

    /// Set the per-batch re-enqueue limit
    #[must_use]
    pub fn max_batch_attempts(mut self, attempts: u32) -> Self {
        self.max_batch_attempts = attempts;
        self
    }

    /// Validate option combinations
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::Configuration(
                "batch_size must be greater than 0".to_string(),
            ));
        }
        if self.max_batch_attempts == 0 {
            return Err(Error::Configuration(
                "max_batch_attempts must be greater than 0".to_string(),
            ));
        }
        if self.max_parallel_batches == Some(0) {
            return Err(Error::Configuration(
                "max_parallel_batches must be greater than 0 when set".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn pool_config_defaults() {
        let config = PoolConfig::default();
        assert_eq!(config.max_connections_per_identity, 52);
        assert_eq!(config.max_pool_size, 0);
        assert_eq!(config.min_pool_size, 5);
        assert_eq!(config.acquire_timeout, Duration::from_secs(30));
        assert_eq!(config.max_idle_time, Duration::from_secs(300));
        assert_eq!(config.max_lifetime, Duration::from_secs(3600));
        assert!(config.disable_affinity_cookie);
        assert_eq!(config.selection_strategy, SelectionStrategyKind::ThrottleAware);
    }

    #[test]
    fn effective_pool_size_derives_from_identities() {
        let config = PoolConfig::default();
        assert_eq!(config.effective_max_pool_size(3), 156);

        let capped = PoolConfig::builder().max_pool_size(40).build().unwrap();
        assert_eq!(capped.effective_max_pool_size(3), 40);
    }

    #[test]
    fn builder_rejects_zero_per_identity_cap() {
        let result = PoolConfig::builder().max_connections_per_identity(0).build();
        assert!(matches!(result, Err(Error::Configuration(_))));
    }

    #[test]
    fn builder_rejects_lifetime_below_idle_time() {
        let result = PoolConfig::builder()
            .max_idle_time(Duration::from_secs(600))
            .max_lifetime(Duration::from_secs(60))
            .build();
        assert!(matches!(result, Err(Error::Configuration(_))));
    }

    #[test]
    fn bulk_options_defaults() {
        let options = BulkOperationOptions::default();
        assert_eq!(options.batch_size, 100);
        assert!(options.continue_on_error);
        assert_eq!(options.bypass_custom_logic, BypassCustomLogic::None);
        assert!(!options.bypass_power_automate_flows);
        assert!(!options.suppress_duplicate_detection);
        assert_eq!(options.tag, None);
        assert_eq!(options.max_parallel_batches, None);
        assert_eq!(options.max_batch_attempts, 5);
        options.validate().unwrap();
    }

    #[test]
    fn bulk_options_reject_zero_batch_size() {
        let options = BulkOperationOptions::default().batch_size(0);
        assert!(options.validate().is_err());
    }

    #[test]
    fn environment_expansion_copies_url_and_tenant() {
        let environment = EnvironmentConfig {
            url: Url::parse("https://env.example.com/api").unwrap(),
            tenant_id: Some("tenant-7".to_string()),
            identities: vec![
                IdentitySeed {
                    name: "a".to_string(),
                    url: None,
                    max_concurrent: Some(10),
                    credential: serde_json::json!({ "client_id": "one" }),
                },
                IdentitySeed {
                    name: "b".to_string(),
                    url: Some(Url::parse("https://other.example.com/api").unwrap()),
                    max_concurrent: None,
                    credential: serde_json::json!({ "client_id": "two", "tenant_id": "pinned" }),
                },
            ],
        };

        let configs = environment.expand();
        assert_eq!(configs.len(), 2);

        assert_eq!(configs[0].url.host_str(), Some("env.example.com"));
        assert_eq!(configs[0].max_concurrent, Some(10));
        assert_eq!(configs[0].credential["tenant_id"], "tenant-7");

        // Seed-level values win over the environment.
        assert_eq!(configs[1].url.host_str(), Some("other.example.com"));
        assert_eq!(configs[1].credential["tenant_id"], "pinned");
    }

    #[test]
    fn rate_config_defaults() {
        let config = AdaptiveRateConfig::default();
        assert_eq!(config.initial_factor, 0.5);
        assert_eq!(config.min_parallelism, 1);
        assert_eq!(config.increase_step, 2);
        assert_eq!(config.decrease_factor, 0.5);
        assert_eq!(config.stabilization_batches, 3);
        assert_eq!(config.min_increase_interval, Duration::from_secs(5));
        assert_eq!(config.recovery_multiplier, 2.0);
    }
}
