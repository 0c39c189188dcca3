//! Configuration management for Gatekeeper.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{GatekeeperError, Result};
use crate::ratelimit::PlanTable;

/// Prefix of environment variable overrides, e.g. `GATEKEEPER__BACKEND__TIMEOUT_MS`.
pub const ENV_PREFIX: &str = "GATEKEEPER";

/// Main configuration for the Gatekeeper admission controller.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatekeeperConfig {
    /// Bucket sizes per plan
    #[serde(default)]
    pub plans: PlanTable,

    /// Shared store configuration
    #[serde(default)]
    pub backend: BackendConfig,

    /// In-process fallback store configuration
    #[serde(default)]
    pub local: LocalConfig,

    /// Tenant metadata extraction
    #[serde(default)]
    pub tenant: TenantConfig,

    /// Log output
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Shared (Redis) backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Redis URL; when unset only the local backend is used
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Response timeout for any single store call
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Records expire after this long without activity
    #[serde(default = "default_idle_ttl_secs")]
    pub idle_ttl_secs: u64,

    /// After a failed connect, calls fall back without reconnecting for this long
    #[serde(default = "default_reconnect_cooldown_ms")]
    pub reconnect_cooldown_ms: u64,

    /// Prepended to every scope key
    #[serde(default)]
    pub key_prefix: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            timeout_ms: default_timeout_ms(),
            idle_ttl_secs: default_idle_ttl_secs(),
            reconnect_cooldown_ms: default_reconnect_cooldown_ms(),
            key_prefix: String::new(),
        }
    }
}

fn default_timeout_ms() -> u64 {
    200
}

fn default_idle_ttl_secs() -> u64 {
    3600
}

fn default_reconnect_cooldown_ms() -> u64 {
    1000
}

/// Local backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalConfig {
    /// Buckets idle this long are evicted
    #[serde(default = "default_idle_ttl_secs")]
    pub idle_ttl_secs: u64,

    /// How often the eviction sweep runs
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            idle_ttl_secs: default_idle_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

fn default_sweep_interval_secs() -> u64 {
    60
}

/// Which request headers carry tenant identity, and what to assume when they don't.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantConfig {
    /// Organization id headers, first non-empty wins
    #[serde(default = "default_organization_headers")]
    pub organization_headers: Vec<String>,

    /// Region header
    #[serde(default = "default_region_header")]
    pub region_header: String,

    /// Plan headers, first non-empty wins
    #[serde(default = "default_plan_headers")]
    pub plan_headers: Vec<String>,

    #[serde(default = "default_organization")]
    pub default_organization: String,

    #[serde(default = "default_region")]
    pub default_region: String,
}

impl Default for TenantConfig {
    fn default() -> Self {
        Self {
            organization_headers: default_organization_headers(),
            region_header: default_region_header(),
            plan_headers: default_plan_headers(),
            default_organization: default_organization(),
            default_region: default_region(),
        }
    }
}

fn default_organization_headers() -> Vec<String> {
    vec![
        "x-organization-id".to_string(),
        "x-org-id".to_string(),
        "x-tenant-id".to_string(),
    ]
}

fn default_region_header() -> String {
    "x-region".to_string()
}

fn default_plan_headers() -> Vec<String> {
    vec!["x-plan".to_string(), "x-tier".to_string()]
}

fn default_organization() -> String {
    "anonymous".to_string()
}

fn default_region() -> String {
    "global".to_string()
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl GatekeeperConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: GatekeeperConfig = serde_yaml::from_str(yaml)
            .map_err(|e| GatekeeperError::Config(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from an optional YAML file with environment overrides.
    ///
    /// Variables look like `GATEKEEPER__BACKEND__REDIS_URL`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration");
            builder = builder.add_source(::config::File::from(path).required(true));
        }

        let config: GatekeeperConfig = builder
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| GatekeeperError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints serde cannot express.
    pub fn validate(&self) -> Result<()> {
        self.plans.validate()?;

        if self.backend.timeout_ms == 0 {
            return Err(GatekeeperError::Config(
                "backend.timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.local.sweep_interval_secs == 0 {
            return Err(GatekeeperError::Config(
                "local.sweep_interval_secs must be greater than zero".to_string(),
            ));
        }

        // An evicted bucket comes back full, which is only sound if it would
        // have refilled completely during the idle period anyway.
        if let Some(refill_ms) = self.plans.max_full_refill_ms() {
            for (name, ttl_secs) in [
                ("backend.idle_ttl_secs", self.backend.idle_ttl_secs),
                ("local.idle_ttl_secs", self.local.idle_ttl_secs),
            ] {
                if ttl_secs.saturating_mul(1000) < refill_ms {
                    return Err(GatekeeperError::Config(format!(
                        "{} ({}s) is shorter than the slowest bucket refill ({}ms)",
                        name, ttl_secs, refill_ms
                    )));
                }
            }
        }

        Ok(())
    }
}
