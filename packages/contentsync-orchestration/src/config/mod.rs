//! Engine configuration
//!
//! Loaded from a versioned YAML file, then adjusted by environment
//! overrides, then validated.
//!
//! ```yaml
//! version: 1
//! environment: live
//! queue:
//!   name: contentsync.indexing
//!   max_deliveries: 5
//! forwarder:
//!   workers: 4
//!   drain_timeout_ms: 30000
//! reconcile:
//!   batch_size: 500
//! engine:
//!   type: solr
//!   url: http://localhost:8983
//!   username: indexer
//!   password: secret
//! ledger:
//!   path: /var/lib/contentsync/ledger.db
//! sites:
//!   - name: docs
//!     locales: [en, pt]
//!   - name: intranet
//! ```

pub mod error;

pub use error::{ConfigError, ConfigResult};

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

pub const CONFIG_VERSION: u32 = 1;

pub const ENV_ENGINE_URL: &str = "CONTENTSYNC_ENGINE_URL";
pub const ENV_ENGINE_TYPE: &str = "CONTENTSYNC_ENGINE_TYPE";
pub const ENV_LEDGER_PATH: &str = "CONTENTSYNC_LEDGER_PATH";
pub const ENV_WORKERS: &str = "CONTENTSYNC_WORKERS";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncConfig {
    pub version: u32,

    /// Environment stamped on job items that carry none
    #[serde(default = "default_environment")]
    pub environment: String,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub forwarder: ForwarderConfig,

    #[serde(default)]
    pub reconcile: ReconcileConfig,

    pub engine: EngineConfig,

    #[serde(default)]
    pub ledger: LedgerConfig,

    /// Configured targets; items for any other site are ignored
    #[serde(default)]
    pub sites: Vec<SiteConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueueConfig {
    #[serde(default = "default_queue_name")]
    pub name: String,
    /// Deliveries of one batch before it is dead-lettered
    #[serde(default = "default_max_deliveries")]
    pub max_deliveries: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ForwarderConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// How long `finish_session` waits for in-flight batches
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReconcileConfig {
    #[serde(default = "default_reconcile_batch_size")]
    pub batch_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// Engine plugin key (`solr`, `elasticsearch`, `memory`)
    #[serde(rename = "type")]
    pub engine_type: String,
    #[serde(default)]
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default = "default_engine_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LedgerConfig {
    /// SQLite file; absent means an in-memory ledger
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SiteConfig {
    pub name: String,
    /// Accepted locales; empty accepts any locale
    #[serde(default)]
    pub locales: Vec<String>,
}

impl SiteConfig {
    pub fn new(name: impl Into<String>, locales: &[&str]) -> Self {
        Self {
            name: name.into(),
            locales: locales.iter().map(|l| l.to_string()).collect(),
        }
    }

    pub fn accepts_locale(&self, locale: &str) -> bool {
        self.locales.is_empty() || self.locales.iter().any(|l| l == locale)
    }
}

fn default_environment() -> String {
    "default".to_string()
}

fn default_queue_name() -> String {
    "contentsync.indexing".to_string()
}

fn default_max_deliveries() -> u32 {
    5
}

fn default_workers() -> usize {
    (num_cpus::get() / 2).max(1)
}

fn default_drain_timeout_ms() -> u64 {
    30_000
}

fn default_reconcile_batch_size() -> usize {
    500
}

fn default_engine_timeout_ms() -> u64 {
    30_000
}

fn default_cache_capacity() -> u64 {
    10_000
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: default_queue_name(),
            max_deliveries: default_max_deliveries(),
        }
    }
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            drain_timeout_ms: default_drain_timeout_ms(),
        }
    }
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            batch_size: default_reconcile_batch_size(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            engine_type: "memory".to_string(),
            url: String::new(),
            username: None,
            password: None,
            api_key: None,
            timeout_ms: default_engine_timeout_ms(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            environment: default_environment(),
            queue: QueueConfig::default(),
            forwarder: ForwarderConfig::default(),
            reconcile: ReconcileConfig::default(),
            engine: EngineConfig::default(),
            ledger: LedgerConfig {
                path: None,
                cache_capacity: default_cache_capacity(),
            },
            sites: Vec::new(),
        }
    }
}

impl SyncConfig {
    /// Load, apply environment overrides, validate
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config = Self::from_yaml_str(&content)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse YAML (version-checked, not validated)
    pub fn from_yaml_str(content: &str) -> ConfigResult<Self> {
        let raw: serde_yaml::Value = serde_yaml::from_str(content)?;

        let version = raw
            .get("version")
            .and_then(serde_yaml::Value::as_u64)
            .ok_or(ConfigError::MissingVersion)?;
        if version != u64::from(CONFIG_VERSION) {
            return Err(ConfigError::UnsupportedVersion {
                found: version as u32,
                supported: vec![CONFIG_VERSION],
            });
        }

        Ok(serde_yaml::from_value(raw)?)
    }

    pub fn to_yaml(&self) -> ConfigResult<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn apply_env_overrides(&mut self) -> ConfigResult<()> {
        self.apply_overrides_from(|var| std::env::var(var).ok())
    }

    /// Apply overrides from any variable lookup
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> ConfigResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(ENV_ENGINE_URL) {
            self.engine.url = url;
        }
        if let Some(engine_type) = lookup(ENV_ENGINE_TYPE) {
            self.engine.engine_type = engine_type;
        }
        if let Some(path) = lookup(ENV_LEDGER_PATH) {
            self.ledger.path = Some(PathBuf::from(path));
        }
        if let Some(workers) = lookup(ENV_WORKERS) {
            self.forwarder.workers = workers.parse().map_err(|_| ConfigError::Env {
                var: ENV_WORKERS.to_string(),
                value: workers.clone(),
            })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.environment.trim().is_empty() {
            return Err(ConfigError::invalid("environment", "must not be empty"));
        }
        if self.queue.name.trim().is_empty() {
            return Err(ConfigError::invalid("queue.name", "must not be empty"));
        }
        if !(1..=100).contains(&self.queue.max_deliveries) {
            return Err(ConfigError::range_with_hint(
                "queue.max_deliveries",
                self.queue.max_deliveries,
                1,
                100,
                "A batch is dead-lettered after this many deliveries.",
            ));
        }
        if !(1..=256).contains(&self.forwarder.workers) {
            return Err(ConfigError::range_with_hint(
                "forwarder.workers",
                self.forwarder.workers,
                1,
                256,
                "Use roughly one worker per core.",
            ));
        }
        if !(1..=10_000).contains(&self.reconcile.batch_size) {
            return Err(ConfigError::range_with_hint(
                "reconcile.batch_size",
                self.reconcile.batch_size,
                1,
                10_000,
                "Deletes are forwarded in chunks of this size.",
            ));
        }
        if self.engine.engine_type != "memory" && self.engine.url.trim().is_empty() {
            return Err(ConfigError::invalid(
                "engine.url",
                format!("required for engine type '{}'", self.engine.engine_type),
            ));
        }
        if self.engine.username.is_some() != self.engine.password.is_some() {
            return Err(ConfigError::invalid(
                "engine.username",
                "username and password must be set together",
            ));
        }

        let mut seen = HashSet::new();
        for site in &self.sites {
            if site.name.trim().is_empty() {
                return Err(ConfigError::invalid("sites.name", "must not be empty"));
            }
            if !seen.insert(site.name.as_str()) {
                return Err(ConfigError::invalid(
                    "sites.name",
                    format!("duplicate site '{}'", site.name),
                ));
            }
        }

        Ok(())
    }
}
