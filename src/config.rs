//! Runtime configuration with TOML file support.
//!
//! Every field has a default, so an empty file (or no file) is a valid
//! configuration. Durations are in milliseconds.

use crate::domain::split::RemainderPolicy;
use crate::error::{DivisionError, Result};
use crate::infrastructure::channels::FinalizeMode;
use crate::logging::LogFormat;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub engine: EngineConfig,
    pub reconcile: ReconcileConfig,
    pub registry: RegistryConfig,
    pub sandbox: SandboxSettings,
    pub log: LogConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Upper bound on any single channel call.
    #[serde(default = "default_channel_timeout_ms")]
    pub channel_timeout_ms: u64,

    #[serde(default)]
    pub remainder: RemainderPolicy,

    /// Fail orders that have no active receivers instead of finalizing them.
    #[serde(default)]
    pub require_receivers: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconcileConfig {
    /// Batches younger than this are left alone by sweeps.
    #[serde(default = "default_grace_ms")]
    pub grace_ms: u64,

    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Inconclusive queries before a batch goes to manual review.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_page_size")]
    pub page_size: usize,

    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Zero disables the cache.
    #[serde(default = "default_cache_ttl_ms")]
    pub cache_ttl_ms: u64,
}

/// Behaviour of the in-process channel used by the CLI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxSettings {
    #[serde(default)]
    pub finalize_mode: FinalizeMode,

    #[serde(default = "default_true")]
    pub native_idempotency: bool,

    #[serde(default)]
    pub confirm_later: bool,

    #[serde(default)]
    pub rejected_accounts: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default)]
    pub format: LogFormat,

    /// Filter directive, e.g. `"info"` or `"warn,paysplit=debug"`.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_channel_timeout_ms() -> u64 {
    5_000
}

fn default_grace_ms() -> u64 {
    30_000
}

fn default_base_backoff_ms() -> u64 {
    5_000
}

fn default_max_backoff_ms() -> u64 {
    600_000
}

fn default_max_attempts() -> u32 {
    10
}

fn default_page_size() -> usize {
    100
}

fn default_sweep_interval_ms() -> u64 {
    10_000
}

fn default_cache_ttl_ms() -> u64 {
    30_000
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            channel_timeout_ms: default_channel_timeout_ms(),
            remainder: RemainderPolicy::default(),
            require_receivers: false,
        }
    }
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            grace_ms: default_grace_ms(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            max_attempts: default_max_attempts(),
            page_size: default_page_size(),
            sweep_interval_ms: default_sweep_interval_ms(),
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            cache_ttl_ms: default_cache_ttl_ms(),
        }
    }
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            finalize_mode: FinalizeMode::default(),
            native_idempotency: true,
            confirm_later: false,
            rejected_accounts: Vec::new(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::default(),
            level: default_log_level(),
        }
    }
}

impl EngineConfig {
    pub fn channel_timeout(&self) -> Duration {
        Duration::from_millis(self.channel_timeout_ms)
    }
}

impl ReconcileConfig {
    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    /// Wait before the next query after `attempts` inconclusive ones:
    /// zero before the first, then `base * 2^(attempts - 1)` capped at the
    /// maximum.
    pub fn backoff(&self, attempts: u32) -> Duration {
        if attempts == 0 {
            return Duration::ZERO;
        }
        let factor = 1u64.checked_shl(attempts - 1).unwrap_or(u64::MAX);
        let millis = self
            .base_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        Duration::from_millis(millis)
    }
}

impl AppConfig {
    /// Loads the configuration from `path`, or the defaults when no path is
    /// given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_toml_str(&std::fs::read_to_string(path)?),
            None => Ok(Self::default()),
        }
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.engine.channel_timeout_ms == 0 {
            return Err(DivisionError::ConfigError(
                "engine.channel_timeout_ms must be positive".to_string(),
            ));
        }
        if self.reconcile.max_attempts == 0 {
            return Err(DivisionError::ConfigError(
                "reconcile.max_attempts must be positive".to_string(),
            ));
        }
        if self.reconcile.page_size == 0 {
            return Err(DivisionError::ConfigError(
                "reconcile.page_size must be positive".to_string(),
            ));
        }
        if self.reconcile.sweep_interval_ms == 0 {
            return Err(DivisionError::ConfigError(
                "reconcile.sweep_interval_ms must be positive".to_string(),
            ));
        }
        if self.reconcile.base_backoff_ms > self.reconcile.max_backoff_ms {
            return Err(DivisionError::ConfigError(format!(
                "reconcile.base_backoff_ms ({}) exceeds max_backoff_ms ({})",
                self.reconcile.base_backoff_ms, self.reconcile.max_backoff_ms
            )));
        }
        Ok(())
    }
}
