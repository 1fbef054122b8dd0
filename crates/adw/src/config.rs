//! Configuration file support (`adw.toml`).
//!
//! Layering: built-in defaults, overridden by `adw.toml` if present,
//! overridden by environment variables, overridden last by explicit CLI
//! flags.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use adw_retry::{PerErrorConfig, RetryPolicy, RetryStrategyType};
use adw_types::{PhaseName, deserialize_duration, serialize_duration};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub policy: RetryPolicy,
    pub max_attempts: u32,
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub base_delay: Duration,
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub max_delay: Duration,
    pub strategy: RetryStrategyType,
    pub jitter: f64,
    pub per_error: PerErrorConfig,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            policy: RetryPolicy::Default,
            max_attempts: default_max_external_attempts(),
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            strategy: RetryStrategyType::Exponential,
            jitter: 0.5,
            per_error: PerErrorConfig::default(),
        }
    }
}

/// Port pools and worktree placement. Defaults match §3's fixed ranges.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourcesSection {
    pub backend_port_start: u16,
    pub backend_port_end: u16,
    pub frontend_port_start: u16,
    pub frontend_port_end: u16,
    pub worktree_base_dir: PathBuf,
    pub max_concurrent_runs: u32,
}

impl Default for ResourcesSection {
    fn default() -> Self {
        Self {
            backend_port_start: *adw_types::BACKEND_PORT_RANGE.start(),
            backend_port_end: *adw_types::BACKEND_PORT_RANGE.end(),
            frontend_port_start: *adw_types::FRONTEND_PORT_RANGE.start(),
            frontend_port_end: *adw_types::FRONTEND_PORT_RANGE.end(),
            worktree_base_dir: PathBuf::from(".adw/worktrees"),
            max_concurrent_runs: default_max_concurrent_runs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookSection {
    /// HMAC secret used to verify inbound `/intake` and `/workflow-complete` requests.
    /// Resolved from `ADW_WEBHOOK_SECRET` if left blank here.
    pub secret: String,
    pub signature_header: String,
    pub bind_addr: String,
}

impl Default for WebhookSection {
    fn default() -> Self {
        Self {
            secret: String::new(),
            signature_header: adw_webhook_crypto::SIGNATURE_HEADER.to_string(),
            bind_addr: "127.0.0.1:8080".to_string(),
        }
    }
}

/// Per-phase timeout overrides, keyed by phase name. Any phase absent from
/// this map falls back to `default_secs`, clamped to `[min_secs, u64::MAX]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutsSection {
    pub default_secs: u64,
    pub min_secs: u64,
    #[serde(default)]
    pub overrides: BTreeMap<String, u64>,
}

impl Default for TimeoutsSection {
    fn default() -> Self {
        Self {
            default_secs: 600,
            min_secs: 5,
            overrides: BTreeMap::new(),
        }
    }
}

impl TimeoutsSection {
    pub fn for_phase(&self, phase: PhaseName) -> Duration {
        let key = format!("{phase:?}").to_lowercase();
        let secs = self
            .overrides
            .get(&key)
            .copied()
            .unwrap_or(self.default_secs)
            .max(self.min_secs);
        Duration::from_secs(secs)
    }
}

fn default_max_phase_retry_attempts() -> u32 {
    3
}

fn default_max_external_attempts() -> u32 {
    3
}

fn default_max_identical_error_repeats() -> u32 {
    4
}

fn default_max_concurrent_runs() -> u32 {
    4
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdwConfig {
    pub retry: RetrySection,
    pub resources: ResourcesSection,
    pub webhook: WebhookSection,
    pub timeouts: TimeoutsSection,
    #[serde(default = "default_max_phase_retry_attempts")]
    pub max_phase_retry_attempts: u32,
    #[serde(default = "default_max_external_attempts")]
    pub max_external_attempts: u32,
    #[serde(default = "default_max_identical_error_repeats")]
    pub max_identical_error_repeats: u32,
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
    #[serde(default)]
    pub db_path: Option<PathBuf>,
}

impl Default for AdwConfig {
    fn default() -> Self {
        Self {
            retry: RetrySection::default(),
            resources: ResourcesSection::default(),
            webhook: WebhookSection::default(),
            timeouts: TimeoutsSection::default(),
            max_phase_retry_attempts: default_max_phase_retry_attempts(),
            max_external_attempts: default_max_external_attempts(),
            max_identical_error_repeats: default_max_identical_error_repeats(),
            state_dir: None,
            db_path: None,
        }
    }
}

impl AdwConfig {
    /// Load `adw.toml` from the repository root. Returns built-in defaults
    /// if the file does not exist.
    pub fn load_from_workspace(workspace_root: &Path) -> Result<Self> {
        let config_path = workspace_root.join("adw.toml");
        if !config_path.exists() {
            return Ok(Self::default());
        }
        Self::load_from_file(&config_path)
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: AdwConfig = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    /// Overlay the environment knobs named in §6: `MAX_PHASE_RETRY_ATTEMPTS`,
    /// `MAX_EXTERNAL_ATTEMPTS`, `MAX_IDENTICAL_ERROR_REPEATS`,
    /// `MAX_CONCURRENT_RUNS`, `ADW_WEBHOOK_SECRET`.
    pub fn apply_env_overrides(mut self) -> Self {
        if let Some(v) = env_u32("MAX_PHASE_RETRY_ATTEMPTS") {
            self.max_phase_retry_attempts = v;
        }
        if let Some(v) = env_u32("MAX_EXTERNAL_ATTEMPTS") {
            self.max_external_attempts = v;
        }
        if let Some(v) = env_u32("MAX_IDENTICAL_ERROR_REPEATS") {
            self.max_identical_error_repeats = v;
        }
        if let Some(v) = env_u32("MAX_CONCURRENT_RUNS") {
            self.resources.max_concurrent_runs = v;
        }
        if let Ok(secret) = std::env::var("ADW_WEBHOOK_SECRET") {
            self.webhook.secret = secret;
        }
        self
    }
}

fn env_u32(key: &str) -> Option<u32> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
