//! Daemon configuration (`~/.attest/daemon/attestd.toml`).
//!
//! A missing file yields defaults. Every field carries a serde default so a
//! partial file only overrides what it names.

use attest_core::{ChainScope, PolicyConfig};
use serde::Deserialize;
use std::path::PathBuf;

const DEFAULT_CONFIG_RELATIVE_PATH: &str = ".attest/daemon/attestd.toml";
pub const WEBHOOK_SECRET_ENV: &str = "ATTEST_WEBHOOK_SECRET";

#[derive(Debug, Clone, Deserialize, Default)]
pub struct DaemonConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Minutes after the scheduled end before a session is due.
    #[serde(default = "default_grace_period_min")]
    pub grace_period_min: u32,
    /// How long a finalization claim blocks other sweeps.
    #[serde(default = "default_claim_lease_secs")]
    pub claim_lease_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            interval_secs: default_interval_secs(),
            grace_period_min: default_grace_period_min(),
            claim_lease_secs: default_claim_lease_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    #[serde(default = "default_deadline_ms")]
    pub deadline_ms: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            deadline_ms: default_deadline_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookConfig {
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default = "default_timestamp_tolerance_secs")]
    pub timestamp_tolerance_secs: u64,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            secret: None,
            timestamp_tolerance_secs: default_timestamp_tolerance_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LedgerConfig {
    #[serde(default)]
    pub chain_scope: ChainScope,
    /// Defaults to `~/.attest/daemon/signing.key`.
    #[serde(default)]
    pub signing_key_path: Option<PathBuf>,
}

fn default_enabled() -> bool {
    true
}

fn default_interval_secs() -> u64 {
    120
}

fn default_grace_period_min() -> u32 {
    15
}

fn default_claim_lease_secs() -> u64 {
    300
}

fn default_deadline_ms() -> u64 {
    2_000
}

fn default_timestamp_tolerance_secs() -> u64 {
    300
}

fn default_config_path() -> Result<PathBuf, String> {
    let home = dirs::home_dir().ok_or_else(|| "Home directory not found".to_string())?;
    Ok(home.join(DEFAULT_CONFIG_RELATIVE_PATH))
}

pub fn load_config(path: Option<PathBuf>) -> Result<DaemonConfig, String> {
    let config_path = match path {
        Some(path) => path,
        None => default_config_path()?,
    };

    let mut config = if config_path.exists() {
        let content = fs_err::read_to_string(&config_path).map_err(|err| {
            format!(
                "Failed to read daemon config {}: {}",
                config_path.display(),
                err
            )
        })?;
        toml::from_str::<DaemonConfig>(&content).map_err(|err| {
            format!(
                "Failed to parse daemon config {}: {}",
                config_path.display(),
                err
            )
        })?
    } else {
        DaemonConfig::default()
    };

    if let Ok(secret) = std::env::var(WEBHOOK_SECRET_ENV) {
        if !secret.trim().is_empty() {
            config.webhook.secret = Some(secret);
        }
    }

    Ok(config)
}
