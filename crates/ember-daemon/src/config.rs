//! Daemon configuration
//!
//! Every tunable lives here. Loaded from TOML at startup, falls back to
//! defaults if no config file exists.

use crate::error::{DaemonError, DaemonResult};
use ember_core::{MetabolismConfig, PolicyConfig, TrustedKey};
use ember_llm::{AnthropicProvider, CompletionService, OfflineCompletion, DEFAULT_MODEL};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Top-level daemon configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub metabolism: MetabolismConfig,
    pub policy: PolicyConfig,
    pub fast: FastConfig,
    pub slow: SlowConfig,
    pub completion: CompletionConfig,
    pub storage: StorageConfig,
    pub lifecycle: LifecycleConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FastConfig {
    /// Reactive tick period in milliseconds.
    pub tick_ms: u64,
    /// Energy spent per reactive decision.
    pub cost: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SlowConfig {
    /// Fast ticks per deliberation cycle.
    pub ticks_per_cycle: u32,
    /// Energy spent per deliberation. Must exceed `fast.cost`.
    pub cost: f64,
    /// Degrees shed during reflection.
    pub cool_amount: f64,
    /// Upper bound on one completion call.
    pub completion_timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompletionConfig {
    /// "anthropic" or "offline".
    pub provider: String,
    pub model: String,
    pub max_tokens: u32,
    pub base_url: Option<String>,
    pub system: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Parent of the per-instance receipt directory. Unset: /dev/shm, else the OS temp dir.
    pub ephemeral_root: Option<PathBuf>,
    /// Where seeds land when no explicit path is given.
    pub seed_dir: PathBuf,
    /// PKCS#8 signing key, base64. Generated on first run.
    pub key_file: PathBuf,
    /// Keep the receipt directory after exit.
    pub keep_receipts: bool,
    /// Extra public keys (base64) whose seeds may be imported.
    pub trusted_keys: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    pub export_on_shutdown: bool,
    pub export_on_death: bool,
}

// ============================================================
// Defaults
// ============================================================

impl Default for FastConfig {
    fn default() -> Self {
        Self { tick_ms: 2_000, cost: 0.2 }
    }
}

impl Default for SlowConfig {
    fn default() -> Self {
        Self { ticks_per_cycle: 15, cost: 1.5, cool_amount: 6.0, completion_timeout_ms: 5_000 }
    }
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            provider: "anthropic".into(),
            model: DEFAULT_MODEL.into(),
            max_tokens: 256,
            base_url: None,
            system: None,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            ephemeral_root: None,
            seed_dir: PathBuf::from("seeds"),
            key_file: PathBuf::from("ember.key"),
            keep_receipts: false,
            trusted_keys: Vec::new(),
        }
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self { export_on_shutdown: true, export_on_death: true }
    }
}

// ============================================================
// Loading
// ============================================================

impl DaemonConfig {
    /// Load config from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => {
                    tracing::info!("Loaded config from {}", path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!("Failed to parse {}: {} (using defaults)", path.display(), e);
                    Self::default()
                }
            },
            Err(_) => {
                tracing::info!("No config at {}, using defaults", path.display());
                Self::default()
            }
        }
    }

    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }

    pub fn validate(&self) -> DaemonResult<()> {
        self.metabolism.validate()?;
        if self.fast.tick_ms == 0 {
            return Err(DaemonError::config("fast.tick_ms must be positive"));
        }
        if self.slow.ticks_per_cycle == 0 {
            return Err(DaemonError::config("slow.ticks_per_cycle must be positive"));
        }
        if !(self.fast.cost >= 0.0) {
            return Err(DaemonError::config("fast.cost must be non-negative"));
        }
        if !(self.slow.cost > self.fast.cost) {
            return Err(DaemonError::config(format!(
                "slow.cost ({}) must exceed fast.cost ({})",
                self.slow.cost, self.fast.cost
            )));
        }
        if !(self.slow.cool_amount >= 0.0) {
            return Err(DaemonError::config("slow.cool_amount must be non-negative"));
        }
        if self.slow.completion_timeout_ms == 0 {
            return Err(DaemonError::config("slow.completion_timeout_ms must be positive"));
        }
        self.storage.parse_trusted_keys()?;
        Ok(())
    }

    pub fn tick_period(&self) -> Duration {
        Duration::from_millis(self.fast.tick_ms)
    }

    pub fn cycle_period(&self) -> Duration {
        self.tick_period() * self.slow.ticks_per_cycle
    }

    pub fn completion_timeout(&self) -> Duration {
        Duration::from_millis(self.slow.completion_timeout_ms)
    }
}

impl StorageConfig {
    pub fn parse_trusted_keys(&self) -> DaemonResult<Vec<TrustedKey>> {
        self.trusted_keys
            .iter()
            .map(|k| TrustedKey::from_b64(k).map_err(DaemonError::from))
            .collect()
    }

    pub fn resolved_ephemeral_root(&self) -> PathBuf {
        if let Some(root) = &self.ephemeral_root {
            return root.clone();
        }
        let shm = Path::new("/dev/shm");
        if shm.is_dir() {
            shm.to_path_buf()
        } else {
            std::env::temp_dir()
        }
    }
}

impl CompletionConfig {
    /// Build the configured completion service. A missing API key degrades to offline.
    pub fn build_service(&self) -> DaemonResult<Arc<dyn CompletionService>> {
        match self.provider.as_str() {
            "offline" => Ok(Arc::new(OfflineCompletion)),
            "anthropic" => {
                let api_key = match std::env::var("ANTHROPIC_API_KEY") {
                    Ok(k) if !k.trim().is_empty() => k,
                    _ => {
                        tracing::warn!("ANTHROPIC_API_KEY not set, deliberation runs offline");
                        return Ok(Arc::new(OfflineCompletion));
                    }
                };
                let mut provider = AnthropicProvider::new(api_key)
                    .with_model(self.model.clone())
                    .with_max_tokens(self.max_tokens);
                if let Some(url) = &self.base_url {
                    provider = provider.with_base_url(url.clone());
                }
                if let Some(system) = &self.system {
                    provider = provider.with_system(system.clone());
                }
                Ok(Arc::new(provider))
            }
            other => Err(DaemonError::config(format!("unknown completion provider {other:?}"))),
        }
    }
}
