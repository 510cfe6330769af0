//! Runlane configuration loaded from `runlane.toml`.
//!
//! Every field has a default, so a missing file or a partial one is fine.
//! `RUNLANE_BIND` and `RUNLANE_WEBHOOK_URL` take precedence over the file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::budget::BudgetLimits;
use crate::error::Result;
use crate::retry::RetryPolicy;
use crate::supervisor::FrameworkSpec;

pub const DEFAULT_CONFIG_FILE: &str = "runlane.toml";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RunlaneConfig {
    pub server: ServerConfig,
    pub supervisor: SupervisorConfig,
    pub retry: RetryPolicy,
    pub budget: BudgetConfig,
    pub notify: NotifyConfig,
    /// Extra or replacement frameworks, keyed by framework id.
    pub frameworks: BTreeMap<String, FrameworkSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub max_queue_depth: usize,
    /// How long terminal jobs stay queryable.
    pub retention_secs: u64,
    /// Per-job duration assumed for wait estimates until real runs are measured.
    pub default_estimate_secs: u64,
    pub artifact_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:7878".to_string(),
            max_queue_depth: 50,
            retention_secs: 3600,
            default_estimate_secs: 60,
            artifact_dir: PathBuf::from(".runlane/artifacts"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Time between SIGTERM and SIGKILL.
    pub grace_period_ms: u64,
    pub health_check_interval_ms: u64,
    /// A live runner with no output or CPU progress for this long is stalled.
    pub stall_threshold_secs: u64,
    pub max_output_bytes: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: 5_000,
            health_check_interval_ms: 1_000,
            stall_threshold_secs: 120,
            max_output_bytes: 4 * 1024 * 1024,
        }
    }
}

impl SupervisorConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms.max(10))
    }

    pub fn stall_threshold(&self) -> Duration {
        Duration::from_secs(self.stall_threshold_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    #[serde(flatten)]
    pub limits: BudgetLimits,
    /// Cost charged per second of runner wall-clock time.
    pub cost_per_runtime_second: f64,
    /// JSONL ledger file. In-memory only when unset.
    pub ledger_path: Option<PathBuf>,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            limits: BudgetLimits::default(),
            cost_per_runtime_second: 0.0,
            ledger_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    pub webhook_url: Option<String>,
    pub webhook_timeout_ms: u64,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            webhook_timeout_ms: 5_000,
        }
    }
}

impl RunlaneConfig {
    /// Load `path`, or `runlane.toml` in the current directory when `None`.
    /// A missing default file yields defaults; a missing explicit file is an error.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let path = Path::new(DEFAULT_CONFIG_FILE);
                if path.exists() {
                    Self::from_file(path)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Apply environment overrides through `lookup`, so tests can supply their own.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(bind) = lookup("RUNLANE_BIND").filter(|v| !v.is_empty()) {
            self.server.bind = bind;
        }
        if let Some(url) = lookup("RUNLANE_WEBHOOK_URL").filter(|v| !v.is_empty()) {
            self.notify.webhook_url = Some(url);
        }
    }
}
