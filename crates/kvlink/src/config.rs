//! Registry configuration, parsed from TOML.
//!
//! Every field is optional; an empty document yields the defaults.
//!
//! ```toml
//! grace_period_secs = 600
//! sweep_interval_secs = 30
//! max_retired = 1024
//! create_timeout_secs = 10
//! settings_path = "conf/redis.toml"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::retirement::DEFAULT_GRACE_PERIOD;
use crate::source::FileSourceProvider;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Seconds a retired client stays open before a sweep may close it.
    pub grace_period_secs: u64,
    /// Seconds between background retirement sweeps.
    pub sweep_interval_secs: u64,
    /// Retired clients kept before the oldest are closed early.
    pub max_retired: usize,
    /// Upper bound on one client creation, probe included.
    pub create_timeout_secs: u64,
    /// Settings document for [`FileSourceProvider`].
    pub settings_path: Option<PathBuf>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            grace_period_secs: DEFAULT_GRACE_PERIOD.as_secs(),
            sweep_interval_secs: 30,
            max_retired: 1024,
            create_timeout_secs: 10,
            settings_path: None,
        }
    }
}

impl RegistryConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: RegistryConfig = toml::from_str(content)?;
        if config.sweep_interval_secs == 0 {
            anyhow::bail!("sweep_interval_secs must be at least 1");
        }
        Ok(config)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    /// Zero disables the creation deadline.
    pub fn create_timeout(&self) -> Option<Duration> {
        (self.create_timeout_secs > 0).then(|| Duration::from_secs(self.create_timeout_secs))
    }

    /// Provider for `settings_path`, if one is configured.
    pub fn file_provider(&self) -> Option<FileSourceProvider> {
        self.settings_path.as_ref().map(FileSourceProvider::new)
    }
}
