// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Fork thresholds and await timeout.
//!
//! Values are not validated. They are read on every dispatch and every
//! await, so changes take effect immediately.

use std::fs;
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForkConfig {
    /// Live fork count above which each dispatch logs a warning.
    pub warning_forks: usize,
    /// Live fork count above which dispatch is refused.
    pub max_forks: usize,
    /// Timeout used when an await does not pass one. Zero waits forever.
    #[serde(rename = "default_await_timeout_ms", with = "millis")]
    pub default_await_timeout: Duration,
}

impl Default for ForkConfig {
    fn default() -> Self {
        Self {
            warning_forks: 10,
            max_forks: 100,
            default_await_timeout: Duration::from_secs(5 * 60),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),
}

impl ForkConfig {
    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn to_json_pretty(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis().try_into().unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Configuration shared by a runtime, its center and every controller.
#[derive(Debug, Clone, Default)]
pub struct SharedConfig {
    inner: Arc<RwLock<ForkConfig>>,
}

impl SharedConfig {
    pub fn new(config: ForkConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(config)),
        }
    }

    pub fn read<R, F: FnOnce(&ForkConfig) -> R>(&self, f: F) -> R {
        let guard = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        f(&guard)
    }

    pub fn update<R, F: FnOnce(&mut ForkConfig) -> R>(&self, f: F) -> R {
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    pub fn snapshot(&self) -> ForkConfig {
        self.read(ForkConfig::clone)
    }

    pub fn warning_forks(&self) -> usize {
        self.read(|c| c.warning_forks)
    }

    pub fn max_forks(&self) -> usize {
        self.read(|c| c.max_forks)
    }

    pub fn default_await_timeout(&self) -> Duration {
        self.read(|c| c.default_await_timeout)
    }

    pub fn set_warning_forks(&self, n: usize) {
        self.update(|c| c.warning_forks = n);
    }

    pub fn set_max_forks(&self, n: usize) {
        self.update(|c| c.max_forks = n);
    }

    pub fn set_default_await_timeout(&self, timeout: Duration) {
        self.update(|c| c.default_await_timeout = timeout);
    }
}
