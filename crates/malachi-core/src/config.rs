//! Daemon settings
//!
//! Read once at startup from `<config>/config.json`. Every field has a
//! default, so a missing file or a partial one is fine.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Settings for the malachi daemon
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Config {
    /// Explicit git executable; resolved on PATH when unset
    #[serde(default)]
    pub git: Option<PathBuf>,

    /// Upper bound on each readiness wait of the event loop (milliseconds)
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_poll_interval_ms() -> u64 {
    1000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            git: None,
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl Config {
    /// Load config from file
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config: {}", path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("Invalid config: {}", path.display()))
        } else {
            Ok(Self::default())
        }
    }

    pub fn poll_interval(&self) -> Duration {
        // A zero timeout would turn the loop into a busy spin
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}
