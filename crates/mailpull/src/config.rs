//! Configuration loading for downloads
//!
//! Options are read (in order of priority) from:
//! 1. Runtime environment variables (`MAILPULL_*`)
//! 2. JSON file in the mailpull config directory
//! 3. Built-in defaults

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Options filename in the config directory
const OPTIONS_FILE: &str = "download.json";

/// Vectorization endpoint filename in the config directory
const VECTORIZE_FILE: &str = "vectorize.json";

/// Tuning knobs for the download loop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadOptions {
    /// Emails requested per batch
    pub page_size: usize,
    /// Checkpoint after every this many successful batches
    pub checkpoint_interval: u64,
    /// Retries of one batch before the session goes to `error`
    pub max_retries: u32,
    /// Pause between successful batches
    pub batch_delay_ms: u64,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            page_size: 50,
            checkpoint_interval: 5,
            max_retries: 3,
            batch_delay_ms: 100,
            backoff_base_ms: 1000,
            backoff_cap_ms: 30_000,
        }
    }
}

impl DownloadOptions {
    /// Largest page any supported provider accepts
    pub const MAX_PAGE_SIZE: usize = 500;

    /// Load options from the config file (if present) and the environment
    pub fn load() -> Result<Self> {
        let options = if config::config_exists(OPTIONS_FILE) {
            config::load_json(OPTIONS_FILE)?
        } else {
            Self::default()
        };
        Ok(options
            .with_env_overrides(|key| std::env::var(key).ok())
            .normalized())
    }

    /// Apply `MAILPULL_*` overrides. Values that fail to parse are ignored.
    pub fn with_env_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        fn parse<T: std::str::FromStr>(
            lookup: &impl Fn(&str) -> Option<String>,
            key: &str,
        ) -> Option<T> {
            let raw = lookup(key)?;
            match raw.trim().parse() {
                Ok(value) => Some(value),
                Err(_) => {
                    log::warn!("Ignoring invalid {}={:?}", key, raw);
                    None
                }
            }
        }

        if let Some(v) = parse::<usize>(&lookup, "MAILPULL_PAGE_SIZE") {
            self.page_size = v;
        }
        if let Some(v) = parse::<u64>(&lookup, "MAILPULL_CHECKPOINT_INTERVAL") {
            self.checkpoint_interval = v;
        }
        if let Some(v) = parse::<u32>(&lookup, "MAILPULL_MAX_RETRIES") {
            self.max_retries = v;
        }
        if let Some(v) = parse::<u64>(&lookup, "MAILPULL_BATCH_DELAY_MS") {
            self.batch_delay_ms = v;
        }
        self
    }

    /// Clamp values into their usable ranges
    pub fn normalized(mut self) -> Self {
        self.page_size = self.page_size.clamp(1, Self::MAX_PAGE_SIZE);
        self.checkpoint_interval = self.checkpoint_interval.max(1);
        self.backoff_cap_ms = self.backoff_cap_ms.max(self.backoff_base_ms);
        self
    }

    pub fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.batch_delay_ms)
    }

    /// Delay before retry number `retry` (1-based): `base * 2^retry`, capped
    pub fn backoff_delay(&self, retry: u32) -> Duration {
        let factor = 1u64.checked_shl(retry).unwrap_or(u64::MAX);
        let ms = self.backoff_base_ms.saturating_mul(factor).min(self.backoff_cap_ms);
        Duration::from_millis(ms)
    }
}

/// Where to publish vectorization requests
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorizeConfig {
    pub endpoint: String,
    #[serde(default)]
    pub auth_token: Option<String>,
}

impl VectorizeConfig {
    /// Load from `MAILPULL_VECTORIZE_URL` / `MAILPULL_VECTORIZE_TOKEN`, falling
    /// back to `vectorize.json` in the config directory
    pub fn load() -> Result<Self> {
        if let Ok(endpoint) = std::env::var("MAILPULL_VECTORIZE_URL") {
            return Ok(Self {
                endpoint,
                auth_token: std::env::var("MAILPULL_VECTORIZE_TOKEN").ok(),
            });
        }

        config::load_json(VECTORIZE_FILE).with_context(|| {
            format!(
                "No vectorization endpoint: set MAILPULL_VECTORIZE_URL or create {}",
                VECTORIZE_FILE
            )
        })
    }
}
