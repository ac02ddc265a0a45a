// Client configuration
// Defaults, then config.json in the platform config dir, then HUDDLE_* env vars.
// Command-line flags are applied on top by the binary.

use log::{debug, info, warn};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::media::MediaConstraints;

const CONFIG_DIR_NAME: &str = "huddle";
const CONFIG_FILE_NAME: &str = "config.json";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Could not determine config directory")]
    NoConfigDir,

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Reconnection backoff. Delays double per attempt up to `max_delay_ms`,
/// with jitter over the upper half of the window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    /// `None` retries forever
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    /// Upper bound of the backoff window for a 1-based attempt number
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(20);
        let ms = self
            .initial_delay_ms
            .saturating_mul(1u64 << shift)
            .min(self.max_delay_ms);
        Duration::from_millis(ms)
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        let ceiling = self.ceiling(attempt).as_millis() as u64;
        let half = ceiling / 2;
        let jitter = if half == 0 { 0 } else { rand::thread_rng().gen_range(0..=half) };
        Duration::from_millis(half + jitter)
    }

    pub fn exhausted(&self, attempt: u32) -> bool {
        matches!(self.max_attempts, Some(max) if attempt > max)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Websocket URL of the relay, e.g. ws://127.0.0.1:9400
    pub relay_url: String,
    /// Local silence before we announce isTyping=false
    pub typing_idle_ms: u64,
    /// How long a remote typing entry lives without a refresh
    pub remote_typing_ttl_ms: u64,
    pub typing_sweep_ms: u64,
    /// Unanswered calls are ended after this long
    pub ring_timeout_secs: u64,
    /// Candidates kept per room while no call session exists yet
    pub orphan_candidate_limit: usize,
    pub media: MediaConstraints,
    pub ice_servers: Vec<String>,
    pub reconnect: ReconnectPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            relay_url: "ws://127.0.0.1:9400".to_string(),
            typing_idle_ms: 2_000,
            remote_typing_ttl_ms: 3_000,
            typing_sweep_ms: 500,
            ring_timeout_secs: 45,
            orphan_candidate_limit: 64,
            media: MediaConstraints::default(),
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl ClientConfig {
    pub fn typing_idle(&self) -> Duration {
        Duration::from_millis(self.typing_idle_ms)
    }

    pub fn remote_typing_ttl(&self) -> Duration {
        Duration::from_millis(self.remote_typing_ttl_ms)
    }

    pub fn typing_sweep(&self) -> Duration {
        Duration::from_millis(self.typing_sweep_ms.max(10))
    }

    pub fn ring_timeout(&self) -> Duration {
        Duration::from_secs(self.ring_timeout_secs)
    }

    /// Read a config file. A missing file yields the defaults.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            debug!("No config file at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Defaults, overlaid with the user's config file and the environment
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::load_from(&config_dir()?.join(CONFIG_FILE_NAME))?;
        config.apply_env_with(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let json = serde_json::to_string_pretty(self).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        fs::write(path, json).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn apply_env_with<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("HUDDLE_RELAY_URL") {
            self.relay_url = url;
        }
        apply_number(&lookup, "HUDDLE_TYPING_IDLE_MS", &mut self.typing_idle_ms);
        apply_number(&lookup, "HUDDLE_REMOTE_TYPING_TTL_MS", &mut self.remote_typing_ttl_ms);
        apply_number(&lookup, "HUDDLE_RING_TIMEOUT_SECS", &mut self.ring_timeout_secs);
        apply_number(&lookup, "HUDDLE_RECONNECT_MAX_DELAY_MS", &mut self.reconnect.max_delay_ms);
    }
}

fn apply_number<F>(lookup: &F, key: &str, target: &mut u64)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(raw) = lookup(key) {
        match raw.trim().parse() {
            Ok(value) => *target = value,
            Err(e) => warn!("Ignoring {}={:?}: {}", key, raw, e),
        }
    }
}

/// `<platform config dir>/huddle`, created on first use
pub fn config_dir() -> Result<PathBuf, ConfigError> {
    let dir = dirs::config_dir()
        .ok_or(ConfigError::NoConfigDir)?
        .join(CONFIG_DIR_NAME);

    if !dir.exists() {
        fs::create_dir_all(&dir).map_err(|source| ConfigError::Io {
            path: dir.clone(),
            source,
        })?;
    }

    Ok(dir)
}
