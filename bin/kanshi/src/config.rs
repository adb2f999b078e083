use std::path::Path;

use iori_adaptive::config::{AdaptiveConfig, ChunkSourceConfig, TrackerConfig};
use serde::{Deserialize, Serialize};

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub tracker: TrackerConfig,
    pub chunk: ChunkSourceConfig,
    pub adaptive: AdaptiveConfig,
    pub http: HttpConfig,
    pub playback: PlaybackConfig,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub user_agent: Option<String>,
    pub timeout_secs: u64,
    /// Retries of a request that failed before any response arrived.
    pub retries: u32,
    /// Delay before the first retry, doubled for each further one.
    pub retry_delay_ms: u64,
    /// Cookies sent to the manifest host, in `Set-Cookie` syntax.
    pub cookies: Vec<String>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            user_agent: None,
            timeout_secs: 30,
            retries: 3,
            retry_delay_ms: 500,
            cookies: Vec::new(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// How far ahead of the playback position chunks are loaded.
    pub buffer_ahead_ms: u64,
    /// Chunks that failed to load exclude their track for this long.
    pub exclusion_ms: u64,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            buffer_ahead_ms: 30_000,
            exclusion_ms: 60_000,
        }
    }
}

impl Config {
    pub fn load(file: Option<&Path>) -> anyhow::Result<Self> {
        let Some(file) = file else {
            return Ok(Self::default());
        };
        let data = std::fs::read_to_string(file)?;
        let config = toml::from_str(&data)?;
        Ok(config)
    }
}
