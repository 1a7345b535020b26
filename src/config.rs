use anyhow::{Context, Result};
use serde::Deserialize;
use std::time::Duration;

use crate::audio::StreamerConfig;
use crate::realtime::TransportConfig;
use crate::session::SessionConfig;

#[derive(Debug, Deserialize)]
pub struct Config {
    pub transport: ConnectionConfig,
    #[serde(default)]
    pub streaming: StreamingConfig,
}

#[derive(Debug, Deserialize)]
pub struct ConnectionConfig {
    pub url: String,
    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

#[derive(Debug, Deserialize)]
pub struct StreamingConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u32,
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_start_delay_ms")]
    pub start_delay_ms: u64,
    #[serde(default)]
    pub commit_on_finish: bool,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            interval_ms: default_interval_ms(),
            start_delay_ms: default_start_delay_ms(),
            commit_on_finish: false,
        }
    }
}

fn default_reconnect_interval_ms() -> u64 {
    5000
}

fn default_max_retries() -> u32 {
    5
}

fn default_chunk_size() -> u32 {
    1024
}

fn default_interval_ms() -> u64 {
    1000
}

fn default_start_delay_ms() -> u64 {
    1000
}

impl Config {
    /// Load from an optional config file, then `LOQA_REALTIME_*` environment
    /// overrides (e.g. `LOQA_REALTIME_TRANSPORT__URL`)
    pub fn load(path: &str) -> Result<Self> {
        Self::load_with_url(path, None)
    }

    /// Like [`Config::load`], with `url` taking precedence over every source
    pub fn load_with_url(path: &str, url: Option<&str>) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(
                config::Environment::with_prefix("LOQA_REALTIME")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .set_override_option("transport.url", url)?
            .build()
            .with_context(|| format!("Failed to read config from {}", path))?;

        settings
            .try_deserialize()
            .context("Invalid realtime configuration")
    }

    pub fn transport(&self) -> TransportConfig {
        TransportConfig::new(self.transport.url.clone())
            .with_reconnect_interval(Duration::from_millis(self.transport.reconnect_interval_ms))
            .with_max_retries(self.transport.max_retries)
    }

    pub fn streamer(&self) -> StreamerConfig {
        StreamerConfig::new(
            self.streaming.chunk_size,
            Duration::from_millis(self.streaming.interval_ms),
        )
        .with_start_delay(Duration::from_millis(self.streaming.start_delay_ms))
        .with_commit_on_finish(self.streaming.commit_on_finish)
    }

    pub fn session(&self) -> SessionConfig {
        SessionConfig {
            transport: self.transport(),
            streamer: self.streamer(),
            ..SessionConfig::new(self.transport.url.clone())
        }
    }
}
