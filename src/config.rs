//! Worker configuration persistence
//!
//! Stored in ~/.config/tuneworker/config.json. Every field has a default so a
//! partial (or missing) file is fine.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// User agent sent with every outbound request
    pub user_agent: String,
    /// Transport timeout for track and cover downloads
    pub request_timeout_secs: u64,
    /// Timeout for advisory lookups (content-type HEAD, album info)
    pub lookup_timeout_secs: u64,
    /// How long a sandboxed plugin waits for an HTTP or store response
    pub plugin_request_timeout_secs: u64,
    /// Backoff between cover-write sweep passes
    pub cover_retry_delay_secs: u64,
    /// Edge length of embedded covers
    pub cover_size: u32,
    /// Query appended to album picture URLs to request the large source image
    pub cover_source_query: Option<String>,
    pub jpeg_quality: u8,
    /// Local companion service answering album lookups
    pub album_service_url: String,
    pub unknown_artist: String,
    pub unknown_album: String,
    /// Instruction budget for a single plugin call
    pub plugin_fuel: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            user_agent: concat!("tuneworker/", env!("CARGO_PKG_VERSION")).to_string(),
            request_timeout_secs: 60,
            lookup_timeout_secs: 5,
            plugin_request_timeout_secs: 15,
            cover_retry_delay_secs: 5,
            cover_size: 512,
            cover_source_query: Some("param=1024y1024".to_string()),
            jpeg_quality: 90,
            album_service_url: "http://127.0.0.1:10754".to_string(),
            unknown_artist: "未知歌手".to_string(),
            unknown_album: "Unknown Album".to_string(),
            plugin_fuel: 2_000_000_000,
        }
    }
}

impl WorkerConfig {
    /// Load from an explicit path, or the default location when `None`
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::config_path()?,
        };

        if !path.exists() {
            debug!("No worker config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read worker config from {:?}", path))?;

        let config: Self =
            serde_json::from_str(&contents).with_context(|| "Failed to parse worker config")?;

        debug!("Loaded worker config from {}", path.display());
        Ok(config)
    }

    /// Save to the given path, creating its parent directory
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory {:?}", parent))?;
        }

        let contents =
            serde_json::to_string_pretty(self).context("Failed to serialize worker config")?;

        fs::write(path, contents)
            .with_context(|| format!("Failed to write worker config to {:?}", path))?;

        debug!("Saved worker config to {}", path.display());
        Ok(())
    }

    /// Default config file path
    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Directory holding config and plugin store files
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        Ok(config_dir.join("tuneworker"))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn lookup_timeout(&self) -> Duration {
        Duration::from_secs(self.lookup_timeout_secs)
    }

    pub fn plugin_request_timeout(&self) -> Duration {
        Duration::from_secs(self.plugin_request_timeout_secs)
    }

    pub fn cover_retry_delay(&self) -> Duration {
        Duration::from_secs(self.cover_retry_delay_secs)
    }
}
