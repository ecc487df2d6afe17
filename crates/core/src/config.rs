//! Versioned on-disk configuration.
//!
//! Follows the same persistence shape as `rqbit`'s session store: read
//! the file if present, fall back to defaults otherwise, and always write
//! through a temp file + rename so a crash never leaves `config.json` half
//! written.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

const CURRENT_VERSION: u32 = 2;

const MIN_CACHE_SIZE_BYTES: u64 = 100 * 1024 * 1024;
const MIN_RING_BUFFER_FILE_SIZE_MB: u32 = 5;
const MAX_RING_BUFFER_FILE_SIZE_MB: u32 = 1024;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PreferredDownloadType {
    Default,
    RingBuffer,
    Direct,
}

impl Default for PreferredDownloadType {
    fn default() -> Self {
        PreferredDownloadType::Default
    }
}

/// `<data_dir>/config.json`. Field names match the keys enumerated for the
/// external config surface; defaults are chosen to be safe for a first run
/// against the reference provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default = "default_version")]
    pub version: u32,

    #[serde(default)]
    pub api_auth: Option<String>,
    #[serde(default)]
    pub api_user: Option<String>,
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    #[serde(default = "default_max_cache_size_bytes")]
    pub max_cache_size_bytes: u64,
    /// Raw stored value in MiB; always pass through [`Config::ring_buffer_file_size_mb`]
    /// before use so reads are clamped without mutating what's on disk.
    #[serde(default = "default_ring_buffer_file_size_mb")]
    pub ring_buffer_file_size_mb: u32,
    #[serde(default = "default_max_upload_count")]
    pub max_upload_count: u32,

    #[serde(default = "default_download_timeout_secs")]
    pub download_timeout_secs: u64,
    #[serde(default = "default_true")]
    pub enable_download_timeout: bool,

    #[serde(default)]
    pub preferred_download_type: PreferredDownloadType,

    #[serde(default = "default_eviction_delay_mins")]
    pub eviction_delay_mins: u64,
    #[serde(default)]
    pub eviction_uses_accessed_time: bool,

    #[serde(default = "default_retry_read_count")]
    pub retry_read_count: u32,
    #[serde(default = "default_online_check_retry_secs")]
    pub online_check_retry_secs: u64,
}

fn default_version() -> u32 {
    CURRENT_VERSION
}
fn default_api_port() -> u16 {
    8080
}
fn default_max_cache_size_bytes() -> u64 {
    20 * 1024 * 1024 * 1024
}
fn default_ring_buffer_file_size_mb() -> u32 {
    64
}
fn default_max_upload_count() -> u32 {
    5
}
fn default_download_timeout_secs() -> u64 {
    60
}
fn default_true() -> bool {
    true
}
fn default_eviction_delay_mins() -> u64 {
    30
}
fn default_retry_read_count() -> u32 {
    6
}
fn default_online_check_retry_secs() -> u64 {
    60
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: CURRENT_VERSION,
            api_auth: None,
            api_user: None,
            api_port: default_api_port(),
            max_cache_size_bytes: default_max_cache_size_bytes(),
            ring_buffer_file_size_mb: default_ring_buffer_file_size_mb(),
            max_upload_count: default_max_upload_count(),
            download_timeout_secs: default_download_timeout_secs(),
            enable_download_timeout: true,
            preferred_download_type: PreferredDownloadType::Default,
            eviction_delay_mins: default_eviction_delay_mins(),
            eviction_uses_accessed_time: false,
            retry_read_count: default_retry_read_count(),
            online_check_retry_secs: default_online_check_retry_secs(),
        }
    }
}

impl Config {
    pub fn path(data_dir: &Path) -> PathBuf {
        data_dir.join("config.json")
    }

    pub fn load_or_default(data_dir: &Path) -> anyhow::Result<Self> {
        let path = Self::path(data_dir);
        match std::fs::read(&path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let cfg = Self::default();
                cfg.save(data_dir)?;
                Ok(cfg)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self, data_dir: &Path) -> anyhow::Result<()> {
        std::fs::create_dir_all(data_dir)?;
        let path = Self::path(data_dir);
        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, serde_json::to_vec_pretty(self)?)?;
        std::fs::rename(&tmp_path, &path)?;
        Ok(())
    }

    /// Clamps the stored MiB value to `[5, 1024]` without touching what's on
    /// disk; callers write whatever value they like and this decides what's
    /// actually usable.
    pub fn ring_buffer_file_size_mb(&self) -> u32 {
        self.ring_buffer_file_size_mb
            .clamp(MIN_RING_BUFFER_FILE_SIZE_MB, MAX_RING_BUFFER_FILE_SIZE_MB)
    }

    pub fn ring_buffer_file_size_bytes(&self) -> u64 {
        self.ring_buffer_file_size_mb() as u64 * 1024 * 1024
    }

    pub fn max_cache_size_bytes(&self) -> u64 {
        self.max_cache_size_bytes.max(MIN_CACHE_SIZE_BYTES)
    }

    pub fn max_upload_count(&self) -> u32 {
        self.max_upload_count.max(1)
    }

    /// Applies a single `-set key value` edit from the CLI. Unknown keys are
    /// rejected rather than silently ignored.
    pub fn set_by_key(&mut self, key: &str, value: &str) -> anyhow::Result<()> {
        match key {
            "ApiAuth" => self.api_auth = Some(value.to_string()),
            "ApiUser" => self.api_user = Some(value.to_string()),
            "ApiPort" => self.api_port = value.parse()?,
            "MaxCacheSizeBytes" => self.max_cache_size_bytes = value.parse()?,
            "RingBufferFileSize" => self.ring_buffer_file_size_mb = value.parse()?,
            "MaxUploadCount" => self.max_upload_count = value.parse()?,
            "DownloadTimeoutSecs" => self.download_timeout_secs = value.parse()?,
            "EnableDownloadTimeout" => self.enable_download_timeout = value.parse()?,
            "PreferredDownloadType" => {
                self.preferred_download_type = match value {
                    "default" => PreferredDownloadType::Default,
                    "ring_buffer" => PreferredDownloadType::RingBuffer,
                    "direct" => PreferredDownloadType::Direct,
                    other => anyhow::bail!("unknown PreferredDownloadType '{other}'"),
                };
            }
            "EvictionDelayMins" => self.eviction_delay_mins = value.parse()?,
            "EvictionUsesAccessedTime" => self.eviction_uses_accessed_time = value.parse()?,
            "RetryReadCount" => self.retry_read_count = value.parse()?,
            "OnlineCheckRetrySecs" => self.online_check_retry_secs = value.parse()?,
            other => anyhow::bail!("unknown config key '{other}'"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_round_trip_through_json() {
        let cfg = Config::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let back: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg, back);
    }

    #[test]
    fn load_or_default_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config::load_or_default(dir.path()).unwrap();
        assert_eq!(cfg.version, CURRENT_VERSION);
        assert!(Config::path(dir.path()).exists());
    }

    #[test]
    fn ring_buffer_size_clamps_without_mutating_storage() {
        let mut cfg = Config::default();
        cfg.ring_buffer_file_size_mb = 1;
        assert_eq!(cfg.ring_buffer_file_size_mb(), MIN_RING_BUFFER_FILE_SIZE_MB);
        assert_eq!(cfg.ring_buffer_file_size_mb, 1);

        cfg.ring_buffer_file_size_mb = 100_000;
        assert_eq!(cfg.ring_buffer_file_size_mb(), MAX_RING_BUFFER_FILE_SIZE_MB);
    }

    #[test]
    fn set_by_key_rejects_unknown_key() {
        let mut cfg = Config::default();
        assert!(cfg.set_by_key("NotAKey", "1").is_err());
        assert!(cfg.set_by_key("MaxUploadCount", "8").is_ok());
        assert_eq!(cfg.max_upload_count, 8);
    }

    #[test]
    fn save_then_reload_preserves_values() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = Config::default();
        cfg.max_upload_count = 12;
        cfg.save(dir.path()).unwrap();

        let reloaded = Config::load_or_default(dir.path()).unwrap();
        assert_eq!(reloaded.max_upload_count, 12);
    }
}
