//! Engine settings.
//! Constants describe on-disk layouts; `SyncConfig` holds the tunables a
//! caller may override from a JSON file.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DOWNLOAD_CACHE_DIR: &str = "downloadCache";
pub const INTEGRITY_FILE: &str = ".integrity";
pub const ARCHIVE_EXTENSION: &str = ".smod";
pub const PARTIAL_EXTENSION: &str = ".part";
pub const LOCKFILE_NAME: &str = "mods-lock.json";
pub const EXTRACT_MARKER_FILE: &str = ".smm";
pub const ICON_PATH: &str = "Resources/Icon128.png";

pub const DEFAULT_MODS_DIR: &str = "FactoryGame/Mods";
pub const DEFAULT_CORE_RUNTIME: &str = "FactoryGame";
pub const REQUEST_TIMEOUT_SECS: u64 = 120;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SyncConfig {
    /// Root of the content cache; archives live under `downloadCache/`.
    pub cache_dir: PathBuf,
    /// Directory inside an installation that receives extracted packages.
    pub mods_dir: String,
    /// Reference of the game itself; dependencies on it are never resolved.
    pub core_runtime_reference: String,
    pub download_retries: u32,
    /// Base retry delay; attempt `n` waits `n * retry_delay_ms`.
    pub retry_delay_ms: u64,
    pub request_timeout_secs: u64,
    pub user_agent: String,
    /// Capacity of the progress channel handed to consumers.
    pub progress_buffer: usize,
    /// Start [`crate::provider::MixedProvider::from_config`] in offline mode.
    pub offline: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            mods_dir: DEFAULT_MODS_DIR.to_string(),
            core_runtime_reference: DEFAULT_CORE_RUNTIME.to_string(),
            download_retries: 3,
            retry_delay_ms: 1000,
            request_timeout_secs: REQUEST_TIMEOUT_SECS,
            user_agent: format!("modsync/{}", env!("CARGO_PKG_VERSION")),
            progress_buffer: 64,
            offline: false,
        }
    }
}

impl SyncConfig {
    /// Load settings from a JSON file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::debug!("No config at {:?}, using defaults", path);
            return Ok(Self::default());
        }
        let data =
            std::fs::read_to_string(path).with_context(|| format!("Read config {:?}", path))?;
        serde_json::from_str(&data).with_context(|| format!("Parse config {:?}", path))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn lockfile_path(&self) -> String {
        format!("{}/{}", self.mods_dir.trim_end_matches('/'), LOCKFILE_NAME)
    }

    pub fn mod_dir(&self, reference: &str) -> String {
        format!("{}/{}", self.mods_dir.trim_end_matches('/'), reference)
    }
}

fn default_cache_dir() -> PathBuf {
    directories::ProjectDirs::from("", "", "modsync")
        .map(|dirs| dirs.cache_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".modsync-cache"))
}
