use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::stability::StabilityPolicy;
use crate::watcher::DEFAULT_INTERNAL_BUFFER_SIZE;

pub const DEFAULT_FILTER: &str = "*.*";
pub const DEFAULT_USERS_SUBDIR: &str = "Scan";
pub const DEFAULT_LOCK_POLL_INTERVAL_MS: u64 = 1000;
pub const MIN_LOCK_POLL_INTERVAL_MS: u64 = 10;
pub const DEFAULT_LOG_FILTER: &str = "scan_sorter=info";

/// Root configuration structure. Deserialized from `scan-sorter.toml`.
#[derive(Debug, Deserialize)]
pub struct Config {
    pub watch: WatchConfig,
    #[serde(default)]
    pub relocation: RelocationConfig,
    #[serde(default)]
    pub directory: DirectoryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Where scans arrive and how they are watched.
#[derive(Debug, Deserialize, Clone)]
pub struct WatchConfig {
    /// Directory tree the scanners write into; one subdirectory per user.
    pub root_path: PathBuf,
    /// File-name patterns; one watcher is started per pattern.
    #[serde(default = "default_filters")]
    pub filters: Vec<String>,
    /// Bound on undelivered events per watcher. Omit for unbounded.
    #[serde(default)]
    pub event_queue_capacity: Option<usize>,
    /// Deliver files already present at startup oldest first.
    #[serde(default)]
    pub oldest_first: bool,
    #[serde(default = "default_internal_buffer_size")]
    pub internal_buffer_size: usize,
}

/// Where scans go and how long to wait for writers.
#[derive(Debug, Deserialize, Clone)]
pub struct RelocationConfig {
    /// Fallback directory for scans without a valid owner.
    /// Defaults to `<root_path>/quarantine` when omitted.
    #[serde(default)]
    pub quarantine_path: Option<PathBuf>,
    /// Subdirectory of a user's home that receives their scans.
    #[serde(default = "default_users_subdir")]
    pub users_subdir: String,
    /// Interval between checks whether a scan is still being written.
    #[serde(default = "default_lock_poll_interval_ms")]
    pub lock_poll_interval_ms: u64,
    /// Give up on a scan that stays locked this long. Omit to wait forever.
    #[serde(default)]
    pub max_lock_wait_secs: Option<u64>,
}

impl Default for RelocationConfig {
    fn default() -> Self {
        Self {
            quarantine_path: None,
            users_subdir: DEFAULT_USERS_SUBDIR.to_string(),
            lock_poll_interval_ms: DEFAULT_LOCK_POLL_INTERVAL_MS,
            max_lock_wait_secs: None,
        }
    }
}

impl RelocationConfig {
    pub fn stability_policy(&self) -> StabilityPolicy {
        StabilityPolicy {
            poll_interval: Duration::from_millis(
                self.lock_poll_interval_ms.max(MIN_LOCK_POLL_INTERVAL_MS),
            ),
            max_wait: self.max_lock_wait_secs.map(Duration::from_secs),
        }
    }
}

/// Static user → home directory mapping.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct DirectoryConfig {
    /// Explicit home directories keyed by folder (user) name.
    #[serde(default)]
    pub users: BTreeMap<String, PathBuf>,
    /// Fallback such as `/home/{user}`; `{user}` is replaced by the folder name.
    #[serde(default)]
    pub home_template: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct LoggingConfig {
    /// Also append log output to this file.
    #[serde(default)]
    pub log_path: Option<PathBuf>,
    /// `tracing` filter directive; `RUST_LOG` takes precedence.
    #[serde(default)]
    pub filter: Option<String>,
}

impl Config {
    /// Resolved quarantine directory.
    pub fn quarantine_path(&self) -> PathBuf {
        self.relocation
            .quarantine_path
            .clone()
            .unwrap_or_else(|| self.watch.root_path.join("quarantine"))
    }

    /// Creates the root, quarantine and log directories if they are missing.
    /// Fails if any of them cannot be created.
    pub fn prepare_paths(&self) -> Result<()> {
        let mut dirs = vec![self.watch.root_path.clone(), self.quarantine_path()];
        if let Some(parent) = self
            .logging
            .log_path
            .as_deref()
            .and_then(Path::parent)
            .filter(|p| !p.as_os_str().is_empty())
        {
            dirs.push(parent.to_path_buf());
        }
        for dir in dirs {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Path is not available: {}", dir.display()))?;
        }
        Ok(())
    }
}

/// Loads and checks the config file at `path`.
/// Returns an error if the file cannot be read, parsed, or names no filters.
pub fn load(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
    if config.watch.filters.iter().all(|f| f.trim().is_empty()) {
        bail!("Config file {} lists no watch filters", path.display());
    }
    Ok(config)
}

fn default_filters() -> Vec<String> {
    vec![DEFAULT_FILTER.to_string()]
}

fn default_internal_buffer_size() -> usize {
    DEFAULT_INTERNAL_BUFFER_SIZE
}

fn default_users_subdir() -> String {
    DEFAULT_USERS_SUBDIR.to_string()
}

fn default_lock_poll_interval_ms() -> u64 {
    DEFAULT_LOCK_POLL_INTERVAL_MS
}
