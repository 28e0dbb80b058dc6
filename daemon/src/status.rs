use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::warn;

/// Current operational state of the daemon.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
#[serde(rename_all = "lowercase")]
pub enum DaemonState {
    /// Watchers are being created and enabled.
    Starting,
    /// Every configured watcher is enabled.
    Running,
    /// A watcher reported a fault; the whole set is being rebuilt.
    Restarting,
    Stopped,
}

/// Runtime status written next to the config file as `status.toml`, so an
/// operator can see whether the sorter is healthy without reading its log.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DaemonStatus {
    /// Daemon binary version (set from Cargo.toml at compile time).
    pub version: String,
    pub state: DaemonState,
    /// Number of watchers currently enabled.
    pub watchers: usize,
    /// Number of times the watcher set has been rebuilt after a fault.
    pub restarts: u64,
    /// RFC 3339 timestamp of the most recent rebuild, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_restart: Option<String>,
    /// Most recent watcher fault, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl DaemonStatus {
    pub fn new() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            state: DaemonState::Starting,
            watchers: 0,
            restarts: 0,
            last_restart: None,
            last_error: None,
        }
    }

    /// Records a completed rebuild of the watcher set.
    pub fn record_restart(&mut self, watchers: usize) {
        self.state = DaemonState::Running;
        self.watchers = watchers;
        self.restarts += 1;
        self.last_restart = Some(chrono::Local::now().to_rfc3339());
    }
}

impl Default for DaemonStatus {
    fn default() -> Self {
        Self::new()
    }
}

/// Serializes `status` to TOML and writes it to `path`.
/// Creates the parent directory if it does not exist. Failures are logged,
/// never returned.
pub fn write_status(path: &Path, status: &DaemonStatus) {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        if let Err(e) = std::fs::create_dir_all(parent) {
            warn!("Failed to create status directory {}: {e}", parent.display());
            return;
        }
    }
    match toml::to_string_pretty(status) {
        Ok(content) => {
            if let Err(e) = std::fs::write(path, content) {
                warn!("Failed to write status file {}: {e}", path.display());
            }
        }
        Err(e) => warn!("Failed to serialize status: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── DaemonStatus::new ─────────────────────────────────────────────────────

    #[test]
    fn new_starts_with_no_watchers() {
        let s = DaemonStatus::new();
        assert_eq!(s.state, DaemonState::Starting);
        assert_eq!(s.watchers, 0);
        assert_eq!(s.restarts, 0);
        assert!(s.last_restart.is_none());
        assert!(s.last_error.is_none());
        assert_eq!(s.version, env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn record_restart_counts_and_timestamps() {
        let mut s = DaemonStatus::new();
        s.state = DaemonState::Restarting;
        s.record_restart(2);
        s.record_restart(2);
        assert_eq!(s.state, DaemonState::Running);
        assert_eq!(s.watchers, 2);
        assert_eq!(s.restarts, 2);
        let stamp = s.last_restart.expect("timestamp set");
        assert!(chrono::DateTime::parse_from_rfc3339(&stamp).is_ok());
    }

    // ── serialization ─────────────────────────────────────────────────────────

    #[test]
    fn state_serializes_to_lowercase() {
        let mut s = DaemonStatus::new();
        for (state, text) in [
            (DaemonState::Starting, "starting"),
            (DaemonState::Running, "running"),
            (DaemonState::Restarting, "restarting"),
            (DaemonState::Stopped, "stopped"),
        ] {
            s.state = state;
            let out = toml::to_string_pretty(&s).unwrap();
            assert!(out.contains(&format!("state = \"{text}\"")), "{out}");
        }
    }

    // ── write_status ──────────────────────────────────────────────────────────

    #[test]
    fn write_status_creates_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("status.toml");
        write_status(&path, &DaemonStatus::new());
        assert!(path.exists());
    }

    #[test]
    fn write_status_content_parses_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.toml");

        let mut original = DaemonStatus::new();
        original.state = DaemonState::Running;
        original.watchers = 3;
        original.last_error = Some("inotify queue overflow".to_string());
        write_status(&path, &original);

        let parsed: DaemonStatus =
            toml::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(parsed.state, DaemonState::Running);
        assert_eq!(parsed.watchers, 3);
        assert_eq!(parsed.last_error.as_deref(), Some("inotify queue overflow"));
    }

    #[test]
    fn write_status_omits_unset_optional_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.toml");
        write_status(&path, &DaemonStatus::new());

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(!content.contains("last_restart"));
        assert!(!content.contains("last_error"));
    }
}
