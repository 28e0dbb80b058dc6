//! Where the daemon looks for its files when none are given explicitly.
//!
//! The config file defaults to `scan-sorter.toml` beside the executable; the
//! status file is always written next to whichever config file was loaded.
use std::path::{Path, PathBuf};

pub const CONFIG_FILE_NAME: &str = "scan-sorter.toml";
pub const STATUS_FILE_NAME: &str = "status.toml";

/// Directory containing the running executable, falling back to the
/// current directory when that cannot be determined.
pub fn install_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."))
}

pub fn default_config_path() -> PathBuf {
    install_dir().join(CONFIG_FILE_NAME)
}

/// `status.toml` in the same directory as `config_path`.
pub fn status_file_path(config_path: &Path) -> PathBuf {
    match config_path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.join(STATUS_FILE_NAME),
        _ => PathBuf::from(STATUS_FILE_NAME),
    }
}
