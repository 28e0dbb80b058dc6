use std::path::{Path, PathBuf};

/// The kind of filesystem change a [`ChangeEvent`] describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Created,
    Changed,
    Deleted,
    Renamed,
    /// Synthesized for a file that was already present when watching began.
    Existing,
}

impl ChangeKind {
    pub const ALL: [ChangeKind; 5] = [
        ChangeKind::Created,
        ChangeKind::Changed,
        ChangeKind::Deleted,
        ChangeKind::Renamed,
        ChangeKind::Existing,
    ];

    /// Bit used for this kind in a forwarding mask.
    pub fn bit(self) -> u8 {
        match self {
            ChangeKind::Created => 1 << 0,
            ChangeKind::Changed => 1 << 1,
            ChangeKind::Deleted => 1 << 2,
            ChangeKind::Renamed => 1 << 3,
            ChangeKind::Existing => 1 << 4,
        }
    }

    /// Past-tense description used in log lines.
    pub fn verb(self) -> &'static str {
        match self {
            ChangeKind::Created => "created",
            ChangeKind::Changed => "changed",
            ChangeKind::Deleted => "deleted",
            ChangeKind::Renamed => "renamed",
            ChangeKind::Existing => "found",
        }
    }
}

/// A normalized filesystem change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    /// Directory containing the affected entry.
    pub directory: PathBuf,
    /// File name of the affected entry (the new name for renames).
    pub name: String,
    /// Previous file name. Only set for renames, and only when the backend
    /// reported both halves of the rename.
    pub old_name: Option<String>,
}

impl ChangeEvent {
    /// Builds an event from a full path. Returns `None` for paths without a
    /// file name component (e.g. `/` or `..`).
    pub fn from_path(kind: ChangeKind, path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_string_lossy().into_owned();
        let directory = path.parent().map(Path::to_path_buf).unwrap_or_default();
        Some(Self {
            kind,
            directory,
            name,
            old_name: None,
        })
    }

    /// Builds a rename event from the old and new full paths.
    pub fn renamed(from: &Path, to: &Path) -> Option<Self> {
        let mut event = Self::from_path(ChangeKind::Renamed, to)?;
        event.old_name = from.file_name().map(|n| n.to_string_lossy().into_owned());
        Some(event)
    }

    pub fn full_path(&self) -> PathBuf {
        self.directory.join(&self.name)
    }
}

/// Messages consumed by the supervisor's event loop.
#[derive(Debug)]
pub enum DaemonEvent {
    /// A watcher belonging to the given orchestrator generation reported an error.
    WatcherFault { generation: u64, message: String },
    /// Ctrl+C received; stop all watchers and exit.
    Shutdown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_path_splits_directory_and_name() {
        let event = ChangeEvent::from_path(ChangeKind::Created, Path::new("/scans/bob/x.pdf")).unwrap();
        assert_eq!(event.directory, PathBuf::from("/scans/bob"));
        assert_eq!(event.name, "x.pdf");
        assert!(event.old_name.is_none());
        assert_eq!(event.full_path(), PathBuf::from("/scans/bob/x.pdf"));
    }

    #[test]
    fn from_path_rejects_root() {
        assert!(ChangeEvent::from_path(ChangeKind::Created, Path::new("/")).is_none());
    }

    #[test]
    fn renamed_keeps_old_name() {
        let event = ChangeEvent::renamed(
            Path::new("/scans/bob/scan.tmp"),
            Path::new("/scans/bob/scan.pdf"),
        )
        .unwrap();
        assert_eq!(event.kind, ChangeKind::Renamed);
        assert_eq!(event.name, "scan.pdf");
        assert_eq!(event.old_name.as_deref(), Some("scan.tmp"));
    }

    #[test]
    fn kind_bits_are_distinct() {
        let combined = ChangeKind::ALL.iter().fold(0u8, |acc, k| {
            assert_eq!(acc & k.bit(), 0);
            acc | k.bit()
        });
        assert_eq!(combined.count_ones(), 5);
    }
}
