use std::path::PathBuf;
use std::time::SystemTime;

use walkdir::{DirEntry, WalkDir};

use crate::error::WatchError;
use crate::event::{ChangeEvent, ChangeKind};
use crate::filter::FileFilter;

pub type ScanItem = Result<ChangeEvent, WatchError>;

/// Enumerates files already present under a watched root and turns each into
/// an [`ChangeKind::Existing`] event.
#[derive(Debug, Clone)]
pub struct ReconciliationScanner {
    root: PathBuf,
    filter: FileFilter,
    recursive: bool,
    oldest_first: bool,
}

impl ReconciliationScanner {
    pub fn new(root: PathBuf, filter: FileFilter, recursive: bool, oldest_first: bool) -> Self {
        Self {
            root,
            filter,
            recursive,
            oldest_first,
        }
    }

    /// Walks the root afresh on every call.
    ///
    /// Without `oldest_first` entries stream out in directory order. With it,
    /// all entries are collected and stable-sorted by modification time before
    /// the first one is yielded. Walk errors are yielded as items and do not end
    /// the scan.
    pub fn scan(&self) -> Box<dyn Iterator<Item = ScanItem> + Send> {
        let filter = self.filter.clone();
        let entries = self
            .walker()
            .into_iter()
            .filter_map(move |entry| match entry {
                Ok(entry) if is_candidate(&entry, &filter) => Some(Ok(entry)),
                Ok(_) => None,
                Err(e) => Some(Err(WatchError::Scan(e.to_string()))),
            });

        if !self.oldest_first {
            return Box::new(entries.map(|entry| entry.and_then(to_event)));
        }

        let mut dated: Vec<(SystemTime, DirEntry)> = Vec::new();
        let mut failures: Vec<WatchError> = Vec::new();
        for entry in entries {
            match entry.and_then(|e| modified(&e).map(|t| (t, e))) {
                Ok(pair) => dated.push(pair),
                Err(e) => failures.push(e),
            }
        }
        dated.sort_by_key(|(time, _)| *time);

        Box::new(
            dated
                .into_iter()
                .map(|(_, entry)| to_event(entry))
                .chain(failures.into_iter().map(Err)),
        )
    }

    fn walker(&self) -> WalkDir {
        let walker = WalkDir::new(&self.root).min_depth(1);
        if self.recursive {
            walker
        } else {
            walker.max_depth(1)
        }
    }
}

fn is_candidate(entry: &DirEntry, filter: &FileFilter) -> bool {
    entry.file_type().is_file() && filter.matches(&entry.file_name().to_string_lossy())
}

fn modified(entry: &DirEntry) -> Result<SystemTime, WatchError> {
    entry
        .metadata()
        .map_err(|e| WatchError::Scan(e.to_string()))?
        .modified()
        .map_err(|e| WatchError::Scan(format!("{}: {e}", entry.path().display())))
}

fn to_event(entry: DirEntry) -> ScanItem {
    ChangeEvent::from_path(ChangeKind::Existing, entry.path())
        .ok_or_else(|| WatchError::Scan(format!("Unnamed entry {}", entry.path().display())))
}
