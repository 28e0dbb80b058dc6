use std::path::PathBuf;

use thiserror::Error;

use crate::event::ChangeKind;

/// Faults reported through a watcher's error handlers.
///
/// None of these stop the consumer loop; they are observations handed to
/// whoever subscribed with `on_error` (the sorter turns every one of them into
/// a restart request).
#[derive(Debug, Error)]
pub enum WatchError {
    /// The event queue was full and the triggering event was dropped.
    #[error("Event queue size {capacity} events exceeded")]
    Overflow { capacity: usize },

    /// The underlying notification backend reported a failure.
    #[error("Notification source failed: {0}")]
    Source(#[from] notify::Error),

    /// A registered handler returned an error or panicked.
    #[error("Handler for {kind:?} event on {} failed: {message}", path.display())]
    Dispatch {
        kind: ChangeKind,
        path: PathBuf,
        message: String,
    },

    /// Enumerating pre-existing files failed part-way.
    #[error("Reconciliation scan failed: {0}")]
    Scan(String),
}

/// Why an enqueue was rejected.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnqueueError {
    #[error("queue is at capacity ({capacity})")]
    Full { capacity: usize },
    #[error("queue consumer has been released")]
    Closed,
}
