//! Buffered directory watching and the scan-sorting daemon built on it.
//!
//! [`watcher::BufferedWatcher`] decouples the OS notification backend from
//! handler code through a bounded queue and a per-enable consumer task.
//! [`sorter::SortingOrchestrator`] and [`supervisor::Supervisor`] use it to move
//! new scans into their owners' home directories.

pub mod config;
pub mod directory;
pub mod error;
pub mod event;
pub mod filter;
pub mod logging;
pub mod paths;
pub mod queue;
pub mod relocate;
pub mod scan;
pub mod sorter;
pub mod source;
pub mod stability;
pub mod status;
pub mod subscriptions;
pub mod supervisor;
pub mod watcher;
