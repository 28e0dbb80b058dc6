/// Scan sorting: one buffered watcher per configured filter, all on the same
/// root, started and stopped as a set.
///
/// New, renamed and pre-existing files are handed to the relocation pipeline
/// on the blocking pool. Any watcher error is forwarded to the supervisor as a
/// [`DaemonEvent::WatcherFault`] tagged with the generation of the set that
/// raised it.
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::config::WatchConfig;
use crate::error::WatchError;
use crate::event::{ChangeEvent, DaemonEvent};
use crate::relocate::{settle_and_relocate, Relocator};
use crate::source::{NotificationSource, NotifySource};
use crate::stability::StabilityPolicy;
use crate::watcher::{BufferedWatcher, WatcherOptions};

/// Builds the notification source for each new watcher.
pub type SourceFactory = Arc<dyn Fn() -> Box<dyn NotificationSource> + Send + Sync>;

pub struct SortingOrchestrator {
    watch: WatchConfig,
    mover: MoveDispatch,
    faults: mpsc::UnboundedSender<DaemonEvent>,
    sources: SourceFactory,
    generation: u64,
    watchers: Vec<BufferedWatcher>,
}

impl SortingOrchestrator {
    pub fn new(
        watch: WatchConfig,
        relocator: Relocator,
        policy: StabilityPolicy,
        faults: mpsc::UnboundedSender<DaemonEvent>,
    ) -> Self {
        let sources: SourceFactory =
            Arc::new(|| -> Box<dyn NotificationSource> { Box::new(NotifySource::new()) });
        Self::with_sources(watch, relocator, policy, faults, sources)
    }

    pub fn with_sources(
        watch: WatchConfig,
        relocator: Relocator,
        policy: StabilityPolicy,
        faults: mpsc::UnboundedSender<DaemonEvent>,
        sources: SourceFactory,
    ) -> Self {
        Self {
            watch,
            mover: MoveDispatch {
                relocator: Arc::new(relocator),
                policy: Arc::new(policy),
            },
            faults,
            sources,
            generation: 0,
            watchers: Vec::new(),
        }
    }

    /// Identifies the current watcher set. Bumped by every `start`.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn watcher_count(&self) -> usize {
        self.watchers.len()
    }

    pub fn is_running(&self) -> bool {
        !self.watchers.is_empty() && self.watchers.iter().all(BufferedWatcher::enabled)
    }

    /// Replaces the watcher set with a fresh one and enables every member.
    /// The first enable failure is returned; watchers already enabled are
    /// released.
    pub fn start(&mut self) -> Result<()> {
        self.release();
        self.generation += 1;

        for filter in self.watch.filters.iter().filter(|f| !f.trim().is_empty()) {
            let mut watcher = self.build_watcher(filter)?;
            if let Err(e) = watcher.set_enabled(true) {
                self.release();
                return Err(e);
            }
            info!("Watcher with filter {filter} started");
            self.watchers.push(watcher);
        }

        info!("Scan sorter started");
        Ok(())
    }

    /// Disables and releases every watcher. Calling it again is harmless.
    /// Relocations already handed off keep running.
    pub fn stop(&mut self) {
        if self.watchers.is_empty() {
            return;
        }
        self.release();
        info!("Scan sorter stopped");
    }

    fn release(&mut self) {
        for mut watcher in self.watchers.drain(..) {
            // Disabling never fails.
            let _ = watcher.set_enabled(false);
        }
    }

    fn build_watcher(&self, filter: &str) -> Result<BufferedWatcher> {
        let options = WatcherOptions {
            root: self.watch.root_path.clone(),
            filter: filter.to_string(),
            recursive: true,
            internal_buffer_size: self.watch.internal_buffer_size,
            max_queued_events: self.watch.event_queue_capacity,
            oldest_first: self.watch.oldest_first,
        };
        let watcher = BufferedWatcher::with_source(options, (self.sources)())
            .with_context(|| format!("Invalid watch filter '{filter}'"))?;

        watcher.on_created(self.mover.handler());
        watcher.on_renamed(self.mover.handler());
        watcher.on_existed(self.mover.handler());

        let faults = self.faults.clone();
        let generation = self.generation;
        let filter = filter.to_string();
        watcher.on_error(move |e: &WatchError| {
            error!("Watcher with filter {filter} failed: {e}");
            let fault = DaemonEvent::WatcherFault {
                generation,
                message: e.to_string(),
            };
            if faults.send(fault).is_err() {
                debug!("Supervisor gone; fault not forwarded");
            }
        });
        Ok(watcher)
    }
}

impl Drop for SortingOrchestrator {
    fn drop(&mut self) {
        self.release();
    }
}

type MoveHandler = Box<dyn Fn(&ChangeEvent) -> anyhow::Result<()> + Send + Sync>;

/// Hands candidate files to a relocation unit on the blocking pool.
#[derive(Clone)]
struct MoveDispatch {
    relocator: Arc<Relocator>,
    policy: Arc<StabilityPolicy>,
}

impl MoveDispatch {
    fn handler(&self) -> MoveHandler {
        let mover = self.clone();
        Box::new(move |event: &ChangeEvent| {
            mover.submit(event);
            Ok(())
        })
    }

    fn submit(&self, event: &ChangeEvent) {
        let path = event.full_path();
        if is_within(&path, self.relocator.quarantine()) {
            debug!("Ignoring {} inside quarantine", path.display());
            return;
        }
        // New drop folders arrive as events too.
        if path.is_dir() {
            debug!("Ignoring directory {}", path.display());
            return;
        }
        info!("File {} {}", path.display(), event.kind.verb());
        let relocator = Arc::clone(&self.relocator);
        let policy = Arc::clone(&self.policy);
        // Detached: a unit outlives the watcher set that submitted it.
        let _unit = tokio::task::spawn_blocking(move || {
            settle_and_relocate(&relocator, &policy, &path);
        });
    }
}

/// Component-wise prefix check, so `/q2/a.pdf` is not inside `/q`.
fn is_within(path: &Path, dir: &Path) -> bool {
    path.starts_with(dir)
}
