/// Raw filesystem notifications and the sink that feeds them into a watcher's
/// queue.
///
/// A [`NotificationSource`] is started once per enable cycle with a fresh
/// [`SourceSink`] bound to that cycle's queue, and stopped when the watcher is
/// disabled. The production backend is [`NotifySource`], which wraps the
/// platform watcher from the `notify` crate. Backends call the sink from their
/// own thread; the sink only ever does a non-blocking enqueue.
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use anyhow::{Context, Result};
use notify::event::{ModifyKind, RenameMode};
use notify::{Config as NotifyConfig, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::debug;

use crate::error::{EnqueueError, WatchError};
use crate::event::{ChangeEvent, ChangeKind};
use crate::filter::FileFilter;
use crate::queue::EventSender;
use crate::subscriptions::{report_error, KindMask, Subscriptions};

/// What a source should watch.
#[derive(Debug, Clone)]
pub struct SourceSpec {
    pub root: PathBuf,
    pub recursive: bool,
    /// Size hint for the backend's own kernel/event buffer, in bytes.
    pub internal_buffer_size: usize,
}

/// Destination for raw notifications during one enable cycle.
#[derive(Clone)]
pub struct SourceSink {
    queue: EventSender,
    filter: FileFilter,
    mask: KindMask,
    subscriptions: Arc<RwLock<Subscriptions>>,
}

impl SourceSink {
    pub fn new(
        queue: EventSender,
        filter: FileFilter,
        mask: KindMask,
        subscriptions: Arc<RwLock<Subscriptions>>,
    ) -> Self {
        Self {
            queue,
            filter,
            mask,
            subscriptions,
        }
    }

    /// Enqueues `event` if someone listens for its kind and its name passes the
    /// filter. A full queue drops the event and reports an overflow.
    pub fn deliver(&self, event: ChangeEvent) {
        if !self.mask.forwards(event.kind) || !self.accepts(&event) {
            return;
        }
        match self.queue.try_enqueue(event) {
            Ok(()) => {}
            Err(EnqueueError::Full { capacity }) => {
                report_error(&self.subscriptions, &WatchError::Overflow { capacity });
            }
            Err(EnqueueError::Closed) => {
                debug!("Dropping event for a released queue");
            }
        }
    }

    /// Reports a backend failure to the watcher's error handlers.
    pub fn fault(&self, err: notify::Error) {
        report_error(&self.subscriptions, &WatchError::Source(err));
    }

    fn accepts(&self, event: &ChangeEvent) -> bool {
        self.filter.matches(&event.name)
            || event
                .old_name
                .as_deref()
                .is_some_and(|old| self.filter.matches(old))
    }
}

/// The OS-level watch primitive behind a buffered watcher.
pub trait NotificationSource: Send {
    /// Begins delivering notifications for `spec` into `sink`.
    fn start(&mut self, spec: &SourceSpec, sink: SourceSink) -> Result<()>;
    /// Stops delivery. Must be idempotent.
    fn stop(&mut self);
    fn is_running(&self) -> bool;
}

/// [`NotificationSource`] backed by `notify::RecommendedWatcher`.
#[derive(Default)]
pub struct NotifySource {
    watcher: Option<RecommendedWatcher>,
}

impl NotifySource {
    pub fn new() -> Self {
        Self::default()
    }
}

impl NotificationSource for NotifySource {
    fn start(&mut self, spec: &SourceSpec, sink: SourceSink) -> Result<()> {
        self.stop();

        // inotify, FSEvents and ReadDirectoryChangesW size their buffers
        // internally; notify exposes no knob for it.
        debug!(
            "Starting notify watcher on {} (buffer hint {} bytes)",
            spec.root.display(),
            spec.internal_buffer_size
        );

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<notify::Event>| match res {
                Ok(event) => {
                    for change in normalize(&event) {
                        sink.deliver(change);
                    }
                }
                Err(e) => sink.fault(e),
            },
            NotifyConfig::default(),
        )
        .context("Failed to create file watcher")?;

        let mode = if spec.recursive {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };
        watcher
            .watch(&spec.root, mode)
            .with_context(|| format!("Failed to watch {}", spec.root.display()))?;

        self.watcher = Some(watcher);
        Ok(())
    }

    fn stop(&mut self) {
        // Dropping the watcher unregisters it and joins its event thread.
        self.watcher = None;
    }

    fn is_running(&self) -> bool {
        self.watcher.is_some()
    }
}

/// Maps a `notify` event onto zero or more [`ChangeEvent`]s.
///
/// Rename halves (`From`/`To`) are reported by some backends in addition to a
/// paired `Both` event; only `Both` and unpaired `To` halves become renames.
pub fn normalize(event: &notify::Event) -> Vec<ChangeEvent> {
    let per_path = |kind: ChangeKind| -> Vec<ChangeEvent> {
        event
            .paths
            .iter()
            .filter_map(|p| ChangeEvent::from_path(kind, p))
            .collect()
    };

    match event.kind {
        EventKind::Create(_) => per_path(ChangeKind::Created),
        EventKind::Remove(_) => per_path(ChangeKind::Deleted),
        EventKind::Modify(ModifyKind::Name(mode)) => match mode {
            RenameMode::Both => match event.paths.as_slice() {
                [from, to, ..] => ChangeEvent::renamed(from, to).into_iter().collect(),
                _ => per_path(ChangeKind::Renamed),
            },
            RenameMode::To => per_path(ChangeKind::Renamed),
            RenameMode::From => Vec::new(),
            // FSEvents reports both sides as `Any`; keep the side that exists.
            RenameMode::Any | RenameMode::Other => event
                .paths
                .iter()
                .filter(|p| p.exists())
                .filter_map(|p| ChangeEvent::from_path(ChangeKind::Renamed, p))
                .collect(),
        },
        EventKind::Modify(_) => per_path(ChangeKind::Changed),
        EventKind::Access(_) | EventKind::Any | EventKind::Other => Vec::new(),
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, DataChange, RemoveKind};
    use std::path::Path;
    use tokio_util::sync::CancellationToken;

    fn event(kind: EventKind, paths: &[&str]) -> notify::Event {
        let mut e = notify::Event::new(kind);
        for p in paths {
            e = e.add_path(PathBuf::from(p));
        }
        e
    }

    // ── normalize ─────────────────────────────────────────────────────────────

    #[test]
    fn create_maps_to_created() {
        let out = normalize(&event(EventKind::Create(CreateKind::File), &["/r/alice/a.pdf"]));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].kind, ChangeKind::Created);
        assert_eq!(out[0].name, "a.pdf");
    }

    #[test]
    fn data_modify_maps_to_changed_and_remove_to_deleted() {
        let changed = normalize(&event(
            EventKind::Modify(ModifyKind::Data(DataChange::Content)),
            &["/r/a.pdf"],
        ));
        assert_eq!(changed[0].kind, ChangeKind::Changed);

        let deleted = normalize(&event(EventKind::Remove(RemoveKind::File), &["/r/a.pdf"]));
        assert_eq!(deleted[0].kind, ChangeKind::Deleted);
    }

    #[test]
    fn paired_rename_carries_old_name() {
        let out = normalize(&event(
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
            &["/r/bob/scan.tmp", "/r/bob/scan.pdf"],
        ));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].kind, ChangeKind::Renamed);
        assert_eq!(out[0].name, "scan.pdf");
        assert_eq!(out[0].old_name.as_deref(), Some("scan.tmp"));
    }

    #[test]
    fn rename_from_half_is_ignored() {
        let out = normalize(&event(
            EventKind::Modify(ModifyKind::Name(RenameMode::From)),
            &["/r/bob/scan.tmp"],
        ));
        assert!(out.is_empty());
    }

    #[test]
    fn access_events_are_ignored() {
        let out = normalize(&event(
            EventKind::Access(notify::event::AccessKind::Any),
            &["/r/a.pdf"],
        ));
        assert!(out.is_empty());
    }

    // ── sink ──────────────────────────────────────────────────────────────────

    fn sink_with(
        capacity: Option<usize>,
        topic: crate::subscriptions::Topic,
    ) -> (SourceSink, crate::queue::EventDrain, Arc<RwLock<Subscriptions>>) {
        let mut subs = Subscriptions::new();
        subs.subscribe(topic, crate::subscriptions::event_handler(|_| Ok(())));
        let mask = subs.mask();
        let subs = Arc::new(RwLock::new(subs));
        let (tx, rx) = crate::queue::channel(capacity, CancellationToken::new());
        let sink = SourceSink::new(tx, FileFilter::new("*.pdf").unwrap(), mask, Arc::clone(&subs));
        (sink, rx, subs)
    }

    fn created(path: &str) -> ChangeEvent {
        ChangeEvent::from_path(ChangeKind::Created, Path::new(path)).unwrap()
    }

    #[tokio::test]
    async fn sink_drops_unsubscribed_kinds_and_filtered_names() {
        use crate::subscriptions::Topic;
        let (sink, mut rx, _subs) = sink_with(None, Topic::Kind(ChangeKind::Created));
        sink.deliver(ChangeEvent::from_path(ChangeKind::Deleted, Path::new("/r/x.pdf")).unwrap());
        sink.deliver(created("/r/x.jpg"));
        sink.deliver(created("/r/y.pdf"));
        assert_eq!(rx.next().await.unwrap().name, "y.pdf");
    }

    #[tokio::test]
    async fn sink_accepts_rename_when_old_name_matches() {
        use crate::subscriptions::Topic;
        let (sink, mut rx, _subs) = sink_with(None, Topic::Kind(ChangeKind::Renamed));
        let event = ChangeEvent::renamed(Path::new("/r/a.pdf"), Path::new("/r/a.bak")).unwrap();
        sink.deliver(event);
        assert_eq!(rx.next().await.unwrap().old_name.as_deref(), Some("a.pdf"));
    }

    #[test]
    fn sink_reports_one_overflow_per_rejected_event() {
        use crate::subscriptions::{error_handler, Topic};
        use std::sync::atomic::{AtomicUsize, Ordering};

        let (sink, _rx, subs) = sink_with(Some(1), Topic::Kind(ChangeKind::Created));
        let overflows = Arc::new(AtomicUsize::new(0));
        {
            let overflows = Arc::clone(&overflows);
            subs.write().unwrap().subscribe_error(error_handler(move |e| {
                if matches!(e, WatchError::Overflow { capacity: 1 }) {
                    overflows.fetch_add(1, Ordering::SeqCst);
                }
            }));
        }
        sink.deliver(created("/r/a.pdf"));
        sink.deliver(created("/r/b.pdf"));
        sink.deliver(created("/r/c.pdf"));
        assert_eq!(overflows.load(Ordering::SeqCst), 2);
    }

    // ── NotifySource ──────────────────────────────────────────────────────────

    #[test]
    fn notify_source_fails_on_missing_root() {
        use crate::subscriptions::Topic;
        let (sink, _rx, _subs) = sink_with(None, Topic::Kind(ChangeKind::Created));
        let spec = SourceSpec {
            root: PathBuf::from("/definitely/not/here/scan-sorter"),
            recursive: true,
            internal_buffer_size: 8192,
        };
        let mut source = NotifySource::new();
        assert!(source.start(&spec, sink).is_err());
        assert!(!source.is_running());
    }

    #[test]
    fn notify_source_start_and_stop() {
        use crate::subscriptions::Topic;
        let dir = tempfile::tempdir().unwrap();
        let (sink, _rx, _subs) = sink_with(None, Topic::Kind(ChangeKind::Created));
        let spec = SourceSpec {
            root: dir.path().to_path_buf(),
            recursive: false,
            internal_buffer_size: 8192,
        };
        let mut source = NotifySource::new();
        source.start(&spec, sink).unwrap();
        assert!(source.is_running());
        source.stop();
        source.stop();
        assert!(!source.is_running());
    }
}
