/// Buffered directory watcher.
///
/// A `BufferedWatcher` owns one [`NotificationSource`], one event queue per
/// enable cycle and one consumer task per enable cycle. The source only ever
/// does a non-blocking enqueue from its own thread; the consumer task drains
/// the queue and invokes the registered handlers, so a slow handler never
/// holds up the backend.
///
/// Lifecycle: `Disabled → Enabling → Running → Disabling → Disabled`, driven
/// only through [`BufferedWatcher::set_enabled`].
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::WatchError;
use crate::event::{ChangeEvent, ChangeKind};
use crate::filter::FileFilter;
use crate::queue::{self, EventDrain};
use crate::scan::{ReconciliationScanner, ScanItem};
use crate::source::{NotificationSource, NotifySource, SourceSink, SourceSpec};
use crate::subscriptions::{
    error_handler, event_handler, report_error, EventHandler, HandlerId, Subscriptions, Topic,
};

pub const DEFAULT_INTERNAL_BUFFER_SIZE: usize = 8192;
/// How many reconciliation results may be in flight between the blocking
/// directory walk and the consumer task.
const RECONCILE_CHANNEL_SIZE: usize = 64;

#[derive(Debug, Clone)]
pub struct WatcherOptions {
    pub root: PathBuf,
    /// File-name pattern, e.g. `*.pdf`.
    pub filter: String,
    pub recursive: bool,
    pub internal_buffer_size: usize,
    /// Maximum number of undelivered events; `None` means unbounded.
    pub max_queued_events: Option<usize>,
    /// Deliver pre-existing files oldest first.
    pub oldest_first: bool,
}

impl WatcherOptions {
    pub fn new(root: impl Into<PathBuf>, filter: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            filter: filter.into(),
            recursive: false,
            internal_buffer_size: DEFAULT_INTERNAL_BUFFER_SIZE,
            max_queued_events: None,
            oldest_first: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    Disabled,
    Enabling,
    Running,
    Disabling,
}

/// Resources belonging to a single enable cycle.
struct Cycle {
    token: CancellationToken,
    consumer: JoinHandle<()>,
}

pub struct BufferedWatcher {
    options: WatcherOptions,
    filter: FileFilter,
    source: Box<dyn NotificationSource>,
    subscriptions: Arc<RwLock<Subscriptions>>,
    state: WatcherState,
    cycle: Option<Cycle>,
    live_consumers: Arc<AtomicUsize>,
}

impl BufferedWatcher {
    /// Creates a disabled watcher backed by the platform notifier.
    pub fn new(options: WatcherOptions) -> Result<Self> {
        Self::with_source(options, Box::new(NotifySource::new()))
    }

    /// Creates a disabled watcher on top of a custom notification source.
    pub fn with_source(options: WatcherOptions, source: Box<dyn NotificationSource>) -> Result<Self> {
        let filter = FileFilter::new(&options.filter)?;
        Ok(Self {
            options,
            filter,
            source,
            subscriptions: Arc::new(RwLock::new(Subscriptions::new())),
            state: WatcherState::Disabled,
            cycle: None,
            live_consumers: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn state(&self) -> WatcherState {
        self.state
    }

    pub fn enabled(&self) -> bool {
        self.state == WatcherState::Running
    }

    /// Number of consumer tasks still alive. Settles at 1 while running and 0
    /// once a disable has been observed by the task.
    pub fn live_consumers(&self) -> usize {
        self.live_consumers.load(Ordering::SeqCst)
    }

    // ── subscriptions ─────────────────────────────────────────────────────────

    pub fn on_created<F>(&self, f: F) -> HandlerId
    where
        F: Fn(&ChangeEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.subscribe(Topic::Kind(ChangeKind::Created), event_handler(f))
    }

    pub fn on_changed<F>(&self, f: F) -> HandlerId
    where
        F: Fn(&ChangeEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.subscribe(Topic::Kind(ChangeKind::Changed), event_handler(f))
    }

    pub fn on_deleted<F>(&self, f: F) -> HandlerId
    where
        F: Fn(&ChangeEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.subscribe(Topic::Kind(ChangeKind::Deleted), event_handler(f))
    }

    pub fn on_renamed<F>(&self, f: F) -> HandlerId
    where
        F: Fn(&ChangeEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.subscribe(Topic::Kind(ChangeKind::Renamed), event_handler(f))
    }

    /// Called once per file already present when the watcher is enabled.
    pub fn on_existed<F>(&self, f: F) -> HandlerId
    where
        F: Fn(&ChangeEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.subscribe(Topic::Kind(ChangeKind::Existing), event_handler(f))
    }

    /// Receives every live event, and every existing file. While any "all"
    /// handler is registered the per-kind handlers see no live events.
    pub fn on_all<F>(&self, f: F) -> HandlerId
    where
        F: Fn(&ChangeEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.subscribe(Topic::All, event_handler(f))
    }

    pub fn on_error<F>(&self, f: F) -> HandlerId
    where
        F: Fn(&WatchError) + Send + Sync + 'static,
    {
        self.write_subscriptions().subscribe_error(error_handler(f))
    }

    pub fn unsubscribe(&self, id: HandlerId) -> bool {
        self.write_subscriptions().unsubscribe(id)
    }

    fn subscribe(&self, topic: Topic, handler: EventHandler) -> HandlerId {
        self.write_subscriptions().subscribe(topic, handler)
    }

    fn write_subscriptions(&self) -> std::sync::RwLockWriteGuard<'_, Subscriptions> {
        self.subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    // ── lifecycle ─────────────────────────────────────────────────────────────

    /// Enables or disables event delivery. Setting the current value again is
    /// a no-op.
    ///
    /// Enabling must happen inside a Tokio runtime. A failure to start the
    /// notification source is returned and leaves the watcher disabled.
    pub fn set_enabled(&mut self, enabled: bool) -> Result<()> {
        if enabled == self.enabled() {
            return Ok(());
        }
        if enabled {
            self.enable()
        } else {
            self.disable();
            Ok(())
        }
    }

    fn enable(&mut self) -> Result<()> {
        self.state = WatcherState::Enabling;
        self.release_cycle();

        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(e) => {
                self.state = WatcherState::Disabled;
                return Err(e).context("Watchers must be enabled inside a Tokio runtime");
            }
        };

        let token = CancellationToken::new();
        let (sender, drain) = queue::channel(self.options.max_queued_events, token.clone());
        let mask = self
            .subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .mask();
        let sink = SourceSink::new(sender, self.filter.clone(), mask, Arc::clone(&self.subscriptions));
        let spec = SourceSpec {
            root: self.options.root.clone(),
            recursive: self.options.recursive,
            internal_buffer_size: self.options.internal_buffer_size,
        };

        // The source goes live before the consumer starts so that changes made
        // while existing files are being reconciled are buffered, not lost.
        if let Err(e) = self.source.start(&spec, sink) {
            self.state = WatcherState::Disabled;
            return Err(e).with_context(|| {
                format!(
                    "Failed to enable watcher for {} ({})",
                    self.options.root.display(),
                    self.options.filter
                )
            });
        }

        let consumer = Consumer {
            subscriptions: Arc::clone(&self.subscriptions),
            scanner: ReconciliationScanner::new(
                self.options.root.clone(),
                self.filter.clone(),
                self.options.recursive,
                self.options.oldest_first,
            ),
            token: token.clone(),
            live: Arc::clone(&self.live_consumers),
        };
        let consumer = runtime.spawn(consumer.run(drain));

        self.cycle = Some(Cycle { token, consumer });
        self.state = WatcherState::Running;
        debug!(
            "Watcher enabled on {} ({})",
            self.options.root.display(),
            self.options.filter
        );
        Ok(())
    }

    fn disable(&mut self) {
        self.state = WatcherState::Disabling;
        self.release_cycle();
        self.source.stop();
        self.state = WatcherState::Disabled;
        debug!(
            "Watcher disabled on {} ({})",
            self.options.root.display(),
            self.options.filter
        );
    }

    /// Cancels the current consumer and forgets its queue.
    fn release_cycle(&mut self) {
        if let Some(cycle) = self.cycle.take() {
            cycle.token.cancel();
            // The task exits on its own once it observes the cancellation.
            drop(cycle.consumer);
        }
    }
}

impl Drop for BufferedWatcher {
    fn drop(&mut self) {
        self.release_cycle();
        self.source.stop();
    }
}

/// Decrements the live-consumer count when the consumer task ends, however
/// it ends.
struct LiveGuard(Arc<AtomicUsize>);

impl LiveGuard {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// State moved into the consumer task of one enable cycle.
struct Consumer {
    subscriptions: Arc<RwLock<Subscriptions>>,
    scanner: ReconciliationScanner,
    token: CancellationToken,
    live: Arc<AtomicUsize>,
}

impl Consumer {
    async fn run(self, mut drain: EventDrain) {
        let _live = LiveGuard::enter(&self.live);

        let wants_existing = {
            let subs = self.read_subscriptions();
            subs.has(Topic::Kind(ChangeKind::Existing)) || subs.has(Topic::All)
        };
        if wants_existing {
            self.reconcile().await;
        }

        while let Some(event) = drain.next().await {
            self.dispatch(&event);
        }
        debug!("Consumer task stopped");
    }

    /// Streams the reconciliation scan from the blocking pool and delivers each
    /// existing file to the "existed" and "all" handlers.
    async fn reconcile(&self) {
        let (tx, mut rx) = mpsc::channel::<ScanItem>(RECONCILE_CHANNEL_SIZE);
        let scanner = self.scanner.clone();
        let token = self.token.clone();
        // Detached: the walk stops at its next send once `rx` is dropped.
        let _walk = tokio::task::spawn_blocking(move || {
            for item in scanner.scan() {
                if token.is_cancelled() || tx.blocking_send(item).is_err() {
                    break;
                }
            }
        });

        let mut delivered = 0usize;
        loop {
            let item = tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                item = rx.recv() => item,
            };
            match item {
                Some(Ok(event)) => {
                    self.deliver_existing(&event);
                    delivered += 1;
                }
                Some(Err(e)) => report_error(&self.subscriptions, &e),
                None => break,
            }
        }
        info!("Reconciled {delivered} existing file(s)");
    }

    fn deliver_existing(&self, event: &ChangeEvent) {
        let (existed, all) = {
            let subs = self.read_subscriptions();
            (
                subs.handlers(Topic::Kind(ChangeKind::Existing)),
                subs.handlers(Topic::All),
            )
        };
        for handler in existed.iter().chain(all.iter()) {
            self.invoke(handler, event);
        }
    }

    fn dispatch(&self, event: &ChangeEvent) {
        let handlers = {
            let subs = self.read_subscriptions();
            if subs.has(Topic::All) {
                subs.handlers(Topic::All)
            } else {
                subs.handlers(Topic::Kind(event.kind))
            }
        };
        for handler in &handlers {
            self.invoke(handler, event);
        }
    }

    /// Runs one handler, turning an error or a panic into a dispatch fault.
    fn invoke(&self, handler: &EventHandler, event: &ChangeEvent) {
        let message = match panic::catch_unwind(AssertUnwindSafe(|| handler(event))) {
            Ok(Ok(())) => return,
            Ok(Err(e)) => format!("{e:#}"),
            Err(payload) => panic_message(payload),
        };
        let fault = WatchError::Dispatch {
            kind: event.kind,
            path: event.full_path(),
            message,
        };
        report_error(&self.subscriptions, &fault);
    }

    fn read_subscriptions(&self) -> std::sync::RwLockReadGuard<'_, Subscriptions> {
        self.subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("handler panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("handler panicked: {s}")
    } else {
        "handler panicked".to_string()
    }
}
