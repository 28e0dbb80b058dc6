use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::event::DaemonEvent;
use crate::sorter::SortingOrchestrator;
use crate::status::{write_status, DaemonState, DaemonStatus};

/// Pause between attempts when rebuilding the watcher set keeps failing.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Owns the orchestrator and applies the restart policy: any fault from the
/// current watcher set stops the whole set and starts a fresh one.
pub struct Supervisor {
    sorter: SortingOrchestrator,
    status_path: PathBuf,
    status: DaemonStatus,
    retry_delay: Duration,
}

impl Supervisor {
    pub fn new(sorter: SortingOrchestrator, status_path: PathBuf) -> Self {
        Self {
            sorter,
            status_path,
            status: DaemonStatus::new(),
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    /// First start of the watcher set. A failure here is fatal to the daemon.
    pub fn start(&mut self) -> Result<()> {
        self.status.state = DaemonState::Starting;
        self.publish();
        if let Err(e) = self.sorter.start() {
            self.status.state = DaemonState::Stopped;
            self.status.last_error = Some(format!("{e:#}"));
            self.publish();
            return Err(e);
        }
        self.status.state = DaemonState::Running;
        self.status.watchers = self.sorter.watcher_count();
        self.publish();
        Ok(())
    }

    /// Processes daemon events until shutdown, then stops every watcher.
    /// Returns the final status.
    pub async fn run(mut self, mut events: mpsc::UnboundedReceiver<DaemonEvent>) -> DaemonStatus {
        while let Some(evt) = events.recv().await {
            match evt {
                DaemonEvent::WatcherFault {
                    generation,
                    message,
                } => {
                    if generation != self.sorter.generation() {
                        debug!("Ignoring fault from retired watcher set {generation}: {message}");
                        continue;
                    }
                    warn!("Restarting watchers after fault: {message}");
                    self.status.last_error = Some(message);
                    if !self.restart(&mut events).await {
                        break;
                    }
                }
                DaemonEvent::Shutdown => break,
            }
        }

        info!("Shutting down");
        self.sorter.stop();
        self.status.state = DaemonState::Stopped;
        self.status.watchers = 0;
        self.publish();
        self.status
    }

    /// Stops and restarts the watcher set until a start succeeds. Returns
    /// `false` if shutdown was requested while waiting to retry.
    async fn restart(&mut self, events: &mut mpsc::UnboundedReceiver<DaemonEvent>) -> bool {
        loop {
            self.status.state = DaemonState::Restarting;
            self.status.watchers = 0;
            self.publish();

            self.sorter.stop();
            match self.sorter.start() {
                Ok(()) => {
                    self.status.record_restart(self.sorter.watcher_count());
                    self.publish();
                    return true;
                }
                Err(e) => {
                    error!("Failed to restart watchers: {e:#}");
                    self.status.last_error = Some(format!("{e:#}"));
                    self.publish();
                }
            }

            let retry = tokio::time::sleep(self.retry_delay);
            tokio::pin!(retry);
            loop {
                tokio::select! {
                    _ = &mut retry => break,
                    evt = events.recv() => match evt {
                        // A retry is already pending.
                        Some(DaemonEvent::WatcherFault { .. }) => {}
                        Some(DaemonEvent::Shutdown) | None => return false,
                    },
                }
            }
        }
    }

    fn publish(&self) {
        write_status(&self.status_path, &self.status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WatchConfig;
    use crate::directory::HomeDirectoryResolver;
    use crate::event::{ChangeEvent, ChangeKind};
    use crate::relocate::Relocator;
    use crate::sorter::SourceFactory;
    use crate::source::testing::ManualSource;
    use crate::source::NotificationSource;
    use crate::stability::StabilityPolicy;
    use crate::watcher::DEFAULT_INTERNAL_BUFFER_SIZE;
    use std::path::Path;
    use std::sync::{Arc, Mutex};

    struct NoHomes;

    impl HomeDirectoryResolver for NoHomes {
        fn resolve_home_directory(&self, _user: &str) -> Option<PathBuf> {
            None
        }
    }

    type Sources = Arc<Mutex<Vec<ManualSource>>>;

    /// Manual sources; the creation numbers listed in `failing` (1-based)
    /// refuse to start.
    fn sources(failing: &'static [usize]) -> (SourceFactory, Sources) {
        let created: Sources = Arc::default();
        let record = Arc::clone(&created);
        let factory: SourceFactory = Arc::new(move || -> Box<dyn NotificationSource> {
            let mut all = record.lock().unwrap();
            let source = if failing.contains(&(all.len() + 1)) {
                ManualSource::failing()
            } else {
                ManualSource::new()
            };
            all.push(source.clone());
            Box::new(source)
        });
        (factory, created)
    }

    struct Harness {
        _dir: tempfile::TempDir,
        root: PathBuf,
        quarantine: PathBuf,
        status_path: PathBuf,
        tx: mpsc::UnboundedSender<DaemonEvent>,
        rx: mpsc::UnboundedReceiver<DaemonEvent>,
        sorter: SortingOrchestrator,
    }

    fn harness(filters: &[&str], factory: SourceFactory) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("scans");
        let quarantine = dir.path().join("quarantine");
        std::fs::create_dir_all(&root).unwrap();
        let watch = WatchConfig {
            root_path: root.clone(),
            filters: filters.iter().map(|f| f.to_string()).collect(),
            event_queue_capacity: None,
            oldest_first: false,
            internal_buffer_size: DEFAULT_INTERNAL_BUFFER_SIZE,
        };
        let relocator = Relocator::new("Scan", &quarantine, Arc::new(NoHomes));
        let policy = StabilityPolicy {
            poll_interval: Duration::from_millis(20),
            max_wait: None,
        };
        let (tx, rx) = mpsc::unbounded_channel();
        let sorter = SortingOrchestrator::with_sources(watch, relocator, policy, tx.clone(), factory);
        Harness {
            status_path: dir.path().join("status.toml"),
            _dir: dir,
            root,
            quarantine,
            tx,
            rx,
            sorter,
        }
    }

    /// `None` while the file is missing or half written.
    fn read_status(path: &Path) -> Option<DaemonStatus> {
        toml::from_str(&std::fs::read_to_string(path).ok()?).ok()
    }

    async fn wait_until(cond: impl Fn() -> bool) {
        for _ in 0..500 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn start_publishes_running_status() {
        let (factory, _) = sources(&[]);
        let h = harness(&["*.pdf", "*.jpg"], factory);
        let mut supervisor = Supervisor::new(h.sorter, h.status_path.clone());
        supervisor.start().unwrap();

        let status = read_status(&h.status_path).unwrap();
        assert_eq!(status.state, DaemonState::Running);
        assert_eq!(status.watchers, 2);
        assert_eq!(status.restarts, 0);
    }

    #[tokio::test]
    async fn failed_first_start_is_returned() {
        let (factory, _) = sources(&[1]);
        let h = harness(&["*.pdf"], factory);
        let mut supervisor = Supervisor::new(h.sorter, h.status_path.clone());
        assert!(supervisor.start().is_err());
        assert_eq!(read_status(&h.status_path).unwrap().state, DaemonState::Stopped);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn faults_from_two_watchers_cause_a_single_restart() {
        let (factory, created) = sources(&[]);
        let h = harness(&["*.pdf", "*.jpg"], factory);
        let mut supervisor = Supervisor::new(h.sorter, h.status_path.clone());
        supervisor.start().unwrap();
        let task = tokio::spawn(supervisor.run(h.rx));

        let first_set: Vec<ManualSource> = created.lock().unwrap().clone();
        first_set[0].fault("inotify queue overflow");
        first_set[1].fault("inotify queue overflow");

        wait_until(|| created.lock().unwrap().len() == 4).await;
        wait_until(|| {
            read_status(&h.status_path).is_some_and(|s| s.state == DaemonState::Running && s.restarts == 1)
        })
        .await;
        assert!(first_set.iter().all(|s| !s.running()));
        let second_set: Vec<ManualSource> = created.lock().unwrap()[2..].to_vec();
        assert!(second_set.iter().all(ManualSource::running));

        // The rebuilt set still sorts new files, each exactly once.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let ghost = h.root.join("ghost");
        std::fs::create_dir_all(&ghost).unwrap();
        let scan = ghost.join("late.pdf");
        std::fs::write(&scan, b"x").unwrap();
        second_set[0].emit(ChangeEvent::from_path(ChangeKind::Created, &scan).unwrap());
        let quarantine = h.quarantine.clone();
        wait_until(|| std::fs::read_dir(&quarantine).map(|d| d.count()).unwrap_or(0) == 1).await;

        h.tx.send(DaemonEvent::Shutdown).unwrap();
        let status = task.await.unwrap();
        assert_eq!(status.restarts, 1);
        assert_eq!(status.state, DaemonState::Stopped);
        assert!(status.last_restart.is_some());
        assert!(status.last_error.unwrap().contains("inotify queue overflow"));
        assert_eq!(created.lock().unwrap().len(), 4);
        assert!(created.lock().unwrap().iter().all(|s| !s.running()));
        assert_eq!(std::fs::read_dir(&h.quarantine).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn stale_generation_faults_are_ignored() {
        let (factory, created) = sources(&[]);
        let h = harness(&["*.pdf"], factory);
        let mut supervisor = Supervisor::new(h.sorter, h.status_path.clone());
        supervisor.start().unwrap();
        let task = tokio::spawn(supervisor.run(h.rx));

        h.tx
            .send(DaemonEvent::WatcherFault {
                generation: 0,
                message: "old".into(),
            })
            .unwrap();
        h.tx.send(DaemonEvent::Shutdown).unwrap();

        let status = task.await.unwrap();
        assert_eq!(status.restarts, 0);
        assert_eq!(created.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failed_restart_is_retried() {
        // Creation 2 is the first watcher of the rebuilt set.
        let (factory, created) = sources(&[2]);
        let h = harness(&["*.pdf"], factory);
        let mut supervisor =
            Supervisor::new(h.sorter, h.status_path.clone()).with_retry_delay(Duration::from_millis(50));
        supervisor.start().unwrap();
        let task = tokio::spawn(supervisor.run(h.rx));

        let first = created.lock().unwrap()[0].clone();
        first.fault("watch descriptor lost");

        wait_until(|| created.lock().unwrap().len() == 3).await;
        wait_until(|| read_status(&h.status_path).is_some_and(|s| s.restarts == 1)).await;
        assert!(created.lock().unwrap()[2].running());

        h.tx.send(DaemonEvent::Shutdown).unwrap();
        let status = task.await.unwrap();
        assert_eq!(status.restarts, 1);
        assert!(status.last_error.unwrap().contains("Failed to enable watcher"));
    }

    #[tokio::test]
    async fn shutdown_while_waiting_to_retry_stops_cleanly() {
        // Every rebuild attempt fails.
        let (factory, created) = sources(&[2, 3, 4, 5, 6, 7, 8, 9, 10]);
        let h = harness(&["*.pdf"], factory);
        let mut supervisor =
            Supervisor::new(h.sorter, h.status_path.clone()).with_retry_delay(Duration::from_secs(60));
        supervisor.start().unwrap();
        let task = tokio::spawn(supervisor.run(h.rx));

        created.lock().unwrap()[0].fault("gone");
        wait_until(|| created.lock().unwrap().len() == 2).await;
        h.tx.send(DaemonEvent::Shutdown).unwrap();

        let status = task.await.unwrap();
        assert_eq!(status.state, DaemonState::Stopped);
        assert_eq!(status.restarts, 0);
        assert_eq!(read_status(&h.status_path).unwrap().state, DaemonState::Stopped);
    }
}
