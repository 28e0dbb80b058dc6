/// Handler registry for a buffered watcher.
///
/// Handlers are grouped by [`Topic`]. Each topic keeps an ordered list, and the
/// list length doubles as the topic's reference count: the first registration
/// for a topic sets its bit in the shared [`KindMask`], removing the last one
/// clears it. The notification source consults the mask before enqueueing so
/// kinds nobody listens to never reach the queue.
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use tracing::error;

use crate::error::WatchError;
use crate::event::{ChangeEvent, ChangeKind};

pub type EventHandler = Arc<dyn Fn(&ChangeEvent) -> anyhow::Result<()> + Send + Sync>;
pub type ErrorHandler = Arc<dyn Fn(&WatchError) + Send + Sync>;

pub fn event_handler<F>(f: F) -> EventHandler
where
    F: Fn(&ChangeEvent) -> anyhow::Result<()> + Send + Sync + 'static,
{
    Arc::new(f)
}

pub fn error_handler<F>(f: F) -> ErrorHandler
where
    F: Fn(&WatchError) + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Opaque handle returned by every registration, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// A handler list an event handler can be registered on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Kind(ChangeKind),
    All,
}

impl Topic {
    fn bit(self) -> u8 {
        match self {
            Topic::Kind(kind) => kind.bit(),
            Topic::All => ALL_BIT,
        }
    }
}

const ALL_BIT: u8 = 1 << 7;

/// Lock-free view of which kinds currently have listeners.
#[derive(Debug, Clone, Default)]
pub struct KindMask(Arc<AtomicU8>);

impl KindMask {
    /// Whether a live event of `kind` should be forwarded into the queue.
    /// An "all" subscription forwards every live kind.
    pub fn forwards(&self, kind: ChangeKind) -> bool {
        let bits = self.0.load(Ordering::Acquire);
        bits & (ALL_BIT | kind.bit()) != 0
    }

    fn set(&self, bit: u8) {
        self.0.fetch_or(bit, Ordering::AcqRel);
    }

    fn clear(&self, bit: u8) {
        self.0.fetch_and(!bit, Ordering::AcqRel);
    }
}

#[derive(Default)]
pub struct Subscriptions {
    next_id: u64,
    event_handlers: HashMap<Topic, Vec<(HandlerId, EventHandler)>>,
    error_handlers: Vec<(HandlerId, ErrorHandler)>,
    mask: KindMask,
}

impl Subscriptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, topic: Topic, handler: EventHandler) -> HandlerId {
        let id = self.allocate_id();
        let list = self.event_handlers.entry(topic).or_default();
        list.push((id, handler));
        if list.len() == 1 {
            self.mask.set(topic.bit());
        }
        id
    }

    pub fn subscribe_error(&mut self, handler: ErrorHandler) -> HandlerId {
        let id = self.allocate_id();
        self.error_handlers.push((id, handler));
        id
    }

    /// Removes the handler registered under `id`. Returns `false` if no such
    /// handler exists.
    pub fn unsubscribe(&mut self, id: HandlerId) -> bool {
        if let Some(pos) = self.error_handlers.iter().position(|(h, _)| *h == id) {
            self.error_handlers.remove(pos);
            return true;
        }
        for (topic, list) in self.event_handlers.iter_mut() {
            if let Some(pos) = list.iter().position(|(h, _)| *h == id) {
                list.remove(pos);
                if list.is_empty() {
                    self.mask.clear(topic.bit());
                }
                return true;
            }
        }
        false
    }

    /// Number of handlers currently registered on `topic`.
    pub fn count(&self, topic: Topic) -> usize {
        self.event_handlers.get(&topic).map_or(0, Vec::len)
    }

    pub fn has(&self, topic: Topic) -> bool {
        self.count(topic) > 0
    }

    /// Snapshot of the handlers on `topic`, in registration order.
    pub fn handlers(&self, topic: Topic) -> Vec<EventHandler> {
        self.event_handlers
            .get(&topic)
            .map(|list| list.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default()
    }

    pub fn error_handlers(&self) -> Vec<ErrorHandler> {
        self.error_handlers.iter().map(|(_, h)| Arc::clone(h)).collect()
    }

    pub fn mask(&self) -> KindMask {
        self.mask.clone()
    }

    fn allocate_id(&mut self) -> HandlerId {
        self.next_id += 1;
        HandlerId(self.next_id)
    }
}

/// Hands `err` to every registered error handler. A handler that panics is
/// logged and skipped so the remaining handlers still run.
pub fn report_error(subs: &RwLock<Subscriptions>, err: &WatchError) {
    let handlers = subs
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .error_handlers();
    for handler in handlers {
        if panic::catch_unwind(AssertUnwindSafe(|| handler(err))).is_err() {
            error!("Error handler panicked while handling: {err}");
        }
    }
}
