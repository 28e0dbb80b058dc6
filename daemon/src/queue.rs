/// Ordered buffer between a notification source and a watcher's consumer task.
///
/// The producer half ([`EventSender`]) never blocks: it is called from the
/// notification backend's own thread, which must not be held up by a slow
/// consumer. When the queue is bounded and full, the event is rejected whole
/// and the caller decides how to report it.
///
/// The consumer half ([`EventDrain`]) is tied to a [`CancellationToken`].
/// Once the token fires the drain yields `None` forever; a new queue has to be
/// created for the next enable cycle.
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::EnqueueError;
use crate::event::ChangeEvent;

/// Creates a queue holding at most `capacity` events (`None` = unbounded).
/// A capacity of zero is raised to one.
pub fn channel(capacity: Option<usize>, token: CancellationToken) -> (EventSender, EventDrain) {
    match capacity {
        Some(cap) => {
            let cap = cap.max(1);
            let (tx, rx) = mpsc::channel(cap);
            (
                EventSender {
                    inner: SenderInner::Bounded(tx),
                    capacity: Some(cap),
                },
                EventDrain {
                    inner: ReceiverInner::Bounded(rx),
                    token,
                    cancelled: false,
                },
            )
        }
        None => {
            let (tx, rx) = mpsc::unbounded_channel();
            (
                EventSender {
                    inner: SenderInner::Unbounded(tx),
                    capacity: None,
                },
                EventDrain {
                    inner: ReceiverInner::Unbounded(rx),
                    token,
                    cancelled: false,
                },
            )
        }
    }
}

#[derive(Clone)]
enum SenderInner {
    Bounded(mpsc::Sender<ChangeEvent>),
    Unbounded(mpsc::UnboundedSender<ChangeEvent>),
}

enum ReceiverInner {
    Bounded(mpsc::Receiver<ChangeEvent>),
    Unbounded(mpsc::UnboundedReceiver<ChangeEvent>),
}

/// Non-blocking producer handle. Cheap to clone.
#[derive(Clone)]
pub struct EventSender {
    inner: SenderInner,
    capacity: Option<usize>,
}

impl EventSender {
    /// Appends `event`, returning `false` if it was rejected.
    pub fn enqueue(&self, event: ChangeEvent) -> bool {
        self.try_enqueue(event).is_ok()
    }

    /// Appends `event`, reporting why it was rejected.
    pub fn try_enqueue(&self, event: ChangeEvent) -> Result<(), EnqueueError> {
        match &self.inner {
            SenderInner::Bounded(tx) => tx.try_send(event).map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => EnqueueError::Full {
                    capacity: tx.max_capacity(),
                },
                mpsc::error::TrySendError::Closed(_) => EnqueueError::Closed,
            }),
            SenderInner::Unbounded(tx) => tx.send(event).map_err(|_| EnqueueError::Closed),
        }
    }

    /// The bound fixed at construction, or `None` when unbounded.
    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }
}

/// Cancellable consumer handle.
pub struct EventDrain {
    inner: ReceiverInner,
    token: CancellationToken,
    cancelled: bool,
}

impl EventDrain {
    /// Waits for the next event. Returns `None` once the drain's token has been
    /// cancelled; events still buffered at that point are never yielded.
    ///
    /// If every producer is dropped the drain keeps waiting for cancellation
    /// rather than ending early.
    pub async fn next(&mut self) -> Option<ChangeEvent> {
        if self.cancelled {
            return None;
        }
        let received = tokio::select! {
            biased;
            _ = self.token.cancelled() => None,
            event = recv(&mut self.inner) => match event {
                Some(event) => Some(event),
                None => {
                    self.token.cancelled().await;
                    None
                }
            },
        };
        if received.is_none() {
            self.cancelled = true;
        }
        received
    }
}

async fn recv(inner: &mut ReceiverInner) -> Option<ChangeEvent> {
    match inner {
        ReceiverInner::Bounded(rx) => rx.recv().await,
        ReceiverInner::Unbounded(rx) => rx.recv().await,
    }
}
