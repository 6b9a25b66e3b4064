use crate::types::notification::{ConnectionStatus, Notification};
use log::{error, trace, warn};
use std::any::Any;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use tokio::sync::watch;

/// Everything the realtime layer can tell its consumers.
#[derive(Debug, Clone)]
pub enum Event {
    /// A notification pushed by the server. Shared by every handler; clone the
    /// inner value before keeping it.
    NotificationReceived(Arc<Notification>),
    StatusChanged(ConnectionStatus),
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::NotificationReceived(_) => EventKind::Notification,
            Event::StatusChanged(_) => EventKind::Status,
        }
    }
}

/// The channel an [`Event`] is published on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Notification,
    /// Single-slot channel: subscribing replays the current status first.
    Status,
}

pub trait EventHandler: Send + Sync {
    fn handle_event(&self, event: &Event) -> anyhow::Result<()>;
}

impl<F> EventHandler for F
where
    F: Fn(&Event) -> anyhow::Result<()> + Send + Sync,
{
    fn handle_event(&self, event: &Event) -> anyhow::Result<()> {
        self(event)
    }
}

/// Outcome of a single publish call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    pub failed: usize,
}

struct Registration {
    id: u64,
    handler: Arc<dyn EventHandler>,
}

struct Registry {
    next_id: AtomicU64,
    notification: RwLock<Vec<Registration>>,
    // Guards status transitions as well as the status handler list, so a
    // replay on subscribe can never interleave with a transition.
    status: Mutex<Vec<Registration>>,
    status_tx: watch::Sender<ConnectionStatus>,
}

impl Registry {
    fn remove(&self, kind: EventKind, id: u64) -> bool {
        match kind {
            EventKind::Notification => {
                let mut handlers = self
                    .notification
                    .write()
                    .unwrap_or_else(PoisonError::into_inner);
                remove_registration(&mut handlers, id)
            }
            EventKind::Status => {
                let mut handlers = self.status.lock().unwrap_or_else(PoisonError::into_inner);
                remove_registration(&mut handlers, id)
            }
        }
    }
}

fn remove_registration(handlers: &mut Vec<Registration>, id: u64) -> bool {
    match handlers.iter().position(|r| r.id == id) {
        Some(index) => {
            handlers.remove(index);
            true
        }
        None => false,
    }
}

/// Typed publish/subscribe registry between the connection manager and its
/// consumers.
///
/// Handlers run synchronously on the publishing task, in registration order.
/// A handler that returns an error or panics is logged and skipped; the
/// remaining handlers still receive the event.
///
/// Status handlers run while the status slot is locked. They must not
/// subscribe to or unsubscribe from [`EventKind::Status`] from inside the
/// callback.
#[derive(Clone)]
pub struct EventBus {
    registry: Arc<Registry>,
}

impl EventBus {
    pub fn new() -> Self {
        let (status_tx, _) = watch::channel(ConnectionStatus::Disconnected);
        Self {
            registry: Arc::new(Registry {
                next_id: AtomicU64::new(0),
                notification: RwLock::new(Vec::new()),
                status: Mutex::new(Vec::new()),
                status_tx,
            }),
        }
    }

    /// Registers a closure for `kind`. Status subscribers are called once with
    /// the current status before this returns.
    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> Subscription
    where
        F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.subscribe_handler(kind, Arc::new(handler))
    }

    /// Registers a shared handler. Registering the same handler twice creates
    /// two independent entries.
    pub fn subscribe_handler(&self, kind: EventKind, handler: Arc<dyn EventHandler>) -> Subscription {
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);
        match kind {
            EventKind::Notification => {
                self.registry
                    .notification
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(Registration { id, handler });
            }
            EventKind::Status => {
                let mut handlers = self
                    .registry
                    .status
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                let current = *self.registry.status_tx.borrow();
                deliver(&*handler, &Event::StatusChanged(current));
                handlers.push(Registration { id, handler });
            }
        }
        trace!(target: "EventBus", "Registered handler {id} for {kind:?}");
        Subscription {
            registry: Arc::downgrade(&self.registry),
            kind,
            id,
        }
    }

    /// Delivers `event` to every handler registered for its kind.
    ///
    /// Status events are owned by the connection manager and cannot be
    /// published from here; they are dropped without reaching any handler.
    pub fn publish(&self, event: &Event) -> DispatchReport {
        match event {
            Event::NotificationReceived(_) => {
                let handlers: Vec<Arc<dyn EventHandler>> = self
                    .registry
                    .notification
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .iter()
                    .map(|r| r.handler.clone())
                    .collect();
                deliver_all(&handlers, event)
            }
            Event::StatusChanged(status) => {
                warn!(target: "EventBus", "Ignoring published status {status}, only the connection may change it");
                DispatchReport::default()
            }
        }
    }

    /// Moves the status slot to `status`. Returns `None` when the status was
    /// already current.
    pub(crate) fn set_status(&self, status: ConnectionStatus) -> Option<DispatchReport> {
        let handlers = self
            .registry
            .status
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let changed = self.registry.status_tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
        if !changed {
            return None;
        }
        let event = Event::StatusChanged(status);
        Some(deliver_all(handlers.iter().map(|r| &r.handler), &event))
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.registry.status_tx.borrow()
    }

    /// Async view of the status slot for consumers that prefer awaiting over
    /// callbacks.
    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.registry.status_tx.subscribe()
    }

    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        match kind {
            EventKind::Notification => self
                .registry
                .notification
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .len(),
            EventKind::Status => self
                .registry
                .status
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .len(),
        }
    }

    /// Drops every registration on every channel.
    pub fn clear(&self) {
        self.registry
            .notification
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.registry
            .status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("status", &self.status())
            .field(
                "notification_handlers",
                &self.subscriber_count(EventKind::Notification),
            )
            .finish()
    }
}

/// Handle for one registration. Call [`Subscription::unsubscribe`] to remove
/// it; dropping the handle leaves the handler registered.
#[must_use = "dropping a Subscription keeps the handler registered"]
#[derive(Debug)]
pub struct Subscription {
    registry: Weak<Registry>,
    kind: EventKind,
    id: u64,
}

impl Subscription {
    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// Removes exactly this registration. Returns `false` if it was already
    /// gone (for example after [`EventBus::clear`]).
    pub fn unsubscribe(self) -> bool {
        match self.registry.upgrade() {
            Some(registry) => registry.remove(self.kind, self.id),
            None => false,
        }
    }
}

fn deliver_all<'a>(
    handlers: impl IntoIterator<Item = &'a Arc<dyn EventHandler>>,
    event: &Event,
) -> DispatchReport {
    let mut report = DispatchReport::default();
    for handler in handlers {
        if deliver(&**handler, event) {
            report.delivered += 1;
        } else {
            report.failed += 1;
        }
    }
    report
}

fn deliver(handler: &dyn EventHandler, event: &Event) -> bool {
    match catch_unwind(AssertUnwindSafe(|| handler.handle_event(event))) {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            warn!(target: "EventBus", "Handler for {:?} failed: {e:#}", event.kind());
            false
        }
        Err(payload) => {
            error!(
                target: "EventBus",
                "Handler for {:?} panicked: {}",
                event.kind(),
                panic_message(payload.as_ref())
            );
            false
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}
