//! Lifecycle notifications broadcast by the supervisor.
use std::{
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
};

use tracing::{debug, error};

/// How a server process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExitInfo {
    /// Exit code returned by the process if it terminated normally.
    pub exit_code: Option<i32>,
    /// Signal number if the process was terminated by a signal.
    pub signal: Option<i32>,
}

/// Transition announced to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// The server reported readiness.
    Started,
    /// The server process exited.
    Stopped(ExitInfo),
}

/// Identifies a subscription for later removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Handler = Arc<dyn Fn(&LifecycleEvent) + Send + Sync>;

/// Synchronous, ordered publish/subscribe channel.
///
/// Handlers run on the publishing thread in subscription order. A panicking
/// handler is logged and skipped; the remaining handlers still run. Events are
/// not replayed to late subscribers.
#[derive(Clone, Default)]
pub struct EventBus {
    handlers: Arc<Mutex<Vec<(SubscriptionId, Handler)>>>,
    next_id: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler invoked for every subsequent event.
    pub fn subscribe<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&LifecycleEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.lock_handlers().push((id, Arc::new(handler)));
        debug!("Added lifecycle subscriber {id:?}");
        id
    }

    /// Removes a handler. Returns `false` if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut handlers = self.lock_handlers();
        let before = handlers.len();
        handlers.retain(|(existing, _)| *existing != id);
        before != handlers.len()
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.lock_handlers().len()
    }

    /// Delivers `event` to every current subscriber before returning.
    pub fn publish(&self, event: LifecycleEvent) {
        // Snapshot so handlers may subscribe or unsubscribe while being called.
        let snapshot: Vec<(SubscriptionId, Handler)> = self.lock_handlers().clone();
        debug!("Publishing {event:?} to {} subscribers", snapshot.len());

        for (id, handler) in snapshot {
            if panic::catch_unwind(AssertUnwindSafe(|| handler(&event))).is_err() {
                error!("Lifecycle subscriber {id:?} panicked while handling {event:?}");
            }
        }
    }

    fn lock_handlers(&self) -> std::sync::MutexGuard<'_, Vec<(SubscriptionId, Handler)>> {
        // Handlers never run under this lock, so a poisoned guard still holds a valid list.
        self.handlers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
