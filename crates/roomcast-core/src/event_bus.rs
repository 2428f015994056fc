//! Named-event subscription and fire-and-forget dispatch.
//!
//! An [`EventBus`] maps event names to an ordered list of listeners.
//! [`EventBus::emit`] calls every listener registered at the time of the call,
//! in registration order. A listener is a closure returning a future:
//!
//! - the closure body runs synchronously inside `emit`
//! - the returned future is polled once inline; if it is still pending it is
//!   spawned on the current tokio runtime and `emit` moves on
//!
//! So a listener that never suspends completes before `emit` returns, and a
//! listener that suspends never delays the listeners after it. `emit` does not
//! await spawned work and never surfaces listener failures: panics are caught
//! and logged, and the listener table is left intact.
//!
//! Each bus owns its own table. There is no process-wide registry.

use std::collections::HashMap;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::FutureExt;
use parking_lot::Mutex;
use tracing::{debug, error, warn};

/// Boxed future returned by a listener.
pub type ListenerFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

type ListenerFn<T> = Arc<dyn Fn(T) -> ListenerFuture + Send + Sync>;

/// Handle identifying one registration, used to remove it with [`EventBus::off`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Entry<T> {
    id: ListenerId,
    once: bool,
    listener: ListenerFn<T>,
}

/// Event name → ordered listeners.
pub struct EventBus<T> {
    listeners: Mutex<HashMap<String, Vec<Entry<T>>>>,
    next_id: AtomicU64,
}

impl<T> EventBus<T>
where
    T: Clone + Send + 'static,
{
    /// Create an empty bus.
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Append a listener for `event`.
    pub fn on<F, Fut>(&self, event: impl Into<String>, listener: F) -> ListenerId
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.register(event.into(), false, boxed(listener))
    }

    /// Append a listener that runs at most once.
    ///
    /// The registration is removed before the listener is invoked, so neither
    /// a panic nor a re-entrant `emit` of the same event can run it twice.
    pub fn once<F, Fut>(&self, event: impl Into<String>, listener: F) -> ListenerId
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.register(event.into(), true, boxed(listener))
    }

    /// Register `listener` only if `event` has no listener yet.
    ///
    /// Returns `None` when a listener was already present.
    pub fn only<F, Fut>(&self, event: impl Into<String>, listener: F) -> Option<ListenerId>
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let event = event.into();
        let mut table = self.listeners.lock();
        if table.get(&event).is_some_and(|entries| !entries.is_empty()) {
            return None;
        }
        let id = self.next_id();
        table.entry(event).or_default().push(Entry {
            id,
            once: false,
            listener: boxed(listener),
        });
        Some(id)
    }

    /// Remove one registration. Returns `false` if it was not registered.
    pub fn off(&self, event: &str, id: ListenerId) -> bool {
        let mut table = self.listeners.lock();
        let Some(entries) = table.get_mut(event) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|entry| entry.id != id);
        let removed = entries.len() < before;
        if entries.is_empty() {
            let _ = table.remove(event);
        }
        removed
    }

    /// Invoke every listener currently registered for `event`.
    ///
    /// Returns how many listeners were invoked.
    pub fn emit(&self, event: &str, payload: T) -> usize {
        let snapshot: Vec<ListenerFn<T>> = {
            let mut table = self.listeners.lock();
            let Some(entries) = table.get_mut(event) else {
                return 0;
            };
            let snapshot = entries
                .iter()
                .map(|entry| Arc::clone(&entry.listener))
                .collect();
            entries.retain(|entry| !entry.once);
            if entries.is_empty() {
                let _ = table.remove(event);
            }
            snapshot
        };

        debug!(event, listeners = snapshot.len(), "emit");
        for listener in &snapshot {
            invoke(event, listener, payload.clone());
        }
        snapshot.len()
    }

    /// Number of listeners registered for `event`.
    pub fn listener_count(&self, event: &str) -> usize {
        self.listeners.lock().get(event).map_or(0, Vec::len)
    }

    /// Number of listeners across all events.
    pub fn total_listener_count(&self) -> usize {
        self.listeners.lock().values().map(Vec::len).sum()
    }

    /// Names of all events with at least one listener.
    pub fn event_names(&self) -> Vec<String> {
        self.listeners.lock().keys().cloned().collect()
    }

    /// Drop every registration on this bus.
    pub fn remove_all_listeners(&self) {
        self.listeners.lock().clear();
    }

    fn register(&self, event: String, once: bool, listener: ListenerFn<T>) -> ListenerId {
        let id = self.next_id();
        self.listeners
            .lock()
            .entry(event)
            .or_default()
            .push(Entry { id, once, listener });
        id
    }

    fn next_id(&self) -> ListenerId {
        ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }
}

impl<T> Default for EventBus<T>
where
    T: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

fn boxed<T, F, Fut>(listener: F) -> ListenerFn<T>
where
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |payload| Box::pin(listener(payload)) as ListenerFuture)
}

fn invoke<T>(event: &str, listener: &ListenerFn<T>, payload: T) {
    let started = panic::catch_unwind(AssertUnwindSafe(|| {
        let mut future = listener(payload);
        match (&mut future).now_or_never() {
            Some(()) => None,
            None => Some(future),
        }
    }));

    match started {
        Ok(None) => {}
        Ok(Some(pending)) => spawn_pending(event, pending),
        Err(panic) => {
            error!(event, panic = %panic_message(panic.as_ref()), "event listener panicked");
        }
    }
}

fn spawn_pending(event: &str, pending: ListenerFuture) {
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        warn!(event, "listener suspended outside a tokio runtime, dropping it");
        return;
    };
    let event = event.to_owned();
    let _ = runtime.spawn(async move {
        if let Err(panic) = AssertUnwindSafe(pending).catch_unwind().await {
            error!(event, panic = %panic_message(panic.as_ref()), "event listener panicked");
        }
    });
}

/// Best-effort text of a caught panic payload.
pub fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_owned()
    }
}
