//! Subscriber types for the reactive system.
//!
//! A listener is a callback attached to one signal or computed. It receives
//! `(new, old)` once per transaction in which the node's value changed.
//! Listeners on the same node are called in the order they subscribed.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::warn;

use crate::graph::scheduler::FailureSink;
use crate::graph::NodeId;

/// Unique identifier for a subscriber.
///
/// Each listener or effect subscription gets a unique ID when created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

impl SubscriberId {
    /// Generate a new unique subscriber ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for SubscriberId {
    fn default() -> Self {
        Self::new()
    }
}

type Callback<T> = Box<dyn FnMut(&T, &T)>;

struct Listener<T> {
    id: SubscriberId,
    active: Cell<bool>,
    callback: RefCell<Callback<T>>,
}

/// Ordered listener list of one node.
pub(crate) struct Listeners<T> {
    entries: RefCell<Vec<Rc<Listener<T>>>>,
}

impl<T: 'static> Listeners<T> {
    pub(crate) fn new() -> Self {
        Self {
            entries: RefCell::new(Vec::new()),
        }
    }

    pub(crate) fn add(&self, callback: impl FnMut(&T, &T) + 'static) -> SubscriberId {
        let id = SubscriberId::new();
        self.entries.borrow_mut().push(Rc::new(Listener {
            id,
            active: Cell::new(true),
            callback: RefCell::new(Box::new(callback)),
        }));
        id
    }

    /// Remove a listener. Returns `false` if it was already gone.
    pub(crate) fn remove(&self, id: SubscriberId) -> bool {
        let mut entries = self.entries.borrow_mut();
        let Some(index) = entries.iter().position(|entry| entry.id == id) else {
            return false;
        };
        let entry = entries.remove(index);
        entry.active.set(false);
        true
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    /// Call every listener with `(new, old)`.
    ///
    /// The list is snapshotted first, so listeners may subscribe or
    /// unsubscribe while being notified. A listener removed during the pass
    /// is not called.
    pub(crate) fn notify(&self, node: NodeId, new: &T, old: &T, sink: &mut FailureSink) {
        let snapshot: Vec<_> = self.entries.borrow().iter().cloned().collect();
        for entry in snapshot {
            if !entry.active.get() {
                continue;
            }
            let Ok(mut callback) = entry.callback.try_borrow_mut() else {
                warn!(node = %node, "listener re-entered itself; skipped");
                continue;
            };
            sink.run(node, || {
                (&mut *callback)(new, old);
                Ok(())
            });
        }
    }
}

/// Handle to a listener or effect.
///
/// Dropping this handle unsubscribes it, so keep it alive for as long as the
/// callback should run.
#[must_use = "dropping a Subscription unsubscribes it immediately"]
pub struct Subscription {
    id: SubscriberId,
    cancel: Option<Box<dyn FnOnce()>>,
}

impl Subscription {
    pub(crate) fn new(id: SubscriberId, cancel: impl FnOnce() + 'static) -> Self {
        Self {
            id,
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Get the subscriber's unique ID.
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Stop receiving notifications.
    pub fn unsubscribe(mut self) {
        self.cancel();
    }

    fn cancel(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("active", &self.cancel.is_some())
            .finish()
    }
}
