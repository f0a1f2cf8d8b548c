//! Signal Implementation
//!
//! A Signal is the fundamental reactive primitive. It holds a value and
//! tracks which computations depend on it.
//!
//! # How Signals Work
//!
//! 1. When a signal is read within a reactive context (computed/effect), the
//!    running computation is recorded as an observer.
//!
//! 2. When a signal's value changes, direct observers are marked `Dirty` and
//!    everything further downstream `Check`.
//!
//! 3. Listeners are called once per transaction with the final value and the
//!    value from before the transaction's first write.
//!
//! # Memory Layout
//!
//! Each signal consists of:
//! - A unique ID and its observer edges
//! - The value, plus the pre-transaction value while a batch is open
//! - The ordered listener list

use std::cell::RefCell;
use std::fmt::{self, Debug};
use std::rc::{Rc, Weak};

use tracing::trace;

use super::context::ReactiveContext;
use super::runtime::{self, Reactive};
use super::subscriber::{Listeners, Subscription};
use crate::error::ReactiveError;
use crate::graph::node::{Color, NodeId, PendingNotify, SourceNode, SourceState};
use crate::graph::propagate;
use crate::graph::scheduler::FailureSink;

/// Create a signal holding `value`.
pub fn signal<T>(value: T) -> Signal<T>
where
    T: Clone + PartialEq + 'static,
{
    Signal::new(value)
}

struct SignalInner<T> {
    source: SourceState,
    value: RefCell<T>,
    /// The value before the first write of the open transaction.
    pending_old: RefCell<Option<T>>,
    listeners: Listeners<T>,
    equals: fn(&T, &T) -> bool,
}

impl<T: 'static> SourceNode for SignalInner<T> {
    fn source_state(&self) -> &SourceState {
        &self.source
    }

    fn refresh(&self) -> Result<(), ReactiveError> {
        Ok(())
    }
}

impl<T: Clone + 'static> PendingNotify for SignalInner<T> {
    fn node_id(&self) -> NodeId {
        self.source.id()
    }

    fn notify(&self, sink: &mut FailureSink) {
        let Some(old) = self.pending_old.borrow_mut().take() else {
            return;
        };
        let new = self.value.borrow().clone();
        // Written and restored inside the same transaction.
        if (self.equals)(&new, &old) {
            return;
        }
        self.listeners.notify(self.source.id(), &new, &old, sink);
    }

    fn discard(&self) {
        let stale = self.pending_old.borrow_mut().take();
        drop(stale);
    }
}

/// A reactive signal holding a value of type T.
///
/// Cloning a signal yields another handle to the same node.
///
/// # Example
///
/// ```rust
/// use zen_core::Signal;
///
/// let count = Signal::new(0);
///
/// // Read the value
/// assert_eq!(count.get(), 0);
///
/// // Update the value (notifies listeners and effects)
/// count.set(5);
/// assert_eq!(count.get(), 5);
/// ```
pub struct Signal<T: 'static> {
    inner: Rc<SignalInner<T>>,
}

impl<T> Signal<T>
where
    T: Clone + PartialEq + 'static,
{
    /// Create a new signal with the given initial value.
    ///
    /// Writes of a value equal (`PartialEq`) to the current one are ignored.
    pub fn new(value: T) -> Self {
        Self::with_equals(value, T::eq)
    }
}

impl<T> Signal<T>
where
    T: Clone + 'static,
{
    /// Create a signal that compares values with `equals`.
    ///
    /// Passing `|_, _| false` makes every write count as a change.
    pub fn with_equals(value: T, equals: fn(&T, &T) -> bool) -> Self {
        let id = NodeId::new();
        trace!(node = %id, "signal created");
        Self {
            inner: Rc::new(SignalInner {
                source: SourceState::new(id),
                value: RefCell::new(value),
                pending_old: RefCell::new(None),
                listeners: Listeners::new(),
                equals,
            }),
        }
    }

    /// Get the signal's unique ID.
    pub fn id(&self) -> NodeId {
        self.inner.source.id()
    }

    /// Get the current value.
    ///
    /// If called within a reactive context, this also registers the
    /// current computation as an observer.
    pub fn get(&self) -> T {
        self.track();
        self.inner.value.borrow().clone()
    }

    /// Get the current value without tracking dependencies.
    pub fn get_untracked(&self) -> T {
        self.inner.value.borrow().clone()
    }

    /// Borrow the current value for the duration of `f`, tracking the read.
    ///
    /// Writing this signal from inside `f` panics.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        self.track();
        f(&self.inner.value.borrow())
    }

    /// Set a new value.
    ///
    /// Outside of a batch, listeners and effects run before this returns.
    ///
    /// # Panics
    ///
    /// Panics if the resulting flush fails; use [`try_set`](Self::try_set)
    /// to get the error instead.
    pub fn set(&self, value: T) {
        if let Err(err) = self.try_set(value) {
            err.raise();
        }
    }

    /// Set a new value, reporting flush failures.
    ///
    /// A value equal to the current one is ignored without opening a
    /// transaction.
    pub fn try_set(&self, value: T) -> Result<(), ReactiveError> {
        if (self.inner.equals)(&self.inner.value.borrow(), &value) {
            return Ok(());
        }
        runtime::batch(|| self.write(value))
    }

    /// Update the value using a function of the current one.
    pub fn update(&self, f: impl FnOnce(&T) -> T) {
        let next = f(&self.inner.value.borrow());
        self.set(next);
    }

    /// Attach a listener called with `(new, old)` after each transaction
    /// that changed the value.
    ///
    /// The listener is not called on subscription.
    pub fn subscribe(&self, listener: impl FnMut(&T, &T) + 'static) -> Subscription {
        let id = self.inner.listeners.add(listener);
        let weak: Weak<SignalInner<T>> = Rc::downgrade(&self.inner);
        Subscription::new(id, move || {
            if let Some(inner) = weak.upgrade() {
                inner.listeners.remove(id);
            }
        })
    }

    /// Number of computeds and effects currently reading this signal.
    pub fn observer_count(&self) -> usize {
        self.inner.source.observer_count()
    }

    /// Number of attached listeners.
    pub fn listener_count(&self) -> usize {
        self.inner.listeners.len()
    }

    fn track(&self) {
        if ReactiveContext::is_active() {
            ReactiveContext::track(self.inner.clone());
        }
    }

    /// Store a value known to differ and mark downstream. Must run inside a
    /// transaction.
    fn write(&self, value: T) {
        let inner = &self.inner;
        let old = inner.value.replace(value);
        let first_write = {
            let mut pending = inner.pending_old.borrow_mut();
            if pending.is_none() {
                *pending = Some(old);
                true
            } else {
                false
            }
        };

        trace!(node = %inner.source.id(), first_write, "signal written");
        if first_write {
            runtime::schedule_notify(inner.clone());
        }
        propagate::mark_observers(&inner.source, Color::Dirty);
    }
}

impl<T: Clone + 'static> Reactive<T> for Signal<T> {
    fn id(&self) -> NodeId {
        Signal::id(self)
    }

    fn value(&self) -> T {
        self.get()
    }

    fn set_value(&self, value: T) -> Result<(), ReactiveError> {
        self.try_set(value)
    }

    fn subscribe(&self, listener: impl FnMut(&T, &T) + 'static) -> Subscription {
        Signal::subscribe(self, listener)
    }
}

impl<T: 'static> Clone for Signal<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T> Debug for Signal<T>
where
    T: Debug + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signal")
            .field("id", &self.inner.source.id())
            .field("value", &*self.inner.value.borrow())
            .field("observers", &self.inner.source.observer_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::{batch, Computed, Runtime};

    #[test]
    fn signal_get_and_set() {
        let signal = Signal::new(0);
        assert_eq!(signal.get(), 0);

        signal.set(42);
        assert_eq!(signal.get(), 42);
    }

    #[test]
    fn signal_update() {
        let signal = Signal::new(10);
        signal.update(|v| v + 5);
        assert_eq!(signal.get(), 15);
    }

    #[test]
    fn signal_notifies_listeners_with_old_value() {
        let signal = Signal::new(0);
        let seen = Rc::new(RefCell::new(Vec::new()));

        let _sub = signal.subscribe({
            let seen = seen.clone();
            move |new, old| seen.borrow_mut().push((*new, *old))
        });
        assert!(seen.borrow().is_empty());

        signal.set(1);
        signal.set(2);
        assert_eq!(*seen.borrow(), [(1, 0), (2, 1)]);
    }

    #[test]
    fn equal_write_is_ignored() {
        let signal = Signal::new(String::from("same"));
        let calls = Rc::new(Cell::new(0));
        let _sub = signal.subscribe({
            let calls = calls.clone();
            move |_, _| calls.set(calls.get() + 1)
        });

        let epoch = Runtime::epoch();
        signal.set(String::from("same"));
        assert_eq!(calls.get(), 0);
        assert_eq!(Runtime::epoch(), epoch);
    }

    #[test]
    fn custom_equality_forces_notifications() {
        let signal = Signal::with_equals(1, |_, _| false);
        let calls = Rc::new(Cell::new(0));
        let _sub = signal.subscribe({
            let calls = calls.clone();
            move |_, _| calls.set(calls.get() + 1)
        });

        signal.set(1);
        signal.set(1);
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn signal_unsubscribe() {
        let signal = Signal::new(0);
        let calls = Rc::new(Cell::new(0));

        let sub = signal.subscribe({
            let calls = calls.clone();
            move |_, _| calls.set(calls.get() + 1)
        });
        assert_eq!(signal.listener_count(), 1);

        signal.set(1);
        assert_eq!(calls.get(), 1);

        sub.unsubscribe();
        assert_eq!(signal.listener_count(), 0);
        signal.set(2);
        // Should not have been called again
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn batch_reports_first_and_final_value_once() {
        let signal = Signal::new(0);
        let seen = Rc::new(RefCell::new(Vec::new()));
        let _sub = signal.subscribe({
            let seen = seen.clone();
            move |new, old| seen.borrow_mut().push((*new, *old))
        });

        batch(|| {
            signal.set(1);
            signal.set(2);
            signal.set(3);
        })
        .unwrap();
        assert_eq!(*seen.borrow(), [(3, 0)]);
    }

    #[test]
    fn restored_value_is_not_notified() {
        let signal = Signal::new(5);
        let calls = Rc::new(Cell::new(0));
        let _sub = signal.subscribe({
            let calls = calls.clone();
            move |_, _| calls.set(calls.get() + 1)
        });

        batch(|| {
            signal.set(6);
            signal.set(5);
        })
        .unwrap();
        assert_eq!(calls.get(), 0);
    }

    #[test]
    fn listener_may_write_back() {
        let signal = Signal::new(0);
        let _clamp = signal.subscribe({
            let signal = signal.clone();
            move |new, _| {
                if *new > 10 {
                    signal.set(10);
                }
            }
        });

        signal.set(50);
        assert_eq!(signal.get(), 10);
    }

    #[test]
    fn reads_are_tracked_only_inside_evaluations() {
        let signal = Signal::new(1);
        signal.get();
        assert_eq!(signal.observer_count(), 0);

        let doubled = Computed::new({
            let signal = signal.clone();
            move || signal.get() * 2
        });
        assert_eq!(doubled.get(), 2);
        assert_eq!(signal.observer_count(), 1);

        let peek = Computed::new({
            let signal = signal.clone();
            move || signal.get_untracked() + signal.with(|v| *v)
        });
        assert_eq!(peek.get(), 2);
        assert_eq!(signal.observer_count(), 2);
    }

    #[test]
    fn signal_clone_shares_state() {
        let signal1 = Signal::new(0);
        let signal2 = signal1.clone();

        signal1.set(42);
        assert_eq!(signal2.get(), 42);

        signal2.set(100);
        assert_eq!(signal1.get(), 100);
    }

    #[test]
    fn signal_ids_are_unique() {
        let s1 = Signal::new(0);
        let s2 = Signal::new(0);
        let s3 = Signal::new(0);

        assert_ne!(s1.id(), s2.id());
        assert_ne!(s2.id(), s3.id());
        assert_ne!(s1.id(), s3.id());
    }
}
