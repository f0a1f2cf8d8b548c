//! Computed Implementation
//!
//! A Computed is a cached derived value that re-evaluates only when its
//! dependencies change.
//!
//! # How Computeds Work
//!
//! 1. Creating a computed runs nothing. It starts `Dirty` and evaluates on
//!    first access.
//!
//! 2. When accessed again, if no dependencies have changed, the cached value
//!    is returned.
//!
//! 3. When a direct dependency changes, the computed is marked `Dirty`; when
//!    something further upstream changes, it is marked `Check`.
//!
//! 4. On next access, a `Check` computed refreshes its sources in read order
//!    and recomputes only if one of them actually changed.
//!
//! 5. A recompute that produces an equal value keeps the cached one, and
//!    nothing downstream is disturbed.
//!
//! # Why This Matters
//!
//! This lazy approach avoids unnecessary recomputation:
//!
//! - A signal changes
//! - 10 computeds depend on it
//! - Only the computeds actually read (or listened to) will recompute
//! - Computeds that are never read stay dirty (no wasted work)

use std::cell::RefCell;
use std::fmt::{self, Debug};
use std::rc::{Rc, Weak};

use tracing::{trace, warn};

use super::context::{self, ReactiveContext};
use super::runtime::{self, Reactive};
use super::subscriber::{Listeners, Subscription};
use crate::error::{Cycle, ReactiveError};
use crate::graph::node::{
    self, Color, NodeId, NodeKind, ObserverNode, ObserverState, SourceNode, SourceState,
};
use crate::graph::propagate;
use crate::graph::scheduler::FailureSink;

/// Create a computed deriving its value from `derive`.
pub fn computed<T>(derive: impl Fn() -> T + 'static) -> Computed<T>
where
    T: Clone + PartialEq + 'static,
{
    Computed::new(derive)
}

struct ComputedInner<T> {
    source: SourceState,
    observer: ObserverState,
    derive: Box<dyn Fn() -> T>,
    /// `None` until the first successful evaluation.
    value: RefCell<Option<T>>,
    /// The value before the first change of the open transaction, kept for
    /// listeners.
    pending_old: RefCell<Option<T>>,
    listeners: Listeners<T>,
    equals: fn(&T, &T) -> bool,
    this: Weak<ComputedInner<T>>,
}

impl<T: Clone + 'static> ComputedInner<T> {
    /// Bring the cached value up to date.
    fn update(&self) -> Result<(), ReactiveError> {
        let state = &self.observer;
        if state.is_computing() {
            warn!(node = %state.id(), "computed read itself while evaluating");
            return Err(ReactiveError::CyclicDependency(Cycle::SelfRead(state.id())));
        }

        // On error the node keeps its color and the next write to any of its
        // sources schedules it again.
        let attempt = state.attempt();
        propagate::resolve_check(state)?;
        match state.color() {
            Color::Clean => {}
            // Every source is unchanged.
            Color::Check => state.set_color(Color::Clean),
            Color::Dirty => self.recompute()?,
        }
        attempt.succeed();
        Ok(())
    }

    fn recompute(&self) -> Result<(), ReactiveError> {
        let state = &self.observer;
        // Stays `Dirty` if `derive` unwinds, so the next read retries.
        let next = {
            let _computing = state.begin_computing();
            let _stale = node::unlink_sources(state);
            let _ctx = ReactiveContext::enter(self.this.clone());
            (self.derive)()
        };
        state.set_color(Color::Clean);

        let changed = match &*self.value.borrow() {
            Some(current) => !(self.equals)(current, &next),
            None => true,
        };
        trace!(node = %state.id(), changed, sources = state.source_count(), "recomputed");
        if !changed {
            return Ok(());
        }

        let previous = self.value.replace(Some(next));
        if let Some(previous) = previous {
            self.remember_old(previous);
        }
        propagate::mark_observers(&self.source, Color::Dirty);
        Ok(())
    }

    /// Keep the pre-transaction value for listeners, once per transaction.
    fn remember_old(&self, previous: T) {
        if self.listeners.is_empty() || !runtime::in_transaction() {
            return;
        }
        let mut pending = self.pending_old.borrow_mut();
        if pending.is_none() {
            *pending = Some(previous);
        }
    }
}

impl<T: Clone + 'static> SourceNode for ComputedInner<T> {
    fn source_state(&self) -> &SourceState {
        &self.source
    }

    fn refresh(&self) -> Result<(), ReactiveError> {
        self.update()
    }
}

impl<T: Clone + 'static> ObserverNode for ComputedInner<T> {
    fn observer_state(&self) -> &ObserverState {
        &self.observer
    }

    fn as_source(&self) -> Option<&dyn SourceNode> {
        Some(self)
    }

    fn has_listeners(&self) -> bool {
        !self.listeners.is_empty()
    }

    fn settle(&self) -> Result<(), ReactiveError> {
        self.update()
    }

    fn notify_listeners(&self, sink: &mut FailureSink) {
        let Some(old) = self.pending_old.borrow_mut().take() else {
            return;
        };
        let Some(new) = self.value.borrow().clone() else {
            return;
        };
        if (self.equals)(&new, &old) {
            return;
        }
        self.listeners.notify(self.observer.id(), &new, &old, sink);
    }
}

impl<T> Drop for ComputedInner<T> {
    fn drop(&mut self) {
        let sources = node::unlink_sources(&self.observer);
        drop(sources);
    }
}

/// A cached derived value that recomputes only when dependencies change.
///
/// # Example
///
/// ```rust
/// use zen_core::{Computed, Signal};
///
/// let width = Signal::new(3);
/// let area = Computed::new({
///     let width = width.clone();
///     move || width.get() * width.get()
/// });
///
/// assert_eq!(area.get(), 9);
/// width.set(4);
/// assert_eq!(area.get(), 16);
/// ```
pub struct Computed<T: 'static> {
    inner: Rc<ComputedInner<T>>,
}

impl<T> Computed<T>
where
    T: Clone + PartialEq + 'static,
{
    /// Create a new computed with the given derivation.
    ///
    /// The derivation is not run immediately. It runs on first access.
    pub fn new(derive: impl Fn() -> T + 'static) -> Self {
        Self::with_equals(derive, T::eq)
    }
}

impl<T> Computed<T>
where
    T: Clone + 'static,
{
    /// Create a computed that compares results with `equals`.
    ///
    /// A recompute whose result is equal to the cached value keeps the cached
    /// value and does not invalidate anything downstream.
    pub fn with_equals(derive: impl Fn() -> T + 'static, equals: fn(&T, &T) -> bool) -> Self {
        let id = NodeId::new();
        trace!(node = %id, "computed created");
        let inner = Rc::new_cyclic(|this| ComputedInner {
            source: SourceState::new(id),
            observer: ObserverState::new(id, NodeKind::Computed),
            derive: Box::new(derive),
            value: RefCell::new(None),
            pending_old: RefCell::new(None),
            listeners: Listeners::new(),
            equals,
            this: this.clone(),
        });
        Self { inner }
    }

    /// Get the computed's unique ID.
    pub fn id(&self) -> NodeId {
        self.inner.observer.id()
    }

    /// Get the current value, recomputing if necessary.
    ///
    /// # Panics
    ///
    /// Panics if the derivation panics or reads this computed while it is
    /// being evaluated. Use [`try_get`](Self::try_get) to receive the
    /// cycle as an error instead.
    pub fn get(&self) -> T {
        self.try_get().unwrap_or_else(|err| err.raise())
    }

    /// Get the current value, reporting dependency cycles as errors.
    pub fn try_get(&self) -> Result<T, ReactiveError> {
        self.refresh()?;
        if ReactiveContext::is_active() {
            ReactiveContext::track(self.inner.clone());
        }
        Ok(self.cached())
    }

    /// Get the current value without tracking dependencies.
    pub fn get_untracked(&self) -> T {
        context::untracked(|| self.refresh().map(|()| self.cached()))
            .unwrap_or_else(|err| err.raise())
    }

    /// Attach a listener called with `(new, old)` after each transaction
    /// that changed the value.
    ///
    /// The listener is not called on subscription. A computed that was never
    /// evaluated is evaluated once here so that later writes reach it.
    ///
    /// # Panics
    ///
    /// Panics if that first evaluation fails. Use
    /// [`try_subscribe`](Self::try_subscribe) to receive the error instead.
    pub fn subscribe(&self, listener: impl FnMut(&T, &T) + 'static) -> Subscription {
        self.try_subscribe(listener).unwrap_or_else(|err| err.raise())
    }

    /// Attach a listener, reporting a failed first evaluation as an error.
    ///
    /// On error no listener is attached.
    pub fn try_subscribe(
        &self,
        listener: impl FnMut(&T, &T) + 'static,
    ) -> Result<Subscription, ReactiveError> {
        if self.inner.value.borrow().is_none() {
            context::untracked(|| self.refresh())?;
        }

        let id = self.inner.listeners.add(listener);
        let weak: Weak<ComputedInner<T>> = Rc::downgrade(&self.inner);
        Ok(Subscription::new(id, move || {
            if let Some(inner) = weak.upgrade() {
                inner.listeners.remove(id);
            }
        }))
    }

    /// Current graph color of the computed.
    pub fn color(&self) -> Color {
        self.inner.observer.color()
    }

    /// Number of nodes this computed read during its last evaluation.
    pub fn source_count(&self) -> usize {
        self.inner.observer.source_count()
    }

    /// Number of computeds and effects currently reading this computed.
    pub fn observer_count(&self) -> usize {
        self.inner.source.observer_count()
    }

    /// Refresh, turning cycles raised by nested reads back into errors.
    fn refresh(&self) -> Result<(), ReactiveError> {
        ReactiveError::catch(|| self.inner.update()).and_then(|outcome| outcome)
    }

    fn cached(&self) -> T {
        self.inner
            .value
            .borrow()
            .clone()
            .expect("computed value is present once refreshed")
    }
}

impl<T: Clone + 'static> Reactive<T> for Computed<T> {
    fn id(&self) -> NodeId {
        Computed::id(self)
    }

    fn value(&self) -> T {
        self.get()
    }

    fn set_value(&self, _value: T) -> Result<(), ReactiveError> {
        Err(ReactiveError::InvalidAssignment { node: self.id() })
    }

    fn subscribe(&self, listener: impl FnMut(&T, &T) + 'static) -> Subscription {
        Computed::subscribe(self, listener)
    }
}

impl<T: 'static> Clone for Computed<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T> Debug for Computed<T>
where
    T: Debug + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Computed")
            .field("id", &self.inner.observer.id())
            .field("color", &self.inner.observer.color())
            .field("value", &*self.inner.value.borrow())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::{batch, Signal};

    fn counter() -> Rc<Cell<u32>> {
        Rc::new(Cell::new(0))
    }

    #[test]
    fn computed_is_lazy() {
        let runs = counter();
        let source = Signal::new(2);

        let squared = Computed::new({
            let source = source.clone();
            let runs = runs.clone();
            move || {
                runs.set(runs.get() + 1);
                source.get() * source.get()
            }
        });

        // Not computed yet
        assert_eq!(runs.get(), 0);
        assert_eq!(squared.color(), Color::Dirty);

        // First access computes
        assert_eq!(squared.get(), 4);
        assert_eq!(runs.get(), 1);

        // Second access uses cache
        assert_eq!(squared.get(), 4);
        assert_eq!(runs.get(), 1);
    }

    #[test]
    fn computed_recomputes_after_change() {
        let runs = counter();
        let source = Signal::new(10);
        let doubled = Computed::new({
            let source = source.clone();
            let runs = runs.clone();
            move || {
                runs.set(runs.get() + 1);
                source.get() * 2
            }
        });

        assert_eq!(doubled.get(), 20);
        source.set(15);
        // Writes do not evaluate anything by themselves.
        assert_eq!(runs.get(), 1);
        assert_eq!(doubled.get(), 30);
        assert_eq!(runs.get(), 2);
    }

    #[test]
    fn dynamic_dependencies_are_replaced() {
        let flag = Signal::new(true);
        let a = Signal::new("a");
        let b = Signal::new("b");

        let pick = Computed::new({
            let (flag, a, b) = (flag.clone(), a.clone(), b.clone());
            move || if flag.get() { a.get() } else { b.get() }
        });

        assert_eq!(pick.get(), "a");
        assert_eq!(a.observer_count(), 1);
        assert_eq!(b.observer_count(), 0);

        flag.set(false);
        assert_eq!(pick.get(), "b");
        assert_eq!(a.observer_count(), 0);
        assert_eq!(b.observer_count(), 1);
        assert_eq!(pick.source_count(), 2);

        // `a` is no longer read, so writing it leaves `pick` clean.
        a.set("A");
        assert_eq!(pick.color(), Color::Clean);
    }

    #[test]
    fn equal_result_keeps_downstream_clean() {
        let runs = counter();
        let n = Signal::new(1);
        let positive = Computed::new({
            let n = n.clone();
            move || n.get() > 0
        });
        let label = Computed::new({
            let positive = positive.clone();
            let runs = runs.clone();
            move || {
                runs.set(runs.get() + 1);
                if positive.get() { "positive" } else { "non-positive" }
            }
        });

        assert_eq!(label.get(), "positive");
        n.set(2);
        assert_eq!(label.get(), "positive");
        assert_eq!(runs.get(), 1);
    }

    #[test]
    fn self_read_is_a_cycle() {
        let slot: Rc<RefCell<Option<Computed<i32>>>> = Rc::new(RefCell::new(None));
        let looped = Computed::new({
            let slot = slot.clone();
            move || {
                let me = slot.borrow().clone().expect("installed");
                me.get() + 1
            }
        });
        *slot.borrow_mut() = Some(looped.clone());

        let err = looped.try_get().unwrap_err();
        assert!(matches!(
            err,
            ReactiveError::CyclicDependency(Cycle::SelfRead(id)) if id == looped.id()
        ));
        assert!(!looped.inner.observer.is_computing());

        // Break the reference cycle between the slot and the computed.
        slot.borrow_mut().take();
    }

    #[test]
    fn panicking_derivation_retries_on_next_read() {
        let fail = Signal::new(true);
        let value = Computed::new({
            let fail = fail.clone();
            move || {
                if fail.get() {
                    panic!("not ready");
                }
                7
            }
        });

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| value.get()));
        assert!(result.is_err());
        assert_eq!(value.color(), Color::Dirty);

        fail.set(false);
        assert_eq!(value.get(), 7);
        assert_eq!(value.color(), Color::Clean);
    }

    #[test]
    fn failed_derivation_is_rescheduled_by_next_write() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let n = Signal::new(0);
        let checked = Computed::new({
            let n = n.clone();
            move || {
                let v = n.get();
                assert_ne!(v, 1, "one is rejected");
                v
            }
        });
        let _sub = checked.subscribe({
            let seen = seen.clone();
            move |new, old| seen.borrow_mut().push((*new, *old))
        });

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| n.set(1)));
        assert!(result.is_err());
        assert_eq!(checked.color(), Color::Dirty);
        assert!(seen.borrow().is_empty());

        n.set(2);
        assert_eq!(checked.color(), Color::Clean);
        n.set(3);
        assert_eq!(*seen.borrow(), [(2, 0), (3, 2)]);
    }

    #[test]
    fn try_subscribe_reports_a_failed_first_evaluation() {
        let slot: Rc<RefCell<Option<Computed<i32>>>> = Rc::new(RefCell::new(None));
        let looped = Computed::new({
            let slot = slot.clone();
            move || {
                let me = slot.borrow().clone().expect("installed");
                me.get() + 1
            }
        });
        *slot.borrow_mut() = Some(looped.clone());

        let err = looped.try_subscribe(|_, _| {}).unwrap_err();
        assert!(err.is_cycle());
        assert!(looped.inner.listeners.is_empty());

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _sub = looped.subscribe(|_, _| {});
        }));
        assert!(result.is_err());

        slot.borrow_mut().take();
    }

    #[test]
    fn assigning_a_computed_fails() {
        let value = Computed::new(|| 1);
        let err = value.set_value(2).unwrap_err();
        assert!(matches!(err, ReactiveError::InvalidAssignment { node } if node == value.id()));
    }

    #[test]
    fn listener_sees_old_and_new() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let n = Signal::new(1);
        let tenfold = Computed::new({
            let n = n.clone();
            move || n.get() * 10
        });
        let _sub = tenfold.subscribe({
            let seen = seen.clone();
            move |new, old| seen.borrow_mut().push((*new, *old))
        });
        // Subscribing evaluated it, without calling the listener.
        assert_eq!(tenfold.color(), Color::Clean);
        assert!(seen.borrow().is_empty());

        n.set(2);
        batch(|| {
            n.set(3);
            n.set(4);
        })
        .unwrap();
        assert_eq!(*seen.borrow(), [(20, 10), (40, 20)]);
    }

    #[test]
    fn dropping_computed_unlinks_sources() {
        let source = Signal::new(1);
        let derived = Computed::new({
            let source = source.clone();
            move || source.get() + 1
        });
        derived.get();
        assert_eq!(source.observer_count(), 1);

        drop(derived);
        assert_eq!(source.observer_count(), 0);
    }
}
