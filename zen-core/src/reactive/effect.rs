//! Effect Implementation
//!
//! An Effect is a side-effecting computation that runs whenever its
//! dependencies change.
//!
//! # How Effects Work
//!
//! 1. When created, the effect runs its function immediately to establish
//!    initial dependencies.
//!
//! 2. When any dependency changes, the effect is queued and re-runs at the
//!    end of the transaction, after every computed update of that
//!    transaction has been applied.
//!
//! 3. Before re-running, the effect clears its old dependencies and tracks
//!    new ones during execution.
//!
//! # Differences from Computed
//!
//! - Computeds return a value; effects do not.
//! - Computeds are lazy (compute on access); effects are eager (run when deps change).
//! - Computeds cache results; effects just run their side effect.
//!
//! # Cleanup
//!
//! An effect can register cleanups with [`on_cleanup`](crate::on_cleanup).
//! They run before the effect re-runs and when the effect is disposed.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use tracing::{trace, warn};

use super::context::ReactiveContext;
use super::runtime;
use super::subscriber::{SubscriberId, Subscription};
use crate::error::ReactiveError;
use crate::graph::node::{self, Color, NodeId, NodeKind, ObserverNode, ObserverState, SourceNode};
use crate::graph::propagate;
use crate::graph::scheduler::FailureSink;

/// Run `f` now and again whenever anything it read changes.
///
/// The effect lives as long as the returned subscription.
pub fn effect(f: impl FnMut() + 'static) -> Subscription {
    let effect = Effect::new(f);
    let id = effect.subscriber_id();
    Subscription::new(id, move || effect.dispose())
}

struct EffectInner {
    observer: ObserverState,
    run: RefCell<Box<dyn FnMut()>>,
    cleanups: RefCell<Vec<Box<dyn FnOnce()>>>,
    disposed: Cell<bool>,
    runs: Cell<usize>,
    this: Weak<EffectInner>,
}

impl EffectInner {
    fn execute(&self) {
        let state = &self.observer;
        // Clean before running: a write to one of its own sources during the
        // run queues it again.
        state.set_color(Color::Clean);
        self.run_cleanups();

        let _stale = node::unlink_sources(state);
        let _ctx = ReactiveContext::enter(self.this.clone());
        let Ok(mut run) = self.run.try_borrow_mut() else {
            warn!(node = %state.id(), "effect re-entered itself; skipped");
            return;
        };
        let runs = self.runs.get() + 1;
        self.runs.set(runs);
        trace!(node = %state.id(), runs, "effect run");
        (&mut *run)();
    }

    fn run_cleanups(&self) {
        let cleanups = std::mem::take(&mut *self.cleanups.borrow_mut());
        for cleanup in cleanups {
            cleanup();
        }
    }

    fn dispose(&self) {
        if self.disposed.replace(true) {
            return;
        }
        let stale = node::unlink_sources(&self.observer);
        self.observer.set_color(Color::Clean);
        self.run_cleanups();
        drop(stale);
        trace!(node = %self.observer.id(), "effect disposed");
    }
}

impl ObserverNode for EffectInner {
    fn observer_state(&self) -> &ObserverState {
        &self.observer
    }

    fn as_source(&self) -> Option<&dyn SourceNode> {
        None
    }

    fn has_listeners(&self) -> bool {
        false
    }

    fn settle(&self) -> Result<(), ReactiveError> {
        if self.disposed.get() {
            return Ok(());
        }

        // A failure leaves the effect `Check` or `Dirty` until a source is
        // written again.
        let state = &self.observer;
        let attempt = state.attempt();
        propagate::resolve_check(state)?;

        match state.color() {
            Color::Clean => {}
            Color::Check => state.set_color(Color::Clean),
            Color::Dirty => self.execute(),
        }
        attempt.succeed();
        Ok(())
    }

    fn notify_listeners(&self, _sink: &mut FailureSink) {}

    fn add_cleanup(&self, cleanup: Box<dyn FnOnce()>) -> bool {
        self.cleanups.borrow_mut().push(cleanup);
        true
    }
}

impl Drop for EffectInner {
    fn drop(&mut self) {
        let sources = node::unlink_sources(&self.observer);
        drop(sources);
    }
}

/// A side-effecting computation that runs when dependencies change.
///
/// Dropping the handle disposes the effect.
///
/// # Example
///
/// ```rust
/// use std::cell::Cell;
/// use std::rc::Rc;
///
/// use zen_core::{Effect, Signal};
///
/// let count = Signal::new(0);
/// let seen = Rc::new(Cell::new(0));
///
/// let _effect = Effect::new({
///     let (count, seen) = (count.clone(), seen.clone());
///     move || seen.set(count.get())
/// });
///
/// count.set(5);
/// assert_eq!(seen.get(), 5);
/// ```
pub struct Effect {
    inner: Rc<EffectInner>,
    subscriber_id: SubscriberId,
}

impl Effect {
    /// Create a new effect with the given function.
    ///
    /// The function runs immediately to establish initial dependencies.
    ///
    /// # Panics
    ///
    /// Panics if the first run panics, or if the flush that follows it fails.
    pub fn new(run: impl FnMut() + 'static) -> Self {
        Self::try_new(run).unwrap_or_else(|err| err.raise())
    }

    /// Create a new effect, reporting a failed flush after the first run.
    ///
    /// On error the effect is disposed.
    pub fn try_new(run: impl FnMut() + 'static) -> Result<Self, ReactiveError> {
        let id = NodeId::new();
        let inner = Rc::new_cyclic(|this| EffectInner {
            observer: ObserverState::new(id, NodeKind::Effect),
            run: RefCell::new(Box::new(run)),
            cleanups: RefCell::new(Vec::new()),
            disposed: Cell::new(false),
            runs: Cell::new(0),
            this: this.clone(),
        });
        trace!(node = %id, "effect created");

        let effect = Self {
            inner,
            subscriber_id: SubscriberId::new(),
        };
        runtime::batch(|| effect.inner.execute())?;
        Ok(effect)
    }

    /// Get the effect's unique ID.
    pub fn id(&self) -> NodeId {
        self.inner.observer.id()
    }

    /// Get the subscriber ID for this effect.
    pub fn subscriber_id(&self) -> SubscriberId {
        self.subscriber_id
    }

    /// Stop the effect and run its pending cleanups.
    ///
    /// Disposing twice is a no-op.
    pub fn dispose(&self) {
        self.inner.dispose();
    }

    /// Whether the effect has been disposed.
    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.get()
    }

    /// Number of times the effect has run.
    pub fn run_count(&self) -> usize {
        self.inner.runs.get()
    }

    /// Number of nodes read during the last run.
    pub fn source_count(&self) -> usize {
        self.inner.observer.source_count()
    }
}

impl Drop for Effect {
    fn drop(&mut self) {
        self.inner.dispose();
    }
}

impl fmt::Debug for Effect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Effect")
            .field("id", &self.inner.observer.id())
            .field("runs", &self.inner.runs.get())
            .field("disposed", &self.inner.disposed.get())
            .finish()
    }
}
