//! Reactive Runtime
//!
//! The runtime is the central coordinator that connects signals, computeds
//! and effects. It owns the current transaction and drives the flush that
//! ends it.
//!
//! # How It Works
//!
//! 1. Every write happens inside a batch. A write outside any batch opens an
//!    implicit one around itself.
//!
//! 2. While the batch is open, writes only mark the graph. Nodes that leave
//!    `Clean` are queued on the transaction, and each written signal is
//!    queued once for listener notification.
//!
//! 3. When the outermost batch returns, the runtime flushes:
//!    a. Computeds with listeners are resolved and their listeners called
//!    b. Signal listeners are called with `(new, old)`
//!    c. Effects whose sources changed are re-run
//!    d. Computeds without listeners stay lazy until their next read
//!
//! # Thread Safety
//!
//! There is one runtime per thread, kept in thread-local storage. Handles
//! are `Rc`-based and cannot cross threads, so no locking is needed.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use tracing::{debug, error, trace};

use super::context::ReactiveContext;
use super::subscriber::Subscription;
use crate::config::RuntimeConfig;
use crate::error::{Cycle, ReactiveError};
use crate::graph::node::{NodeId, ObserverNode, PendingNotify};
use crate::graph::scheduler::{FailureSink, Phase, Transaction, Work};

struct RuntimeState {
    tx: RefCell<Transaction>,
    config: Cell<RuntimeConfig>,
}

thread_local! {
    static RUNTIME: RuntimeState = RuntimeState {
        tx: RefCell::new(Transaction::new()),
        config: Cell::new(RuntimeConfig::default()),
    };
}

/// Borrow the transaction for a short, non-reentrant operation.
///
/// Nothing inside `f` may run user code or drop a node.
fn with_tx<R>(f: impl FnOnce(&mut Transaction) -> R) -> R {
    RUNTIME.with(|rt| f(&mut rt.tx.borrow_mut()))
}

/// A readable node of the graph: a signal or a computed.
pub trait Reactive<T> {
    /// The node's unique ID.
    fn id(&self) -> NodeId;

    /// Read the current value, tracking the read.
    fn value(&self) -> T;

    /// Assign a new value.
    ///
    /// Computeds are read-only and return
    /// [`ReactiveError::InvalidAssignment`].
    fn set_value(&self, value: T) -> Result<(), ReactiveError>;

    /// Attach a listener called with `(new, old)` after each transaction
    /// that changed the value.
    fn subscribe(&self, listener: impl FnMut(&T, &T) + 'static) -> Subscription;
}

/// Attach `listener` to `node`. See [`Reactive::subscribe`].
pub fn subscribe<T, N>(node: &N, listener: impl FnMut(&T, &T) + 'static) -> Subscription
where
    N: Reactive<T>,
{
    node.subscribe(listener)
}

/// The per-thread reactive runtime.
///
/// All state lives in thread-local storage; this type only groups the
/// introspection functions.
pub struct Runtime;

impl Runtime {
    /// Lifecycle of the current transaction.
    pub fn phase() -> Phase {
        with_tx(|tx| tx.phase())
    }

    /// Epoch of the current (or last) transaction.
    pub fn epoch() -> u64 {
        with_tx(|tx| tx.epoch())
    }

    /// Whether a batch is open or flushing on this thread.
    pub fn is_batching() -> bool {
        in_transaction()
    }

    /// Check if we're inside a reactive context.
    pub fn is_tracking() -> bool {
        ReactiveContext::is_active()
    }
}

/// Replace the runtime configuration of the current thread.
pub fn configure(config: RuntimeConfig) {
    debug!(?config, "runtime configured");
    RUNTIME.with(|rt| rt.config.set(config));
}

/// The runtime configuration of the current thread.
pub fn config() -> RuntimeConfig {
    RUNTIME.with(|rt| rt.config.get())
}

pub(crate) fn in_transaction() -> bool {
    with_tx(|tx| tx.is_open())
}

/// Queue an observer that just left `Clean`.
pub(crate) fn schedule(node: Rc<dyn ObserverNode>) {
    with_tx(|tx| tx.schedule(node));
}

/// Queue a signal for listener notification at the end of the transaction.
pub(crate) fn schedule_notify(node: Rc<dyn PendingNotify>) {
    with_tx(|tx| tx.schedule_notify(node));
}

/// Run `f` as a transaction.
///
/// Writes made inside `f` are deferred: listeners and effects run once,
/// after the outermost batch returns, and observe only the final values.
/// Nested batches join the enclosing one.
///
/// Returns `f`'s value, or the first failure of the flush. A failure does not
/// undo the writes; everything that could run still ran.
///
/// If `f` panics, the transaction is closed, pending signal notifications are
/// dropped and the panic continues to unwind.
pub fn batch<R>(f: impl FnOnce() -> R) -> Result<R, ReactiveError> {
    let scope = BatchScope::open();
    let value = f();
    scope.close()?;
    Ok(value)
}

/// Closes the transaction on every exit path of [`batch`].
struct BatchScope {
    outermost: bool,
    settled: bool,
}

impl BatchScope {
    fn open() -> Self {
        let (outermost, epoch) = with_tx(|tx| (tx.enter(), tx.epoch()));
        if outermost {
            trace!(epoch, "transaction opened");
        }
        Self {
            outermost,
            settled: false,
        }
    }

    fn close(mut self) -> Result<(), ReactiveError> {
        self.settled = true;
        if self.outermost {
            flush()
        } else {
            with_tx(Transaction::leave);
            Ok(())
        }
    }
}

impl Drop for BatchScope {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        if self.outermost {
            debug!("batch unwound; pending notifications dropped");
            abandon(true);
        } else {
            with_tx(Transaction::leave);
        }
    }
}

/// Aborts the flush if a callback unwinds out of it.
struct FlushGuard {
    armed: bool,
}

impl Drop for FlushGuard {
    fn drop(&mut self) {
        if self.armed {
            abandon(true);
        }
    }
}

/// Drain the transaction's queues by priority, then close it.
fn flush() -> Result<(), ReactiveError> {
    let config = config();
    let mut guard = FlushGuard { armed: true };
    with_tx(Transaction::begin_flush);

    let mut sink = FailureSink::new(config.isolate_panics);
    {
        // Listeners and effects are not derivations: nothing they read is
        // tracked against an enclosing evaluator.
        let _untracked = ReactiveContext::untracked();

        loop {
            let next = with_tx(|tx| tx.next_work().map(|work| (work, tx.processed())));
            let Some((work, processed)) = next else {
                break;
            };
            if processed > config.flush_limit {
                // Handed out but never run: the next write must reach it again.
                if let Work::Update(node) | Work::Effect(node) = &work {
                    node.observer_state().set_failed();
                }
                drop(work);
                guard.armed = false;
                abandon(false);
                error!(limit = config.flush_limit, "flush limit exceeded; transaction aborted");
                return Err(ReactiveError::CyclicDependency(Cycle::FlushLimit {
                    limit: config.flush_limit,
                }));
            }
            run_work(work, &mut sink);
        }
    }

    guard.armed = false;
    let (processed, epoch) = with_tx(|tx| (tx.processed(), tx.epoch()));
    let mut used = with_tx(Transaction::finish);
    used.clear();
    with_tx(|tx| tx.recycle(used));

    debug!(processed, epoch, failures = sink.failures(), "flush complete");
    sink.finish()
}

fn run_work(work: Work, sink: &mut FailureSink) {
    match work {
        Work::Update(node) => {
            if !node.has_listeners() {
                return;
            }
            let id = node.observer_state().id();
            sink.run(id, || node.settle());
            node.notify_listeners(sink);
        }
        Work::Notify(node) => node.notify(sink),
        Work::Effect(node) => {
            let id = node.observer_state().id();
            sink.run(id, || node.settle());
        }
    }
}

/// Close the transaction after a failure, cleaning up what it drops.
fn abandon(retain_effects: bool) {
    let abandoned = with_tx(|tx| tx.abort(retain_effects));
    for signal in &abandoned.signals {
        trace!(node = %signal.node_id(), "pending notification dropped");
        signal.discard();
    }
    // Their sources changed, but they will not run for it. Flagged as failed,
    // they keep their color and the next write schedules them again.
    for effect in &abandoned.effects {
        effect.observer_state().set_failed();
    }
    trace!(
        signals = abandoned.signals.len(),
        effects = abandoned.effects.len(),
        "transaction abandoned"
    );
}
