//! Update Scheduler
//!
//! Holds the state of the current transaction: its nesting depth, its
//! epoch, and the three queues drained by a flush.
//!
//! # Flush order
//!
//! Work is handed out by priority rather than in three fixed passes:
//!
//! 1. Computed updates (only the ones someone listens to are resolved).
//! 2. Signal listener notifications, once per written signal.
//! 3. Effects.
//!
//! Listeners and effects may write signals while the flush runs. Those writes
//! queue more work, and because computed updates always go first, an effect
//! never observes a half-updated graph. Every time updates resume after a
//! listener or effect ran, the epoch advances: a computed is processed at most
//! once per epoch.
//!
//! The queues are cleared, not reallocated, between transactions.

use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;

use tracing::error;

use super::node::{NodeId, NodeKind, ObserverNode, PendingNotify};
use crate::error::ReactiveError;

/// Lifecycle of the transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No batch is running.
    Idle,

    /// Inside a batch; writes are deferred.
    Open,

    /// The outermost batch returned and its queues are being drained.
    Flushing,
}

/// A unit of work handed out by [`Transaction::next_work`].
pub(crate) enum Work {
    /// Resolve a computed and notify its listeners.
    Update(Rc<dyn ObserverNode>),

    /// Notify a written signal's listeners.
    Notify(Rc<dyn PendingNotify>),

    /// Re-run an effect if its sources changed.
    Effect(Rc<dyn ObserverNode>),
}

/// The three queues drained by a flush.
#[derive(Default)]
pub(crate) struct Queues {
    updates: Vec<Rc<dyn ObserverNode>>,
    signals: Vec<Rc<dyn PendingNotify>>,
    effects: Vec<Rc<dyn ObserverNode>>,
}

impl Queues {
    /// Drop every queued node.
    ///
    /// Dropping a node can run user code (captured values, effect cleanups),
    /// so this must happen while the transaction is not borrowed.
    pub(crate) fn clear(&mut self) {
        self.updates.clear();
        self.signals.clear();
        self.effects.clear();
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.updates.is_empty() && self.signals.is_empty() && self.effects.is_empty()
    }
}

/// Queued work that an aborted flush hands back for cleanup.
pub(crate) struct Abandoned {
    /// Signals whose captured old values must be discarded.
    pub(crate) signals: Vec<Rc<dyn PendingNotify>>,
    /// Effects dropped from the queue before they ran.
    pub(crate) effects: Vec<Rc<dyn ObserverNode>>,
    /// Already processed entries removed from the queues.
    pub(crate) released: Vec<Rc<dyn ObserverNode>>,
}

/// Process-wide (per-thread) transaction state.
pub(crate) struct Transaction {
    depth: usize,
    epoch: u64,
    phase: Phase,
    queues: Queues,
    update_cursor: usize,
    signal_cursor: usize,
    effect_cursor: usize,
    new_wave: bool,
    processed: usize,
}

impl Transaction {
    pub(crate) fn new() -> Self {
        Self {
            depth: 0,
            epoch: 0,
            phase: Phase::Idle,
            queues: Queues::default(),
            update_cursor: 0,
            signal_cursor: 0,
            effect_cursor: 0,
            new_wave: false,
            processed: 0,
        }
    }

    #[cfg(test)]
    pub(crate) fn depth(&self) -> usize {
        self.depth
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.epoch
    }

    pub(crate) fn phase(&self) -> Phase {
        self.phase
    }

    pub(crate) fn is_open(&self) -> bool {
        self.depth > 0
    }

    pub(crate) fn processed(&self) -> usize {
        self.processed
    }

    /// Enter a batch.
    ///
    /// Returns `true` if this call opened the transaction (depth 0 -> 1),
    /// which also starts a new epoch.
    pub(crate) fn enter(&mut self) -> bool {
        self.depth += 1;
        if self.depth == 1 {
            self.epoch += 1;
            self.phase = Phase::Open;
            true
        } else {
            false
        }
    }

    /// Leave a nested batch. The outermost batch leaves through
    /// [`finish`](Self::finish) or [`abort`](Self::abort) instead.
    pub(crate) fn leave(&mut self) {
        self.depth = self.depth.saturating_sub(1);
    }

    pub(crate) fn begin_flush(&mut self) {
        self.phase = Phase::Flushing;
        self.processed = 0;
        self.new_wave = false;
    }

    /// Queue an observer that just left `Clean`.
    pub(crate) fn schedule(&mut self, node: Rc<dyn ObserverNode>) {
        match node.observer_state().kind() {
            NodeKind::Effect => self.queues.effects.push(node),
            NodeKind::Computed | NodeKind::Signal => self.queues.updates.push(node),
        }
    }

    /// Queue a signal written for the first time in this transaction.
    pub(crate) fn schedule_notify(&mut self, node: Rc<dyn PendingNotify>) {
        self.queues.signals.push(node);
    }

    /// Number of queued, not yet handed out items per queue.
    #[cfg(test)]
    pub(crate) fn pending(&self) -> (usize, usize, usize) {
        (
            self.queues.updates.len() - self.update_cursor,
            self.queues.signals.len() - self.signal_cursor,
            self.queues.effects.len() - self.effect_cursor,
        )
    }

    /// Hand out the next unit of work, by priority.
    pub(crate) fn next_work(&mut self) -> Option<Work> {
        while let Some(node) = self.queues.updates.get(self.update_cursor).cloned() {
            self.update_cursor += 1;
            if self.new_wave {
                self.epoch += 1;
                self.new_wave = false;
            }

            let state = node.observer_state();
            if state.epoch() == self.epoch {
                if state.color().is_clean() {
                    continue;
                }
                // Re-marked by a write from inside a derivation.
                self.epoch += 1;
            }
            state.set_epoch(self.epoch);
            self.processed += 1;
            return Some(Work::Update(node));
        }

        if let Some(node) = self.queues.signals.get(self.signal_cursor).cloned() {
            self.signal_cursor += 1;
            self.new_wave = true;
            self.processed += 1;
            return Some(Work::Notify(node));
        }

        if let Some(node) = self.queues.effects.get(self.effect_cursor).cloned() {
            self.effect_cursor += 1;
            self.new_wave = true;
            self.processed += 1;
            return Some(Work::Effect(node));
        }

        None
    }

    /// Close the transaction after a completed flush.
    ///
    /// Returns the used queues; the caller clears them outside the borrow and
    /// hands them back through [`recycle`](Self::recycle).
    pub(crate) fn finish(&mut self) -> Queues {
        self.reset();
        std::mem::take(&mut self.queues)
    }

    /// Reinstall cleared queues so their allocations are reused.
    ///
    /// Queues that received work in the meantime are kept as they are.
    pub(crate) fn recycle(&mut self, spare: Queues) {
        debug_assert!(spare.is_empty(), "recycled queues must be cleared");
        if self.queues.updates.is_empty() {
            self.queues.updates = spare.updates;
        }
        if self.queues.signals.is_empty() {
            self.queues.signals = spare.signals;
        }
        if self.queues.effects.is_empty() {
            self.queues.effects = spare.effects;
        }
    }

    /// Close the transaction after a failure.
    ///
    /// Signal notifications are always abandoned. Computed updates that were
    /// not handed out yet stay queued for the next flush: a computed cannot be
    /// reset without recomputing it. With `retain_effects` the same holds for
    /// effects; otherwise unprocessed effects are returned so the caller can
    /// make them schedulable again.
    pub(crate) fn abort(&mut self, retain_effects: bool) -> Abandoned {
        let signals = std::mem::take(&mut self.queues.signals);
        let mut released: Vec<_> = self.queues.updates.drain(..self.update_cursor).collect();
        released.extend(self.queues.effects.drain(..self.effect_cursor));

        let effects = if retain_effects {
            Vec::new()
        } else {
            std::mem::take(&mut self.queues.effects)
        };

        self.reset();
        Abandoned {
            signals,
            effects,
            released,
        }
    }

    fn reset(&mut self) {
        self.update_cursor = 0;
        self.signal_cursor = 0;
        self.effect_cursor = 0;
        self.new_wave = false;
        self.depth = 0;
        self.phase = Phase::Idle;
    }
}

/// Collects failures of user callbacks during a flush.
pub(crate) struct FailureSink {
    isolate: bool,
    failures: usize,
    first: Option<ReactiveError>,
}

impl FailureSink {
    pub(crate) fn new(isolate: bool) -> Self {
        Self {
            isolate,
            failures: 0,
            first: None,
        }
    }

    /// Run a callback on behalf of `node`.
    ///
    /// When isolating, a panic is caught and recorded; otherwise it unwinds to
    /// the caller. Returned errors are always recorded.
    pub(crate) fn run<F>(&mut self, node: NodeId, f: F)
    where
        F: FnOnce() -> Result<(), ReactiveError>,
    {
        let outcome = if self.isolate {
            match panic::catch_unwind(AssertUnwindSafe(f)) {
                Ok(outcome) => outcome,
                Err(payload) => Err(ReactiveError::from_panic(payload)),
            }
        } else {
            f()
        };

        if let Err(err) = outcome {
            self.record(node, err);
        }
    }

    pub(crate) fn record(&mut self, node: NodeId, err: ReactiveError) {
        error!(node = %node, error = %err, "reactive callback failed");
        self.failures += 1;
        if self.first.is_none() {
            self.first = Some(err);
        }
    }

    pub(crate) fn failures(&self) -> usize {
        self.failures
    }

    /// The first failure, carrying the total count when it was a panic.
    pub(crate) fn finish(self) -> Result<(), ReactiveError> {
        match self.first {
            None => Ok(()),
            Some(ReactiveError::Evaluation {
                message, payload, ..
            }) => Err(ReactiveError::Evaluation {
                failures: self.failures,
                message,
                payload,
            }),
            Some(err) => Err(err),
        }
    }
}
