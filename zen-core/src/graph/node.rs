//! Graph Nodes
//!
//! This module defines the record types shared by signals, computeds and
//! effects: identifiers, the three-state color, and the two halves of every
//! dependency edge.
//!
//! # Edges
//!
//! An edge between a source (signal or computed) and an observer (computed or
//! effect) is stored twice: once in the source's `observers` list and once in
//! the observer's `sources` list. Each half records the index of its mirror
//! (its "slot"), so either side can be removed with a swap-remove in O(1):
//! when an entry moves into the vacated index, the slot stored on the other
//! side is patched to follow it.
//!
//! Observers own their sources (strong `Rc`), sources only point back weakly.
//! A node therefore stays alive while something observes it, and an observer
//! that is dropped unlinks itself from all of its sources.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

use smallvec::SmallVec;

use super::scheduler::FailureSink;
use crate::error::ReactiveError;

/// Unique identifier for a node in the dependency graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(u64);

impl NodeId {
    /// Generate a new unique node ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<u64> for NodeId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The kind of node in the dependency graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// A writable leaf. Has observers, never sources.
    Signal,

    /// A lazily evaluated derived value. Has both sources and observers.
    Computed,

    /// An eager side effect. Has sources but nothing observes it.
    Effect,
}

/// Graph coloring state of an observer.
///
/// The order matters: marking only ever raises the color, so `Clean < Check <
/// Dirty`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Color {
    /// The cached value is valid.
    Clean = 0,

    /// A transitive source changed; the node may or may not be stale.
    Check = 1,

    /// A direct source changed; the node must recompute.
    Dirty = 2,
}

impl Color {
    /// Whether the node can be used without any work.
    pub fn is_clean(self) -> bool {
        self == Color::Clean
    }
}

/// A node that others can depend on.
pub(crate) trait SourceNode {
    /// Edge bookkeeping for this node's observers.
    fn source_state(&self) -> &SourceState;

    /// Bring the node's value up to date. A no-op for signals.
    fn refresh(&self) -> Result<(), ReactiveError>;
}

/// A node that depends on others and is colored by propagation.
pub(crate) trait ObserverNode {
    /// Edge and color bookkeeping for this node's sources.
    fn observer_state(&self) -> &ObserverState;

    /// The source half of this node, if it can itself be observed.
    fn as_source(&self) -> Option<&dyn SourceNode>;

    /// Whether anything outside the graph listens to this node.
    fn has_listeners(&self) -> bool;

    /// Resolve a `Check` or `Dirty` color, re-running the node if needed.
    fn settle(&self) -> Result<(), ReactiveError>;

    /// Deliver a pending value change to listeners.
    fn notify_listeners(&self, sink: &mut FailureSink);

    /// Register a cleanup to run before the next evaluation.
    ///
    /// Returns `false` when the node does not support cleanups.
    fn add_cleanup(&self, cleanup: Box<dyn FnOnce()>) -> bool {
        drop(cleanup);
        false
    }
}

/// A source whose listeners are notified once per transaction.
pub(crate) trait PendingNotify {
    /// The node's identifier.
    fn node_id(&self) -> NodeId;

    /// Call listeners with the final and the pre-transaction value.
    fn notify(&self, sink: &mut FailureSink);

    /// Forget the captured pre-transaction value without notifying.
    fn discard(&self);
}

/// Half of an edge stored on the observer.
pub(crate) struct SourceLink {
    /// The source being read.
    pub(crate) node: Rc<dyn SourceNode>,
    /// Index of the mirrored `ObserverLink` in the source's `observers`.
    pub(crate) slot: usize,
}

/// Half of an edge stored on the source.
pub(crate) struct ObserverLink {
    /// The observer reading the source.
    pub(crate) node: Weak<dyn ObserverNode>,
    /// Index of the mirrored `SourceLink` in the observer's `sources`.
    pub(crate) slot: usize,
}

/// Source-side state of a node.
pub(crate) struct SourceState {
    id: NodeId,
    observers: RefCell<Vec<ObserverLink>>,
}

impl SourceState {
    pub(crate) fn new(id: NodeId) -> Self {
        Self {
            id,
            observers: RefCell::new(Vec::new()),
        }
    }

    pub(crate) fn id(&self) -> NodeId {
        self.id
    }

    pub(crate) fn observer_count(&self) -> usize {
        self.observers.borrow().len()
    }

    /// Live observers, in edge order.
    ///
    /// Returned by value so callers can run arbitrary code per observer
    /// without holding a borrow of the list.
    pub(crate) fn observers(&self) -> SmallVec<[Rc<dyn ObserverNode>; 8]> {
        self.observers
            .borrow()
            .iter()
            .filter_map(|link| link.node.upgrade())
            .collect()
    }

    fn push_observer(&self, node: Weak<dyn ObserverNode>, slot: usize) -> usize {
        let mut observers = self.observers.borrow_mut();
        observers.push(ObserverLink { node, slot });
        observers.len() - 1
    }

    /// Swap-remove the observer entry at `slot`, patching the entry that
    /// moves into its place.
    fn remove_observer(&self, slot: usize) {
        let moved = {
            let mut observers = self.observers.borrow_mut();
            if slot >= observers.len() {
                return;
            }
            observers.swap_remove(slot);
            observers
                .get(slot)
                .map(|link| (link.node.clone(), link.slot))
        };

        if let Some((node, source_slot)) = moved {
            if let Some(node) = node.upgrade() {
                let mut sources = node.observer_state().sources.borrow_mut();
                if let Some(link) = sources.get_mut(source_slot) {
                    link.slot = slot;
                }
            }
        }
    }
}

/// Observer-side state of a node.
pub(crate) struct ObserverState {
    id: NodeId,
    kind: NodeKind,
    color: Cell<Color>,
    epoch: Cell<u64>,
    computing: Cell<bool>,
    /// The last attempt to settle the node failed. Its downstream was marked
    /// by the write that led to the failure, not by anything since.
    failed: Cell<bool>,
    sources: RefCell<SmallVec<[SourceLink; 4]>>,
}

impl ObserverState {
    /// New observers start `Dirty`: they have never run.
    pub(crate) fn new(id: NodeId, kind: NodeKind) -> Self {
        Self {
            id,
            kind,
            color: Cell::new(Color::Dirty),
            epoch: Cell::new(0),
            computing: Cell::new(false),
            failed: Cell::new(false),
            sources: RefCell::new(SmallVec::new()),
        }
    }

    pub(crate) fn id(&self) -> NodeId {
        self.id
    }

    pub(crate) fn kind(&self) -> NodeKind {
        self.kind
    }

    pub(crate) fn color(&self) -> Color {
        self.color.get()
    }

    pub(crate) fn set_color(&self, color: Color) {
        self.color.set(color);
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.epoch.get()
    }

    pub(crate) fn set_epoch(&self, epoch: u64) {
        self.epoch.set(epoch);
    }

    pub(crate) fn is_computing(&self) -> bool {
        self.computing.get()
    }

    /// Flag the node as evaluating until the guard is dropped.
    pub(crate) fn begin_computing(&self) -> ComputingGuard<'_> {
        self.computing.set(true);
        ComputingGuard {
            flag: &self.computing,
        }
    }

    pub(crate) fn set_failed(&self) {
        self.failed.set(true);
    }

    /// Clear the failure flag, returning whether it was set.
    pub(crate) fn take_failed(&self) -> bool {
        self.failed.replace(false)
    }

    /// Start settling the node. Unless [`Attempt::succeed`] is called, the
    /// node is flagged as failed when the guard drops, including during
    /// unwinding.
    pub(crate) fn attempt(&self) -> Attempt<'_> {
        Attempt {
            flag: &self.failed,
            succeeded: false,
        }
    }

    pub(crate) fn source_count(&self) -> usize {
        self.sources.borrow().len()
    }

    /// Current sources, in the order they were first read.
    pub(crate) fn sources(&self) -> SmallVec<[Rc<dyn SourceNode>; 4]> {
        self.sources
            .borrow()
            .iter()
            .map(|link| link.node.clone())
            .collect()
    }
}

/// Clears the `computing` flag on drop, including during unwinding.
pub(crate) struct ComputingGuard<'a> {
    flag: &'a Cell<bool>,
}

impl Drop for ComputingGuard<'_> {
    fn drop(&mut self) {
        self.flag.set(false);
    }
}

/// Records the outcome of settling a node.
pub(crate) struct Attempt<'a> {
    flag: &'a Cell<bool>,
    succeeded: bool,
}

impl Attempt<'_> {
    pub(crate) fn succeed(mut self) {
        self.succeeded = true;
    }
}

impl Drop for Attempt<'_> {
    fn drop(&mut self) {
        self.flag.set(!self.succeeded);
    }
}

/// Record that `observer` read `source`.
///
/// Returns `false` if the edge already existed. The most recently added
/// source is checked first since repeated reads of the same node are the
/// common case.
pub(crate) fn link(observer: &Rc<dyn ObserverNode>, source: Rc<dyn SourceNode>) -> bool {
    let source_id = source.source_state().id();
    let mut sources = observer.observer_state().sources.borrow_mut();

    if let Some(last) = sources.last() {
        if last.node.source_state().id() == source_id {
            return false;
        }
    }
    if sources
        .iter()
        .any(|link| link.node.source_state().id() == source_id)
    {
        return false;
    }

    let observer_slot = sources.len();
    let source_slot = source
        .source_state()
        .push_observer(Rc::downgrade(observer), observer_slot);
    sources.push(SourceLink {
        node: source,
        slot: source_slot,
    });
    true
}

/// Detach `observer` from every source it currently reads.
///
/// The returned links still hold the sources alive; the caller decides when
/// to drop them. All edges are detached before any source can be dropped, so
/// a source's destructor never observes a half-unlinked observer.
pub(crate) fn unlink_sources(observer: &ObserverState) -> SmallVec<[SourceLink; 4]> {
    let links = std::mem::take(&mut *observer.sources.borrow_mut());
    for link in &links {
        link.node.source_state().remove_observer(link.slot);
    }
    links
}
