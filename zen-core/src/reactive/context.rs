//! Reactive Context
//!
//! The reactive context tracks which computation is currently running.
//! This enables automatic dependency tracking: when a signal or computed is
//! read, the running computation is linked to it.
//!
//! # Implementation
//!
//! We use a thread-local stack to track the currently executing computation.
//! When a computed or effect evaluates, it is pushed onto the stack; when the
//! evaluation completes (or unwinds), the guard pops it again. The top entry
//! is the current evaluator. An entry can also be empty, which suspends
//! tracking for everything run underneath it (see [`untracked`]).
//!
//! This design supports nested reactive contexts (e.g., a computed that reads
//! from another computed).

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use tracing::{trace, warn};

use crate::graph::node::{self, ObserverNode, SourceNode};

thread_local! {
    static CONTEXT_STACK: RefCell<Vec<Option<Weak<dyn ObserverNode>>>> =
        const { RefCell::new(Vec::new()) };
}

/// Guard that pops the context when dropped.
///
/// This ensures the context stack is properly maintained even if
/// the computation panics.
pub(crate) struct ReactiveContext {
    depth: usize,
}

impl ReactiveContext {
    /// Make `observer` the current evaluator until the guard is dropped.
    pub(crate) fn enter(observer: Weak<dyn ObserverNode>) -> Self {
        Self::push(Some(observer))
    }

    /// Suspend tracking until the guard is dropped.
    pub(crate) fn untracked() -> Self {
        Self::push(None)
    }

    fn push(entry: Option<Weak<dyn ObserverNode>>) -> Self {
        let depth = CONTEXT_STACK.with(|stack| {
            let mut stack = stack.borrow_mut();
            stack.push(entry);
            stack.len()
        });
        Self { depth }
    }

    /// The current evaluator, if tracking is active.
    pub(crate) fn current() -> Option<Rc<dyn ObserverNode>> {
        CONTEXT_STACK.with(|stack| {
            stack
                .borrow()
                .last()
                .and_then(|entry| entry.as_ref())
                .and_then(Weak::upgrade)
        })
    }

    /// Check if a computation is currently tracking reads.
    pub(crate) fn is_active() -> bool {
        CONTEXT_STACK.with(|stack| matches!(stack.borrow().last(), Some(Some(_))))
    }

    /// Link the current evaluator to `source`.
    ///
    /// Called by signals and computeds when they are read.
    pub(crate) fn track(source: Rc<dyn SourceNode>) {
        let Some(observer) = Self::current() else {
            return;
        };
        let source_id = source.source_state().id();
        if node::link(&observer, source) {
            trace!(observer = %observer.observer_state().id(), source = %source_id, "linked");
        }
    }
}

impl Drop for ReactiveContext {
    fn drop(&mut self) {
        CONTEXT_STACK.with(|stack| {
            let mut stack = stack.borrow_mut();

            // Verify we're popping the right context.
            // This helps catch guards dropped out of order.
            debug_assert_eq!(
                stack.len(),
                self.depth,
                "ReactiveContext mismatch: expected depth {}, got {}",
                self.depth,
                stack.len()
            );
            stack.truncate(self.depth.saturating_sub(1));
        });
    }
}

/// Run `f` without registering any of its reads as dependencies.
pub fn untracked<R>(f: impl FnOnce() -> R) -> R {
    let _scope = ReactiveContext::untracked();
    f()
}

/// Whether reads are currently being recorded by a computed or effect.
pub fn is_tracking() -> bool {
    ReactiveContext::is_active()
}

/// Register `cleanup` on the running effect.
///
/// Cleanups run before the effect's next run and when it is disposed.
/// Outside of an effect the cleanup is dropped without running.
pub fn on_cleanup(cleanup: impl FnOnce() + 'static) {
    let registered = ReactiveContext::current()
        .map(|observer| observer.add_cleanup(Box::new(cleanup)))
        .unwrap_or(false);
    if !registered {
        warn!("on_cleanup called outside of a running effect; cleanup ignored");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::node::{NodeId, NodeKind, ObserverState, SourceState};
    use crate::graph::scheduler::FailureSink;
    use crate::error::ReactiveError;

    struct MockNode {
        source: SourceState,
        observer: ObserverState,
    }

    impl MockNode {
        fn new() -> Rc<Self> {
            let id = NodeId::new();
            Rc::new(Self {
                source: SourceState::new(id),
                observer: ObserverState::new(id, NodeKind::Computed),
            })
        }

        fn weak(self: &Rc<Self>) -> Weak<dyn ObserverNode> {
            let weak: Weak<MockNode> = Rc::downgrade(self);
            weak
        }
    }

    impl SourceNode for MockNode {
        fn source_state(&self) -> &SourceState {
            &self.source
        }

        fn refresh(&self) -> Result<(), ReactiveError> {
            Ok(())
        }
    }

    impl ObserverNode for MockNode {
        fn observer_state(&self) -> &ObserverState {
            &self.observer
        }

        fn as_source(&self) -> Option<&dyn SourceNode> {
            Some(self)
        }

        fn has_listeners(&self) -> bool {
            false
        }

        fn settle(&self) -> Result<(), ReactiveError> {
            Ok(())
        }

        fn notify_listeners(&self, _sink: &mut FailureSink) {}
    }

    fn current_id() -> Option<NodeId> {
        ReactiveContext::current().map(|node| node.observer_state().id())
    }

    #[test]
    fn context_tracks_evaluator() {
        let node = MockNode::new();

        assert!(!is_tracking());
        assert!(current_id().is_none());

        {
            let _ctx = ReactiveContext::enter(node.weak());

            assert!(is_tracking());
            assert_eq!(current_id(), Some(node.observer.id()));
        }

        // Context should be cleaned up after drop
        assert!(!is_tracking());
        assert!(current_id().is_none());
    }

    #[test]
    fn nested_contexts() {
        let outer = MockNode::new();
        let inner = MockNode::new();

        {
            let _ctx1 = ReactiveContext::enter(outer.weak());
            assert_eq!(current_id(), Some(outer.observer.id()));

            {
                let _ctx2 = ReactiveContext::enter(inner.weak());
                assert_eq!(current_id(), Some(inner.observer.id()));
            }

            // After inner context drops, outer should be current
            assert_eq!(current_id(), Some(outer.observer.id()));
        }

        assert!(current_id().is_none());
    }

    #[test]
    fn track_links_current_evaluator() {
        let source = MockNode::new();
        let observer = MockNode::new();

        // No evaluator: nothing to link.
        ReactiveContext::track(source.clone());
        assert_eq!(source.source.observer_count(), 0);

        {
            let _ctx = ReactiveContext::enter(observer.weak());
            ReactiveContext::track(source.clone());
            ReactiveContext::track(source.clone());
        }
        assert_eq!(source.source.observer_count(), 1);
        assert_eq!(observer.observer.source_count(), 1);
    }

    #[test]
    fn untracked_suspends_tracking() {
        let source = MockNode::new();
        let observer = MockNode::new();

        let _ctx = ReactiveContext::enter(observer.weak());
        untracked(|| {
            assert!(!is_tracking());
            ReactiveContext::track(source.clone());
        });
        assert!(is_tracking());
        assert_eq!(source.source.observer_count(), 0);
    }

    #[test]
    fn context_is_restored_on_panic() {
        let node = MockNode::new();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _ctx = ReactiveContext::enter(node.weak());
            panic!("evaluation failed");
        }));
        assert!(result.is_err());
        assert!(!is_tracking());
    }
}
