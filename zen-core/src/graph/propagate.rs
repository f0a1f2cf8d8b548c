//! Propagation Engine
//!
//! Implements the CLEAN/CHECK/DIRTY graph coloring walk.
//!
//! # Algorithm
//!
//! 1. A write marks the signal's direct observers `Dirty` and everything
//!    further downstream `Check`. Nodes that leave `Clean` are handed to the
//!    scheduler. The walk stops at nodes that were already non-clean, whose
//!    downstream is non-clean by construction. A node whose last settle
//!    failed is the exception: it is walked through and scheduled again.
//! 2. Reading a `Dirty` computed recomputes it. If its value changed, its own
//!    observers are promoted to `Dirty` with the same rule.
//! 3. Reading a `Check` computed refreshes its sources in the order they were
//!    read. The first source that recomputes to a new value promotes the node
//!    to `Dirty`, and the walk stops there. If none did, the node turns
//!    `Clean` without running its derivation.
//!
//! Step 3 is what keeps diamonds glitch-free: every node on a path is
//! resolved before anything that depends on it, and each node runs at most
//! once per change.

use std::rc::Rc;

use tracing::trace;

use super::node::{Color, ObserverNode, ObserverState, SourceState};
use crate::error::ReactiveError;
use crate::reactive;

/// Mark every live observer of `source` with `color`.
///
/// Writers pass `Dirty`; the walk itself uses `Check` for indirect observers.
pub(crate) fn mark_observers(source: &SourceState, color: Color) {
    for observer in source.observers() {
        mark(&observer, color);
    }
}

/// Raise a single observer to `color`, scheduling it if it was clean or its
/// last settle failed.
pub(crate) fn mark(node: &Rc<dyn ObserverNode>, color: Color) {
    let state = node.observer_state();
    let previous = state.color();
    // A node whose last settle failed kept its color without anything
    // scheduling it again. Treat it as clean so the write restarts it.
    let retry = state.take_failed();
    if previous >= color && !retry {
        return;
    }
    if previous < color {
        state.set_color(color);
    }

    if !previous.is_clean() && !retry {
        return;
    }

    trace!(node = %state.id(), ?color, retry, "marked");
    reactive::schedule(node.clone());

    if let Some(source) = node.as_source() {
        mark_observers(source.source_state(), Color::Check);
    }
}

/// Resolve a `Check` color by refreshing sources in read order.
///
/// On return the node is either still `Check` (a false alarm, the caller may
/// mark it clean) or `Dirty` (a source changed and the caller must rerun it).
pub(crate) fn resolve_check(state: &ObserverState) -> Result<(), ReactiveError> {
    if state.color() != Color::Check {
        return Ok(());
    }

    for source in state.sources() {
        source.refresh()?;
        if state.color() == Color::Dirty {
            break;
        }
    }
    Ok(())
}
