//! Dependency Graph
//!
//! This module implements the dependency graph that tracks relationships
//! between reactive values and computations.
//!
//! # Overview
//!
//! The dependency graph is a directed acyclic graph (DAG) where:
//!
//! - Nodes represent reactive values (signals) or computations (computeds,
//!   effects)
//! - Edges represent dependencies: if A depends on B, there is an edge from B
//!   to A
//!
//! When a signal changes, we traverse the graph to find all affected nodes
//! and color them. The propagation engine then determines which of them
//! actually need to recompute.
//!
//! # Design Decisions
//!
//! 1. Edges live on the nodes themselves rather than in a central table, so a
//!    node that is dropped takes its edges with it.
//!
//! 2. Each edge is stored on both ends with the index of its mirror, which
//!    makes removal O(1).
//!
//! 3. Per-node state is three colors plus an epoch, so no traversal needs a
//!    visited set.

pub(crate) mod node;
pub(crate) mod propagate;
pub(crate) mod scheduler;

pub use node::{Color, NodeId, NodeKind};
pub use scheduler::Phase;
