//! Zen Core
//!
//! This crate provides a fine-grained reactive signals engine. It implements:
//!
//! - Reactive primitives (signals, computeds, effects)
//! - Automatic dependency tracking
//! - Glitch-free push-pull propagation with CLEAN/CHECK/DIRTY coloring
//! - Batched transactions with per-transaction deduplication
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `reactive`: Core reactive primitives, dependency tracking and the runtime
//! - `graph`: Node records, the propagation walk and the scheduler queues
//! - `error`: Errors surfaced by the runtime
//! - `config`: Per-thread runtime configuration
//!
//! Handles are single-threaded (`Rc`-based). Each thread has its own runtime.
//!
//! # Example
//!
//! ```rust
//! use std::cell::RefCell;
//! use std::rc::Rc;
//!
//! use zen_core::{batch, computed, effect, signal};
//!
//! let a = signal(1);
//! let b = signal(2);
//! let sum = computed({
//!     let (a, b) = (a.clone(), b.clone());
//!     move || a.get() + b.get()
//! });
//!
//! let log = Rc::new(RefCell::new(Vec::new()));
//! let _watch = effect({
//!     let (sum, log) = (sum.clone(), log.clone());
//!     move || log.borrow_mut().push(sum.get())
//! });
//!
//! // Both writes land in one transaction: the effect runs once.
//! batch(|| {
//!     a.set(10);
//!     b.set(20);
//! })
//! .unwrap();
//!
//! assert_eq!(*log.borrow(), [3, 30]);
//! ```

pub mod config;
pub mod error;
pub mod graph;
pub mod reactive;

pub use config::RuntimeConfig;
pub use error::{Cycle, ReactiveError};
pub use graph::{Color, NodeId, NodeKind, Phase};
pub use reactive::{
    batch, computed, config, configure, effect, is_tracking, on_cleanup, signal, subscribe,
    untracked, Computed, Effect, Reactive, Runtime, Signal, SubscriberId, Subscription,
};
