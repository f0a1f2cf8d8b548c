//! Reactive Primitives
//!
//! This module implements the core reactive system: signals, computeds, and
//! effects, plus the batching runtime that drives them.
//!
//! # Concepts
//!
//! ## Signals
//!
//! A Signal is a container for mutable state. When a signal's value is read
//! within a tracking context (such as a computed or effect), the signal
//! records that context as an observer. When the signal's value changes, its
//! observers are invalidated and its listeners notified.
//!
//! ## Computeds
//!
//! A Computed is a derived value that caches its result. It re-evaluates only
//! when one of its dependencies changed, and only when it is read (or a
//! listener needs its new value).
//!
//! ## Effects
//!
//! An Effect is a side-effecting computation that runs whenever its
//! dependencies change. Effects are used to synchronize reactive state with
//! external systems, such as a terminal view or a log.
//!
//! ## Batches
//!
//! Every write belongs to a transaction. [`batch`] groups several writes into
//! one, so listeners and effects run once, after all of them.
//!
//! # Implementation Notes
//!
//! The reactive system uses a thread-local tracking context to automatically
//! detect dependencies. When a signal is read, we check if there is an active
//! tracking context and, if so, link it to the signal.
//!
//! This approach (sometimes called "automatic dependency tracking" or
//! "transparent reactivity") is used by SolidJS, Vue 3, and Leptos.

mod computed;
mod context;
mod effect;
mod runtime;
mod signal;
mod subscriber;

pub use computed::{computed, Computed};
pub use context::{is_tracking, on_cleanup, untracked};
pub use effect::{effect, Effect};
pub use runtime::{batch, config, configure, subscribe, Reactive, Runtime};
pub use signal::{signal, Signal};
pub use subscriber::{SubscriberId, Subscription};

pub(crate) use runtime::schedule;
