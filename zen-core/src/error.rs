//! Error types for the reactive core.
//!
//! User code never fails through these types directly: a derivation or
//! effect that panics unwinds through the core, which restores its own
//! bookkeeping on the way out. The errors below describe misuse of the graph
//! (assigning to a computed, cycles) and panics that were isolated during a
//! flush so that unrelated listeners could still run.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};

use thiserror::Error;

use crate::graph::NodeId;

/// Where a dependency cycle was detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cycle {
    /// A computed read itself, directly or transitively, while evaluating.
    SelfRead(NodeId),

    /// A flush processed more work items than the configured limit, which
    /// happens when effects or listeners keep re-triggering each other.
    FlushLimit {
        /// The limit that was exceeded.
        limit: usize,
    },
}

impl fmt::Display for Cycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cycle::SelfRead(node) => write!(f, "computed {node} read itself during evaluation"),
            Cycle::FlushLimit { limit } => {
                write!(f, "flush exceeded {limit} updates without settling")
            }
        }
    }
}

/// Errors surfaced by the reactive core.
#[derive(Debug, Error)]
pub enum ReactiveError {
    /// Attempted to assign a value to a read-only computed node.
    #[error("cannot assign to computed {node}: computed values are read-only")]
    InvalidAssignment {
        /// The computed that was assigned to.
        node: NodeId,
    },

    /// The dependency graph contains a cycle.
    #[error("cyclic dependency detected: {0}")]
    CyclicDependency(Cycle),

    /// One or more listeners, effects or derivations panicked during a flush.
    ///
    /// The remaining work of the flush still ran. `payload` is the payload of
    /// the first panic, kept so the original unwind can be resumed.
    #[error("{failures} reactive callback(s) panicked during flush: {message}")]
    Evaluation {
        /// Number of isolated failures in the flush.
        failures: usize,
        /// Message of the first panic.
        message: String,
        /// Payload of the first panic.
        payload: Option<Box<dyn Any + Send>>,
    },
}

impl ReactiveError {
    /// Build an error from a caught panic payload.
    ///
    /// A payload raised by [`raise`](Self::raise) is unwrapped back into the
    /// original error; anything else becomes an `Evaluation` error.
    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        match payload.downcast::<ReactiveError>() {
            Ok(err) => *err,
            Err(payload) => Self::Evaluation {
                failures: 1,
                message: panic_message(payload.as_ref()),
                payload: Some(payload),
            },
        }
    }

    /// Run `f`, turning a panic raised by [`raise`](Self::raise) back into an
    /// error. Any other panic keeps unwinding.
    pub(crate) fn catch<R>(f: impl FnOnce() -> R) -> Result<R, Self> {
        panic::catch_unwind(AssertUnwindSafe(f)).or_else(|payload| {
            match payload.downcast::<ReactiveError>() {
                Ok(err) => Err(*err),
                Err(payload) => panic::resume_unwind(payload),
            }
        })
    }

    /// Whether this error reports a dependency cycle.
    pub fn is_cycle(&self) -> bool {
        matches!(self, Self::CyclicDependency(_))
    }

    /// Turn the error into a panic.
    ///
    /// Isolated panics resume with their original payload, so the caller
    /// observes exactly what the user callback raised. Graph errors panic
    /// with the error itself as payload; the fallible accessors
    /// (`try_get`, `try_set`) turn such a panic back into an `Err` when it
    /// crosses them.
    pub fn raise(self) -> ! {
        match self {
            Self::Evaluation {
                payload: Some(payload),
                ..
            } => panic::resume_unwind(payload),
            other => panic::panic_any(other),
        }
    }
}

/// Extract a readable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(err) = payload.downcast_ref::<ReactiveError>() {
        err.to_string()
    } else if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_node() {
        let node = NodeId::from(7);

        let err = ReactiveError::InvalidAssignment { node };
        assert_eq!(
            err.to_string(),
            "cannot assign to computed #7: computed values are read-only"
        );

        let err = ReactiveError::CyclicDependency(Cycle::SelfRead(node));
        assert!(err.is_cycle());
        assert_eq!(
            err.to_string(),
            "cyclic dependency detected: computed #7 read itself during evaluation"
        );
    }

    #[test]
    fn evaluation_error_keeps_first_message() {
        let err = ReactiveError::from_panic(Box::new("boom"));
        assert_eq!(
            err.to_string(),
            "1 reactive callback(s) panicked during flush: boom"
        );

        let err = ReactiveError::from_panic(Box::new(String::from("owned")));
        assert!(err.to_string().ends_with("owned"));
    }

    #[test]
    #[should_panic(expected = "original payload")]
    fn raise_resumes_original_panic() {
        let err = ReactiveError::from_panic(Box::new("original payload"));
        err.raise();
    }

    #[test]
    fn raised_graph_error_round_trips() {
        let node = NodeId::from(3);
        let result: Result<(), _> = ReactiveError::catch(|| {
            ReactiveError::CyclicDependency(Cycle::SelfRead(node)).raise()
        });
        match result {
            Err(ReactiveError::CyclicDependency(Cycle::SelfRead(id))) => assert_eq!(id, node),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn from_panic_unwraps_raised_errors() {
        let payload: Box<dyn Any + Send> =
            Box::new(ReactiveError::InvalidAssignment { node: NodeId::from(1) });
        assert!(matches!(
            ReactiveError::from_panic(payload),
            ReactiveError::InvalidAssignment { .. }
        ));
    }

    #[test]
    #[should_panic(expected = "plain panic")]
    fn catch_lets_other_panics_through() {
        let _ = ReactiveError::catch(|| panic!("plain panic"));
    }
}
