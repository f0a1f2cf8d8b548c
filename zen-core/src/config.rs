//! Runtime configuration.
//!
//! Each thread owns its own reactive runtime, so configuration is applied per
//! thread through [`configure`](crate::configure). The struct deserializes
//! from partial documents: missing fields fall back to their defaults.

use serde::{Deserialize, Serialize};

/// Default number of work items a single flush may process.
pub const DEFAULT_FLUSH_LIMIT: usize = 100_000;

/// Tunables for the batch scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Maximum number of work items (computed updates, signal notifications
    /// and effect runs) processed in one flush before it is aborted with a
    /// cyclic dependency error.
    pub flush_limit: usize,

    /// Run each listener and effect under `catch_unwind` so one failing
    /// callback does not prevent the rest of the flush from running.
    ///
    /// When disabled, the first panic unwinds straight out of the flush.
    pub isolate_panics: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            flush_limit: DEFAULT_FLUSH_LIMIT,
            isolate_panics: true,
        }
    }
}
