//! Single-assignment slot for the first error seen by any pipeline thread.

use std::sync::OnceLock;

/// Holds at most one error; the first `record` wins and later ones are dropped.
pub struct FailureCell<E> {
    slot: OnceLock<E>,
}

impl<E> FailureCell<E> {
    pub fn new() -> Self {
        Self {
            slot: OnceLock::new(),
        }
    }

    /// Store `error` if no error was recorded yet. Returns `true` if it was stored.
    pub fn record(&self, error: E) -> bool {
        self.slot.set(error).is_ok()
    }

    pub fn is_set(&self) -> bool {
        self.slot.get().is_some()
    }

    pub fn into_inner(self) -> Option<E> {
        self.slot.into_inner()
    }
}

impl<E> Default for FailureCell<E> {
    fn default() -> Self {
        Self::new()
    }
}
