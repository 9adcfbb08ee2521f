//! Cooperative cancellation token
//!
//! A `CancelToken` is passed by reference into every suspension point of a
//! long-running operation. It is checked before each discrete unit of work
//! (the next file of a download, the next package of an install, the next
//! subprocess) and propagated to child-process termination. Cancellation is
//! therefore not instantaneous mid-step, but never leaves on-disk state
//! between snapshot-consistent points.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{Error, Result};

/// Cloneable cancellation handle shared by an operation and its controller
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    /// Create a new, un-cancelled token
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Check whether cancellation has been requested
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Return `Error::Cancelled` if cancellation has been requested
    pub fn err_if_cancelled(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_starts_uncancelled() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        assert!(token.err_if_cancelled().is_ok());
    }

    #[test]
    fn test_cancel_is_visible_through_clones() {
        let token = CancelToken::new();
        let clone = token.clone();

        token.cancel();

        assert!(clone.is_cancelled());
        assert!(matches!(
            clone.err_if_cancelled(),
            Err(Error::Cancelled)
        ));
    }
}
