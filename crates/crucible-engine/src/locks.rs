//! Per-installation operation locks
//!
//! Exactly one orchestrated operation may run per installation id; a
//! second concurrent request is rejected, never interleaved. Each id has
//! its own lock; there is no global lock across installations.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use crucible_core::{Error, Result};

/// Tracks which installation ids have an operation in flight
#[derive(Debug, Clone, Default)]
pub struct OperationLocks {
    active: Arc<Mutex<HashSet<String>>>,
}

impl OperationLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim an id; fails immediately when one is already in flight
    pub fn acquire(&self, installation_id: &str) -> Result<OperationGuard> {
        let mut active = self.active.lock().expect("lock state poisoned");
        if !active.insert(installation_id.to_string()) {
            return Err(Error::operation_in_flight(installation_id));
        }
        Ok(OperationGuard {
            active: self.active.clone(),
            installation_id: installation_id.to_string(),
        })
    }

    /// Whether an operation is in flight for the id
    pub fn is_active(&self, installation_id: &str) -> bool {
        self.active
            .lock()
            .expect("lock state poisoned")
            .contains(installation_id)
    }
}

/// Releases the claimed id on drop, panics included
#[derive(Debug)]
pub struct OperationGuard {
    active: Arc<Mutex<HashSet<String>>>,
    installation_id: String,
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        self.active
            .lock()
            .expect("lock state poisoned")
            .remove(&self.installation_id);
    }
}
