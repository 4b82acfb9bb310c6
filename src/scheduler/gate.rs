//! Single-slot backup gate
//!
//! At most one backup runs per process. Acquisition never waits: a caller
//! that finds the slot taken gets [`Error::Busy`] naming the current holder
//! and is expected to skip its run.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::{Error, Result};

/// Non-blocking mutual exclusion over one slot
#[derive(Clone, Default)]
pub struct BackupGate {
    slot: Arc<AsyncMutex<()>>,
    holder: Arc<Mutex<Option<String>>>,
}

/// Proof of holding the gate; the slot frees on drop
pub struct GateGuard {
    _permit: OwnedMutexGuard<()>,
    holder: Arc<Mutex<Option<String>>>,
}

impl Drop for GateGuard {
    fn drop(&mut self) {
        *self.holder.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

impl BackupGate {
    /// Create an open gate
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the slot for `who`, or fail with [`Error::Busy`]
    pub fn try_acquire(&self, who: &str) -> Result<GateGuard> {
        let mut holder = self.holder.lock().unwrap_or_else(PoisonError::into_inner);
        match self.slot.clone().try_lock_owned() {
            Ok(permit) => {
                *holder = Some(who.to_string());
                Ok(GateGuard {
                    _permit: permit,
                    holder: self.holder.clone(),
                })
            }
            Err(_) => Err(Error::Busy {
                holder: holder.clone().unwrap_or_else(|| "unknown".to_string()),
            }),
        }
    }

    /// Current holder, if any
    pub fn holder(&self) -> Option<String> {
        self.holder
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
