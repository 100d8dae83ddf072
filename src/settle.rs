//! Settle delay for continuous replication pairs.
//!
//! Journal based replication ships recovery points asynchronously and reports
//! no completion event, so the pre-validator waits a fixed time after seeding
//! test data. The wait can be cancelled from another thread.

use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::error::{DrError, Result};

pub trait Settle: Send + Sync {
    /// Block for `delay` unless cancelled first.
    fn settle(&self, delay: Duration) -> Result<()>;
}

#[derive(Default)]
struct CancelState {
    cancelled: Mutex<bool>,
    wake: Condvar,
}

/// Handle that cancels every in-flight and future wait of a `CancellableSettle`.
#[derive(Clone)]
pub struct CancelToken {
    state: Arc<CancelState>,
}

impl CancelToken {
    pub fn cancel(&self) {
        let mut cancelled = self
            .state
            .cancelled
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *cancelled = true;
        self.state.wake.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        *self
            .state
            .cancelled
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Blocking wait on a condvar that returns early with `DrError::Cancelled`.
#[derive(Default)]
pub struct CancellableSettle {
    state: Arc<CancelState>,
}

impl CancellableSettle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn token(&self) -> CancelToken {
        CancelToken {
            state: Arc::clone(&self.state),
        }
    }
}

impl Settle for CancellableSettle {
    fn settle(&self, delay: Duration) -> Result<()> {
        if delay.is_zero() {
            return Ok(());
        }
        tracing::info!(delay = %humantime::format_duration(delay), "waiting for continuous replication to settle");
        let guard = self
            .state
            .cancelled
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let (cancelled, _) = self
            .state
            .wake
            .wait_timeout_while(guard, delay, |cancelled| !*cancelled)
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if *cancelled {
            tracing::warn!("settle wait cancelled");
            return Err(DrError::Cancelled);
        }
        Ok(())
    }
}
