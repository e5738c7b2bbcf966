//! Flash-access exclusion.
//!
//! Container installs, uninstalls and firmware writes all mutate durable
//! storage and must never interleave. They serialize through one
//! [`FlashLock`]. Each operation carries a deadline that bounds both the
//! wait for the lock and the work done while holding it; exceeding it fails
//! that operation with [`Error::Timeout`] instead of blocking forever.

use crate::error::{Error, Result};
use std::future::Future;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

/// Single-permit exclusion primitive for flash-writing operations.
pub struct FlashLock {
    permit: Semaphore,
}

impl FlashLock {
    /// Creates an unlocked flash lock.
    pub fn new() -> Self {
        Self {
            permit: Semaphore::new(1),
        }
    }

    /// Returns true while an operation holds the lock.
    pub fn is_busy(&self) -> bool {
        self.permit.available_permits() == 0
    }

    /// Runs `work` with exclusive flash access, bounded by `deadline`.
    ///
    /// When the deadline fires, `work` is dropped wherever it is suspended;
    /// staged writes clean up after themselves on drop.
    pub async fn run<T, F>(&self, operation: &str, deadline: Duration, work: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let guarded = async {
            let _permit = self
                .permit
                .acquire()
                .await
                .map_err(|e| Error::Internal(format!("flash lock closed: {e}")))?;
            debug!(operation, "flash lock acquired");
            work.await
        };

        match tokio::time::timeout(deadline, guarded).await {
            Ok(result) => result,
            Err(_) => {
                warn!(operation, deadline = ?deadline, "flash operation exceeded deadline");
                Err(Error::Timeout {
                    operation: operation.to_string(),
                    duration: deadline,
                })
            }
        }
    }
}

impl Default for FlashLock {
    fn default() -> Self {
        Self::new()
    }
}
