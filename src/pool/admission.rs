//! Admission control
//!
//! Caps the number of simultaneously busy slots with a semaphore. Every slot
//! handle owns one permit; the permit goes back when the handle is released.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tracing::debug;

use crate::config::{AdmissionConfig, AdmissionMode};
use crate::error::PoolError;
use crate::metrics::{ADMISSION_REJECTED, ADMISSION_WAIT};

pub struct AdmissionController {
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
    mode: AdmissionMode,
    wait_timeout: Duration,
}

impl AdmissionController {
    pub fn new(config: &AdmissionConfig) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(config.max_concurrent)),
            max_concurrent: config.max_concurrent,
            mode: config.mode,
            wait_timeout: config.wait_timeout(),
        }
    }

    pub fn mode(&self) -> AdmissionMode {
        self.mode
    }

    pub fn wait_timeout(&self) -> Duration {
        self.wait_timeout
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Permits not currently held
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Take a permit without waiting
    pub fn try_admit(&self) -> Result<OwnedSemaphorePermit, PoolError> {
        match Arc::clone(&self.semaphore).try_acquire_owned() {
            Ok(permit) => Ok(permit),
            Err(TryAcquireError::NoPermits) => {
                ADMISSION_REJECTED.inc();
                Err(PoolError::Busy(format!(
                    "all {} admission permits in use",
                    self.max_concurrent
                )))
            }
            Err(TryAcquireError::Closed) => Err(PoolError::Cancelled),
        }
    }

    /// Take a permit for the pool's own work, if one is free
    pub fn try_reserve(&self) -> Option<OwnedSemaphorePermit> {
        Arc::clone(&self.semaphore).try_acquire_owned().ok()
    }

    /// Wait for a permit until `deadline`
    ///
    /// Dropping the returned future leaves the semaphore's wait queue.
    pub async fn admit_until(
        &self,
        deadline: tokio::time::Instant,
    ) -> Result<OwnedSemaphorePermit, PoolError> {
        let start = Instant::now();
        let acquired =
            tokio::time::timeout_at(deadline, Arc::clone(&self.semaphore).acquire_owned()).await;
        ADMISSION_WAIT.observe(start.elapsed().as_secs_f64());

        match acquired {
            Ok(Ok(permit)) => {
                debug!(waited_ms = start.elapsed().as_millis() as u64, "admitted");
                Ok(permit)
            }
            Ok(Err(_closed)) => Err(PoolError::Cancelled),
            Err(_) => {
                ADMISSION_REJECTED.inc();
                Err(PoolError::Busy(format!(
                    "no admission permit within {:?}",
                    start.elapsed()
                )))
            }
        }
    }

    /// Take a permit according to the configured mode
    pub async fn admit(&self) -> Result<OwnedSemaphorePermit, PoolError> {
        match self.mode {
            AdmissionMode::NonBlocking => self.try_admit(),
            AdmissionMode::Blocking => {
                self.admit_until(tokio::time::Instant::now() + self.wait_timeout)
                    .await
            }
        }
    }

    /// Refuse all further admissions; pending waits fail with `Cancelled`
    pub fn close(&self) {
        self.semaphore.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller(max: usize, mode: AdmissionMode, wait_ms: u64) -> AdmissionController {
        AdmissionController::new(&AdmissionConfig {
            max_concurrent: max,
            mode,
            wait_timeout_ms: wait_ms,
        })
    }

    #[tokio::test]
    async fn test_non_blocking_returns_busy() {
        let admission = controller(1, AdmissionMode::NonBlocking, 0);
        let _held = admission.admit().await.unwrap();
        assert!(matches!(admission.admit().await, Err(PoolError::Busy(_))));
        assert_eq!(admission.available(), 0);
    }

    #[tokio::test]
    async fn test_blocking_waits_for_release() {
        let admission = Arc::new(controller(1, AdmissionMode::Blocking, 2_000));
        let held = admission.admit().await.unwrap();

        let waiter = {
            let admission = Arc::clone(&admission);
            tokio::spawn(async move { admission.admit().await.map(drop) })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(held);
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_blocking_times_out() {
        let admission = controller(1, AdmissionMode::Blocking, 50);
        let _held = admission.admit().await.unwrap();
        assert!(matches!(admission.admit().await, Err(PoolError::Busy(_))));
    }

    #[tokio::test]
    async fn test_dropped_wait_leaves_queue() {
        let admission = controller(1, AdmissionMode::Blocking, 5_000);
        let held = admission.admit().await.unwrap();
        {
            let pending = admission.admit();
            let _ = tokio::time::timeout(Duration::from_millis(20), pending).await;
        }
        drop(held);
        // the abandoned waiter did not swallow the permit
        assert_eq!(admission.available(), 1);
    }

    #[tokio::test]
    async fn test_close_cancels() {
        let admission = controller(1, AdmissionMode::Blocking, 5_000);
        admission.close();
        assert_eq!(admission.admit().await.unwrap_err(), PoolError::Cancelled);
    }
}
