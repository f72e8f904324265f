use crate::transport::errors::{Result, TransportError};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Fixed size of the listener worker pool when none is configured.
pub const DEFAULT_POOL_SIZE: usize = 20;

/// Size-bounded worker pool shared by every service task manager of one
/// transport listener. Each listener task holds one slot for its entire
/// lifetime, so the pool size is the upper bound on concurrently
/// listening tasks. The pool is never resized after creation.
pub struct WorkerPool {
    slots: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        WorkerPool {
            slots: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Slots not currently held by a running task.
    pub fn available(&self) -> usize {
        self.slots.available_permits()
    }

    /// Wait for a pool slot; the permit is held for the task's lifetime.
    pub async fn acquire_slot(&self) -> Result<OwnedSemaphorePermit> {
        self.slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| TransportError::Unknown("worker pool is closed".to_string()))
    }

    /// Non-blocking variant, used by diagnostics and tests.
    pub fn try_slot(&self) -> Option<OwnedSemaphorePermit> {
        self.slots.clone().try_acquire_owned().ok()
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        WorkerPool::new(DEFAULT_POOL_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_is_bounded() {
        let pool = WorkerPool::new(2);
        assert_eq!(pool.size(), 2);

        let first = pool.try_slot().unwrap();
        let _second = pool.try_slot().unwrap();
        assert_eq!(pool.available(), 0);
        assert!(pool.try_slot().is_none());

        drop(first);
        assert!(pool.try_slot().is_some());
    }

    #[tokio::test]
    async fn test_acquire_slot_waits_for_capacity() {
        let pool = WorkerPool::new(1);
        let held = pool.acquire_slot().await.unwrap();
        assert!(pool.try_slot().is_none());
        drop(held);
        let reacquired = pool.acquire_slot().await.unwrap();
        drop(reacquired);
        assert_eq!(pool.available(), 1);
    }
}
