//! Concurrency bounds.
//!
//! Sessions-per-process is a global semaphore handed out as `UploadSlot`s;
//! chunks-per-session is a `ChunkPool` over a `JoinSet`. Every slot signals
//! `slot_released` when dropped, whichever path (queued, direct or resume)
//! acquired it.

use std::future::Future;
use std::sync::Arc;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::task::{JoinError, JoinSet};

/// Holds one of the `max_concurrent_uploads` slots until dropped
#[derive(Debug)]
pub struct UploadSlot {
    permit: Option<OwnedSemaphorePermit>,
    released: Arc<Notify>,
}

impl Drop for UploadSlot {
    fn drop(&mut self) {
        // Return the permit before waking, so the woken side can take it
        drop(self.permit.take());
        self.released.notify_one();
    }
}

#[derive(Debug, Clone)]
pub struct ConcurrencyController {
    uploads: Arc<Semaphore>,
    released: Arc<Notify>,
    max_concurrent_uploads: usize,
    max_concurrent_chunks: usize,
}

impl ConcurrencyController {
    pub fn new(max_concurrent_uploads: usize, max_concurrent_chunks: usize) -> Self {
        let max_concurrent_uploads = max_concurrent_uploads.max(1);
        Self {
            uploads: Arc::new(Semaphore::new(max_concurrent_uploads)),
            released: Arc::new(Notify::new()),
            max_concurrent_uploads,
            max_concurrent_chunks: max_concurrent_chunks.max(1),
        }
    }

    /// Wait for a free upload slot
    pub async fn acquire_slot(&self) -> UploadSlot {
        // The semaphore is never closed, so acquisition cannot fail
        match Arc::clone(&self.uploads).acquire_owned().await {
            Ok(permit) => self.slot(permit),
            Err(_) => unreachable!("upload semaphore closed"),
        }
    }

    /// Take a slot only if one is free right now
    pub fn try_acquire_slot(&self) -> Option<UploadSlot> {
        match Arc::clone(&self.uploads).try_acquire_owned() {
            Ok(permit) => Some(self.slot(permit)),
            Err(TryAcquireError::NoPermits) | Err(TryAcquireError::Closed) => None,
        }
    }

    fn slot(&self, permit: OwnedSemaphorePermit) -> UploadSlot {
        UploadSlot {
            permit: Some(permit),
            released: Arc::clone(&self.released),
        }
    }

    /// Notified once per dropped slot. A release with nobody waiting is
    /// remembered for the next `notified().await`.
    pub fn slot_released(&self) -> Arc<Notify> {
        Arc::clone(&self.released)
    }

    pub fn available_slots(&self) -> usize {
        self.uploads.available_permits()
    }

    pub fn active_uploads(&self) -> usize {
        self.max_concurrent_uploads - self.available_slots()
    }

    pub fn max_concurrent_uploads(&self) -> usize {
        self.max_concurrent_uploads
    }

    pub fn max_concurrent_chunks(&self) -> usize {
        self.max_concurrent_chunks
    }

    /// New per-session pool sized to the chunk bound
    pub fn chunk_pool<T: Send + 'static>(&self) -> ChunkPool<T> {
        ChunkPool::new(self.max_concurrent_chunks)
    }
}

/// Bounded set of in-flight chunk tasks for one session
pub struct ChunkPool<T> {
    tasks: JoinSet<T>,
    limit: usize,
}

impl<T: Send + 'static> ChunkPool<T> {
    pub fn new(limit: usize) -> Self {
        Self {
            tasks: JoinSet::new(),
            limit: limit.max(1),
        }
    }

    pub fn has_capacity(&self) -> bool {
        self.tasks.len() < self.limit
    }

    pub fn in_flight(&self) -> usize {
        self.tasks.len()
    }

    /// Spawn a task. Callers check `has_capacity` first; the pool does not queue.
    pub fn spawn<F>(&mut self, task: F)
    where
        F: Future<Output = T> + Send + 'static,
    {
        debug_assert!(self.has_capacity(), "chunk pool over capacity");
        self.tasks.spawn(task);
    }

    /// Next settled task, or `None` when nothing is in flight
    pub async fn next(&mut self) -> Option<Result<T, JoinError>> {
        self.tasks.join_next().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_slots_are_bounded() {
        let controller = ConcurrencyController::new(2, 3);

        let a = controller.try_acquire_slot();
        let b = controller.try_acquire_slot();
        assert!(a.is_some() && b.is_some());
        assert!(controller.try_acquire_slot().is_none());
        assert_eq!(controller.active_uploads(), 2);

        drop(a);
        assert_eq!(controller.available_slots(), 1);
        let _c = controller.acquire_slot().await;
        assert_eq!(controller.available_slots(), 0);
    }

    #[tokio::test]
    async fn test_chunk_pool_never_exceeds_limit() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut pool: ChunkPool<usize> = ChunkPool::new(3);
        let mut pending: Vec<usize> = (0..10).collect();
        let mut done = Vec::new();

        loop {
            while pool.has_capacity() {
                let Some(index) = pending.pop() else { break };
                let in_flight = Arc::clone(&in_flight);
                let peak = Arc::clone(&peak);
                pool.spawn(async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    index
                });
            }
            assert!(pool.in_flight() <= 3);
            match pool.next().await {
                Some(result) => done.push(result.unwrap()),
                None => break,
            }
        }

        done.sort();
        assert_eq!(done, (0..10).collect::<Vec<_>>());
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn test_dropping_slot_signals_release() {
        let controller = ConcurrencyController::new(1, 1);
        let released = controller.slot_released();

        let slot = controller.acquire_slot().await;
        drop(slot);

        // The release happened before anyone waited, and must still be seen
        tokio::time::timeout(Duration::from_secs(1), released.notified())
            .await
            .expect("slot release was not signalled");
        assert!(controller.try_acquire_slot().is_some());
    }

    #[test]
    fn test_zero_limits_are_raised_to_one() {
        let controller = ConcurrencyController::new(0, 0);
        assert_eq!(controller.max_concurrent_uploads(), 1);
        assert_eq!(controller.max_concurrent_chunks(), 1);
    }
}
