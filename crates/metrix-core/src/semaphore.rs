//! Bounded concurrency gate shared by a pool of tasks.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore as TokioSemaphore};

/// Counting semaphore where `max = 0` means unbounded.
#[derive(Debug, Clone)]
pub struct Semaphore {
    inner: Option<Arc<TokioSemaphore>>,
}

/// Slot held between [`Semaphore::acquire`] and release (drop).
#[derive(Debug)]
pub struct SemaphoreGuard {
    _permit: Option<OwnedSemaphorePermit>,
}

impl SemaphoreGuard {
    /// Give the slot back. Equivalent to dropping the guard.
    pub fn release(self) {}
}

impl Semaphore {
    pub fn new(max: usize) -> Self {
        Self {
            inner: (max > 0).then(|| Arc::new(TokioSemaphore::new(max))),
        }
    }

    pub fn is_bounded(&self) -> bool {
        self.inner.is_some()
    }

    /// Wait until fewer than `max` guards are alive and take a slot.
    pub async fn acquire(&self) -> SemaphoreGuard {
        let permit = match &self.inner {
            // The semaphore is never closed, so acquisition cannot fail.
            Some(sem) => Arc::clone(sem).acquire_owned().await.ok(),
            None => None,
        };
        SemaphoreGuard { _permit: permit }
    }

    /// Free slots right now; `None` when unbounded.
    pub fn available(&self) -> Option<usize> {
        self.inner.as_ref().map(|sem| sem.available_permits())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn never_more_than_max_holders() {
        let sem = Semaphore::new(2);
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let sem = sem.clone();
                let active = Arc::clone(&active);
                let peak = Arc::clone(&peak);
                tokio::spawn(async move {
                    let guard = sem.acquire().await;
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    guard.release();
                })
            })
            .collect();
        for t in tasks {
            t.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(sem.available(), Some(2));
    }

    #[tokio::test]
    async fn zero_means_unbounded() {
        let sem = Semaphore::new(0);
        assert!(!sem.is_bounded());
        let guards: Vec<_> = acquire_many(&sem, 100).await;
        assert_eq!(guards.len(), 100);
        assert_eq!(sem.available(), None);
    }

    async fn acquire_many(sem: &Semaphore, n: usize) -> Vec<SemaphoreGuard> {
        let mut guards = Vec::with_capacity(n);
        for _ in 0..n {
            let guard = tokio::time::timeout(Duration::from_millis(100), sem.acquire())
                .await
                .expect("unbounded acquire must not block");
            guards.push(guard);
        }
        guards
    }

    #[tokio::test]
    async fn acquire_blocks_until_release() {
        let sem = Semaphore::new(1);
        let held = sem.acquire().await;
        assert!(
            tokio::time::timeout(Duration::from_millis(20), sem.acquire())
                .await
                .is_err()
        );
        drop(held);
        assert!(
            tokio::time::timeout(Duration::from_millis(100), sem.acquire())
                .await
                .is_ok()
        );
    }
}
