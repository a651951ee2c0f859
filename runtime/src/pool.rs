//! Bounded worker pools.
//!
//! A [`BoundedPool`] caps how many invocations of one stage run at the same
//! time. Work beyond the ceiling waits in the semaphore's FIFO queue instead
//! of being spawned unboundedly; reaching the ceiling is backpressure, never
//! an error surfaced to the submitter.
//!
//! ## Usage
//!
//! ```
//! use rowflow_runtime::pool::BoundedPool;
//!
//! # async fn example() {
//! let pool = BoundedPool::new("ingestion", 10);
//!
//! pool.submit(async {
//!     // one invocation
//! });
//!
//! pool.wait_idle().await;
//! assert!(pool.peak() <= 10);
//! # }
//! ```

use crate::metrics::PoolMetrics;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};

/// Errors from pool operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// The pool was closed and grants no more permits
    #[error("Pool '{0}' is closed")]
    Closed(String),
}

#[derive(Debug)]
struct PoolInner {
    name: String,
    max_concurrency: usize,
    semaphore: Arc<Semaphore>,
    active: AtomicUsize,
    peak: AtomicUsize,
    queued: AtomicUsize,
    outstanding: AtomicUsize,
    idle: Notify,
}

/// A named concurrency ceiling.
///
/// Cloning is cheap; clones share the same ceiling.
#[derive(Debug, Clone)]
pub struct BoundedPool {
    inner: Arc<PoolInner>,
}

impl BoundedPool {
    /// Create a pool allowing at most `max_concurrency` simultaneous invocations.
    ///
    /// A ceiling of zero is raised to one.
    #[must_use]
    pub fn new(name: impl Into<String>, max_concurrency: usize) -> Self {
        let max_concurrency = max_concurrency.max(1);
        Self {
            inner: Arc::new(PoolInner {
                name: name.into(),
                max_concurrency,
                semaphore: Arc::new(Semaphore::new(max_concurrency)),
                active: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                queued: AtomicUsize::new(0),
                outstanding: AtomicUsize::new(0),
                idle: Notify::new(),
            }),
        }
    }

    /// Pool name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Configured ceiling.
    #[must_use]
    pub fn max_concurrency(&self) -> usize {
        self.inner.max_concurrency
    }

    /// Invocations currently holding a permit.
    #[must_use]
    pub fn active(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously active invocations seen.
    #[must_use]
    pub fn peak(&self) -> usize {
        self.inner.peak.load(Ordering::SeqCst)
    }

    /// Invocations waiting for a permit.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.inner.queued.load(Ordering::SeqCst)
    }

    /// Wait for a permit.
    ///
    /// The invocation counts as active until the returned permit is dropped.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::Closed`] if the pool was closed while waiting.
    pub async fn acquire(&self) -> Result<PoolPermit, PoolError> {
        let inner = &self.inner;
        inner.queued.fetch_add(1, Ordering::SeqCst);
        PoolMetrics::record_queued(&inner.name, self.queued());

        let acquired = Arc::clone(&inner.semaphore).acquire_owned().await;
        inner.queued.fetch_sub(1, Ordering::SeqCst);
        PoolMetrics::record_queued(&inner.name, self.queued());

        let permit = acquired.map_err(|_| PoolError::Closed(inner.name.clone()))?;
        let active = inner.active.fetch_add(1, Ordering::SeqCst) + 1;
        inner.peak.fetch_max(active, Ordering::SeqCst);
        PoolMetrics::record_active(&inner.name, active);

        Ok(PoolPermit {
            pool: Arc::clone(inner),
            _permit: permit,
        })
    }

    /// Run `job` once a permit is free, without blocking the caller.
    ///
    /// Jobs submitted to a closed pool are dropped with a warning.
    pub fn submit<F>(&self, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.inner.outstanding.fetch_add(1, Ordering::SeqCst);
        let pool = self.clone();
        tokio::spawn(async move {
            match pool.acquire().await {
                Ok(permit) => {
                    job.await;
                    drop(permit);
                }
                Err(e) => {
                    tracing::warn!(pool = %pool.name(), error = %e, "Dropping job submitted to closed pool");
                }
            }
            pool.finish_one();
        });
    }

    /// Wait until every submitted job has finished.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if self.inner.outstanding.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Stop granting permits; waiting and future acquisitions fail.
    pub fn close(&self) {
        self.inner.semaphore.close();
    }

    fn finish_one(&self) {
        if self.inner.outstanding.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.inner.idle.notify_waiters();
        }
    }
}

/// Proof of a held slot in a [`BoundedPool`].
#[derive(Debug)]
pub struct PoolPermit {
    pool: Arc<PoolInner>,
    _permit: OwnedSemaphorePermit,
}

impl Drop for PoolPermit {
    fn drop(&mut self) {
        let active = self.pool.active.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        PoolMetrics::record_active(&self.pool.name, active);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn ceiling_is_never_exceeded() {
        let pool = BoundedPool::new("test", 4);
        let running = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicUsize::new(0));

        for _ in 0..40 {
            let running = Arc::clone(&running);
            let max_seen = Arc::clone(&max_seen);
            let done = Arc::clone(&done);
            pool.submit(async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                done.fetch_add(1, Ordering::SeqCst);
            });
        }

        tokio::time::timeout(Duration::from_secs(5), pool.wait_idle())
            .await
            .unwrap();

        assert_eq!(done.load(Ordering::SeqCst), 40);
        assert!(max_seen.load(Ordering::SeqCst) <= 4);
        assert!(pool.peak() <= 4);
        assert_eq!(pool.active(), 0);
        assert_eq!(pool.queued(), 0);
    }

    #[tokio::test]
    async fn permit_release_frees_slot() {
        let pool = BoundedPool::new("test", 1);
        let first = pool.acquire().await.unwrap();
        assert_eq!(pool.active(), 1);

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await.map(drop) })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(pool.queued(), 1);

        drop(first);
        waiter.await.unwrap().unwrap();
        assert_eq!(pool.active(), 0);
        assert_eq!(pool.peak(), 1);
    }

    #[tokio::test]
    async fn closed_pool_rejects_acquire() {
        let pool = BoundedPool::new("test", 1);
        pool.close();
        assert_eq!(
            pool.acquire().await.unwrap_err(),
            PoolError::Closed("test".to_string())
        );
    }

    #[tokio::test]
    async fn wait_idle_returns_immediately_when_empty() {
        let pool = BoundedPool::new("test", 2);
        tokio::time::timeout(Duration::from_millis(100), pool.wait_idle())
            .await
            .unwrap();
    }
}
