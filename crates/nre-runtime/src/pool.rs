// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Bounded pool for CPU-bound work (validation, dependency graphs).

use std::sync::Arc;

use tokio::sync::Semaphore;

use crate::error::RuntimeError;

/// Runs blocking jobs on Tokio's blocking threads, at most `size` at a time.
/// Jobs exchange data only through their return value.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    /// Pool admitting `size` concurrent jobs (at least one).
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    /// Configured concurrency.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Run `job` and return its result.
    pub async fn run<F, T>(&self, job: F) -> Result<T, RuntimeError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let _permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| RuntimeError::Shutdown)?;
        tokio::task::spawn_blocking(job)
            .await
            .map_err(|err| RuntimeError::Worker(err.to_string()))
    }

    /// Refuse further jobs.
    pub fn close(&self) {
        self.permits.close();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn jobs_return_values_and_close_refuses() {
        let pool = WorkerPool::new(0);
        assert_eq!(pool.size(), 1);
        assert_eq!(pool.run(|| 6 * 7).await.unwrap(), 42);
        pool.close();
        assert!(matches!(pool.run(|| 1).await, Err(RuntimeError::Shutdown)));
    }
}
