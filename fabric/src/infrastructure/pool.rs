// Copyright (c) 2026 Loom Contributors
// SPDX-License-Identifier: AGPL-3.0

//! Bounded access pool over a graph store.
//!
//! The pool hands out leases backed by semaphore permits: a lease is never
//! shared between two concurrent callers, and acquisition past the
//! configured wait fails with `PoolExhausted`. The pool is owned by the
//! facade and passed explicitly — tests may instantiate as many as they
//! like.

use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::{FabricError, Result};
use crate::infrastructure::graph::GraphStore;

/// Shared handle to a graph store with bounded concurrency.
#[derive(Clone)]
pub struct GraphPool {
    store: Arc<dyn GraphStore>,
    permits: Arc<Semaphore>,
    wait: Duration,
}

impl GraphPool {
    pub fn new(store: Arc<dyn GraphStore>, size: usize, wait: Duration) -> Self {
        Self {
            store,
            permits: Arc::new(Semaphore::new(size.max(1))),
            wait,
        }
    }

    /// Acquire a lease, waiting up to the configured bound.
    pub async fn acquire(&self) -> Result<GraphLease> {
        let permit = tokio::time::timeout(self.wait, self.permits.clone().acquire_owned())
            .await
            .map_err(|_| FabricError::PoolExhausted {
                waited_ms: self.wait.as_millis() as u64,
            })?
            .map_err(|_| FabricError::BackendUnavailable("connection pool closed".to_string()))?;
        Ok(GraphLease {
            store: self.store.clone(),
            _permit: permit,
        })
    }

    /// The underlying store, for bootstrap paths that run before the pool
    /// is in service (connectivity check, constraint installation).
    pub fn store(&self) -> &Arc<dyn GraphStore> {
        &self.store
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

/// An exclusive slot against the graph store. Dropping it returns the slot.
pub struct GraphLease {
    store: Arc<dyn GraphStore>,
    _permit: OwnedSemaphorePermit,
}

impl Deref for GraphLease {
    type Target = dyn GraphStore;

    fn deref(&self) -> &Self::Target {
        self.store.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::memory_store::MemoryGraphStore;

    fn pool(size: usize, wait_ms: u64) -> GraphPool {
        GraphPool::new(
            Arc::new(MemoryGraphStore::new()),
            size,
            Duration::from_millis(wait_ms),
        )
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let pool = pool(2, 50);
        assert_eq!(pool.available(), 2);
        {
            let _a = pool.acquire().await.unwrap();
            let _b = pool.acquire().await.unwrap();
            assert_eq!(pool.available(), 0);
        }
        assert_eq!(pool.available(), 2);
    }

    #[tokio::test]
    async fn test_exhausted_pool_times_out() {
        let pool = pool(1, 20);
        let _held = pool.acquire().await.unwrap();
        let result = pool.acquire().await;
        assert!(matches!(result, Err(FabricError::PoolExhausted { waited_ms: 20 })));
    }

    #[tokio::test]
    async fn test_waiter_gets_slot_when_released() {
        let pool = pool(1, 500);
        let held = pool.acquire().await.unwrap();
        let contender = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(held);
        contender.await.unwrap().unwrap();
    }
}
