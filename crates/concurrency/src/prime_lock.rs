//! The prime lock: a component-wide reader/writer lock that serializes
//! checkpoint/consolidation reconfiguration against in-flight applies
//! (spec.md §4.6, §5).
//!
//! Reads and ordinary writes (applies) take the prime lock in shared mode —
//! many may proceed concurrently. Starting a checkpoint takes it exclusively,
//! so a checkpoint always observes a consistent snapshot of the store's
//! components. Every acquisition is bounded by a caller-supplied timeout,
//! surfaced as [`tstore_core::error::Error::Timeout`] on expiry per spec.md
//! §5's "lock acquisitions take a timeout" requirement.

use std::time::Duration;

use tokio::sync::RwLock;

use tstore_core::error::{Error, Result};

/// A read guard on the prime lock. Dropping it releases the shared hold.
pub type PrimeReadGuard<'a> = tokio::sync::RwLockReadGuard<'a, ()>;

/// A write guard on the prime lock. Dropping it releases the exclusive
/// hold.
pub type PrimeWriteGuard<'a> = tokio::sync::RwLockWriteGuard<'a, ()>;

/// The store-wide reconfiguration lock (spec.md §4.6, §5).
#[derive(Default)]
pub struct PrimeLock {
    inner: RwLock<()>,
}

impl PrimeLock {
    /// A freshly unlocked prime lock.
    pub fn new() -> Self {
        PrimeLock { inner: RwLock::new(()) }
    }

    /// Acquire shared access (an apply or a read), failing with
    /// [`Error::Timeout`] if `timeout` elapses first.
    pub async fn acquire_read(&self, timeout: Duration) -> Result<PrimeReadGuard<'_>> {
        tokio::time::timeout(timeout, self.inner.read())
            .await
            .map_err(|_| Error::Timeout(timeout))
    }

    /// Acquire exclusive access (starting a checkpoint), failing with
    /// [`Error::Timeout`] if `timeout` elapses first.
    pub async fn acquire_write(&self, timeout: Duration) -> Result<PrimeWriteGuard<'_>> {
        tokio::time::timeout(timeout, self.inner.write())
            .await
            .map_err(|_| Error::Timeout(timeout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn shared_reads_do_not_block_each_other() {
        let lock = PrimeLock::new();
        let g1 = lock.acquire_read(Duration::from_millis(100)).await.unwrap();
        let g2 = lock.acquire_read(Duration::from_millis(100)).await.unwrap();
        drop(g1);
        drop(g2);
    }

    #[tokio::test]
    async fn exclusive_write_times_out_while_a_read_is_held() {
        let lock = PrimeLock::new();
        let _read = lock.acquire_read(Duration::from_millis(50)).await.unwrap();
        let result = lock.acquire_write(Duration::from_millis(20)).await;
        assert!(matches!(result, Err(Error::Timeout(_))));
    }

    #[tokio::test]
    async fn write_succeeds_once_reads_release() {
        let lock = PrimeLock::new();
        {
            let _read = lock.acquire_read(Duration::from_millis(50)).await.unwrap();
        }
        lock.acquire_write(Duration::from_millis(50)).await.unwrap();
    }
}
