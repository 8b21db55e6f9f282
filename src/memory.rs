//! Logical memory accounting for buffered pages.
//!
//! A [`MemoryPool`] only records bytes explicitly reserved by the caller; it
//! does not reflect process RSS. Pools form a tree: a reservation is charged
//! to the pool and every ancestor, and fails if any of them would go over its
//! hard capacity. Capacity can be lowered at runtime to model a pool that
//! shrinks under pressure; later reservations then fail with
//! [`ExchangeError::AllocationFailed`]. That failure is fatal to the caller
//! and is never retried here.

use crate::error::{ExchangeError, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

const UNLIMITED: u64 = u64::MAX;

#[derive(Debug)]
pub struct MemoryPool {
    name: String,
    parent: Option<Arc<MemoryPool>>,
    capacity: AtomicU64,
    current: AtomicU64,
    peak: AtomicU64,
}

impl MemoryPool {
    /// Create a root pool with no capacity limit.
    pub fn new_root(name: impl Into<String>) -> Arc<Self> {
        Self::with_capacity(name, None, UNLIMITED)
    }

    /// Create a root pool with a hard capacity.
    pub fn new_root_with_capacity(name: impl Into<String>, capacity: u64) -> Arc<Self> {
        Self::with_capacity(name, None, capacity)
    }

    /// Create a child of `parent`. Reservations are charged to both.
    pub fn new_child(name: impl Into<String>, parent: &Arc<MemoryPool>) -> Arc<Self> {
        Self::with_capacity(name, Some(Arc::clone(parent)), UNLIMITED)
    }

    fn with_capacity(name: impl Into<String>, parent: Option<Arc<Self>>, capacity: u64) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            parent,
            capacity: AtomicU64::new(capacity),
            current: AtomicU64::new(0),
            peak: AtomicU64::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn current(&self) -> u64 {
        self.current.load(Ordering::Acquire)
    }

    pub fn peak(&self) -> u64 {
        self.peak.load(Ordering::Acquire)
    }

    /// Hard capacity, or `None` when unlimited.
    pub fn capacity(&self) -> Option<u64> {
        match self.capacity.load(Ordering::Acquire) {
            UNLIMITED => None,
            c => Some(c),
        }
    }

    /// Change the hard capacity. Existing reservations are kept even if they
    /// now exceed it; only new reservations are refused.
    pub fn set_capacity(&self, capacity: Option<u64>) {
        self.capacity
            .store(capacity.unwrap_or(UNLIMITED), Ordering::Release);
    }

    /// Reserve `bytes` against this pool and all its ancestors.
    pub fn reserve(self: &Arc<Self>, bytes: u64) -> Result<Reservation> {
        self.try_charge(bytes)?;
        Ok(Reservation {
            bytes,
            pool: Arc::clone(self),
        })
    }

    fn try_charge(&self, bytes: u64) -> Result<()> {
        if bytes == 0 {
            return Ok(());
        }
        let mut charged: Vec<&MemoryPool> = Vec::new();
        let mut pool: Option<&MemoryPool> = Some(self);
        while let Some(current) = pool {
            let before = current.current.fetch_add(bytes, Ordering::AcqRel);
            let after = before.saturating_add(bytes);
            let capacity = current.capacity.load(Ordering::Acquire);
            if after > capacity {
                current.current.fetch_sub(bytes, Ordering::AcqRel);
                for p in charged {
                    p.current.fetch_sub(bytes, Ordering::AcqRel);
                }
                return Err(ExchangeError::AllocationFailed {
                    pool: current.name.clone(),
                    requested: bytes,
                    used: before,
                    capacity,
                });
            }
            current.update_peak(after);
            charged.push(current);
            pool = current.parent.as_deref();
        }
        Ok(())
    }

    fn release(&self, bytes: u64) {
        if bytes == 0 {
            return;
        }
        let mut pool: Option<&MemoryPool> = Some(self);
        while let Some(current) = pool {
            current.current.fetch_sub(bytes, Ordering::AcqRel);
            pool = current.parent.as_deref();
        }
    }

    fn update_peak(&self, value: u64) {
        let mut prev = self.peak.load(Ordering::Relaxed);
        while value > prev {
            match self
                .peak
                .compare_exchange(prev, value, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(actual) => prev = actual,
            }
        }
    }
}

/// Bytes held against a [`MemoryPool`], released on drop.
#[derive(Debug)]
pub struct Reservation {
    bytes: u64,
    pool: Arc<MemoryPool>,
}

impl Reservation {
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn pool(&self) -> &Arc<MemoryPool> {
        &self.pool
    }

    /// Move the reservation to another pool. The new pool is charged before
    /// the old one is released, so on failure nothing changes.
    pub fn transfer_to(&mut self, pool: &Arc<MemoryPool>) -> Result<()> {
        if Arc::ptr_eq(&self.pool, pool) {
            return Ok(());
        }
        pool.try_charge(self.bytes)?;
        self.pool.release(self.bytes);
        self.pool = Arc::clone(pool);
        Ok(())
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.pool.release(self.bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_and_release() {
        let root = MemoryPool::new_root("root");
        let child = MemoryPool::new_child("child", &root);

        let r1 = child.reserve(100).unwrap();
        let r2 = child.reserve(50).unwrap();
        assert_eq!(child.current(), 150);
        assert_eq!(root.current(), 150);

        drop(r1);
        assert_eq!(child.current(), 50);
        assert_eq!(root.current(), 50);
        assert_eq!(root.peak(), 150);

        drop(r2);
        assert_eq!(root.current(), 0);
    }

    #[test]
    fn test_capacity_enforced_on_ancestors() {
        let root = MemoryPool::new_root_with_capacity("root", 100);
        let child = MemoryPool::new_child("child", &root);

        let _held = child.reserve(80).unwrap();
        let err = child.reserve(30).unwrap_err();
        match err {
            ExchangeError::AllocationFailed {
                pool,
                requested,
                used,
                capacity,
            } => {
                assert_eq!(pool, "root");
                assert_eq!(requested, 30);
                assert_eq!(used, 80);
                assert_eq!(capacity, 100);
            }
            other => panic!("unexpected error: {other}"),
        }
        // The failed attempt left no residue on the child.
        assert_eq!(child.current(), 80);
        assert_eq!(root.current(), 80);
    }

    #[test]
    fn test_shrink_refuses_new_reservations() {
        let pool = MemoryPool::new_root("pool");
        let held = pool.reserve(500).unwrap();

        pool.set_capacity(Some(400));
        assert_eq!(pool.capacity(), Some(400));
        assert!(pool.reserve(1).is_err());

        drop(held);
        assert!(pool.reserve(400).is_ok());
    }

    #[test]
    fn test_transfer() {
        let a = MemoryPool::new_root("a");
        let b = MemoryPool::new_root_with_capacity("b", 10);

        let mut r = a.reserve(8).unwrap();
        r.transfer_to(&b).unwrap();
        assert_eq!(a.current(), 0);
        assert_eq!(b.current(), 8);

        let mut other = a.reserve(5).unwrap();
        assert!(other.transfer_to(&b).is_err());
        assert_eq!(a.current(), 5);
        assert_eq!(b.current(), 8);
    }
}
