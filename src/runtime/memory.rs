//! Size-classed memory pool.
//!
//! Blocks are grouped into fixed size classes so that short-lived
//! allocations of similar size reuse the same memory instead of going
//! back to the system allocator every time.
//!
//! ## Size Classes
//!
//! - 32..=1024 in 32-byte steps
//! - 1152..=4096 in 128-byte steps
//! - one class matching the send buffer chunk capacity
//!
//! Requests larger than every class are served directly and freed on
//! release.

use crate::runtime::send_buffer::SEND_BUFFER_CHUNK_SIZE;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tracing::trace;

/// An owned block handed out by the [`MemoryPoolManager`].
///
/// The block remembers the size class it came from, so releasing it
/// never needs a header in front of the user data. Only
/// [`MemoryPoolManager::release`] returns a block to its class; a dropped
/// block is freed.
#[derive(Debug)]
pub struct PooledBlock {
    data: Box<[u8]>,
    /// Bytes requested by the caller (`<= data.len()`).
    len: usize,
    /// Size class the block belongs to, `None` for direct allocations.
    class: Option<usize>,
}

impl PooledBlock {
    /// Requested length of the block.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check if the block has zero requested length.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Size class this block belongs to.
    pub fn class_size(&self) -> Option<usize> {
        self.class
    }

    /// Full usable capacity of the block.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Requested region, read-only.
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// Requested region, writable.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data[..self.len]
    }
}

/// Free list for a single size class.
///
/// Blocks are kept on a LIFO stack for cache locality.
struct MemoryPool {
    class_size: usize,
    free_list: Mutex<Vec<Box<[u8]>>>,
    /// Total blocks ever created for this class.
    created: AtomicUsize,
}

impl MemoryPool {
    fn new(class_size: usize) -> Self {
        Self {
            class_size,
            free_list: Mutex::new(Vec::new()),
            created: AtomicUsize::new(0),
        }
    }

    fn pop(&self) -> Box<[u8]> {
        let reused = self
            .free_list
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop();

        match reused {
            Some(block) => block,
            None => {
                self.created.fetch_add(1, Ordering::Relaxed);
                vec![0u8; self.class_size].into_boxed_slice()
            }
        }
    }

    fn push(&self, block: Box<[u8]>) {
        debug_assert_eq!(block.len(), self.class_size, "block returned to wrong class");
        self.free_list
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(block);
    }

    fn available(&self) -> usize {
        self.free_list
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

/// Per-class statistics snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassStats {
    pub class_size: usize,
    /// Blocks created over the lifetime of the class (peak block count).
    pub blocks_created: usize,
    /// Blocks currently sitting in the free list.
    pub available: usize,
}

/// Size-classed pool manager.
///
/// Each class is locked independently, so contention only happens
/// between allocations that land in the same class.
pub struct MemoryPoolManager {
    pools: BTreeMap<usize, MemoryPool>,
}

impl MemoryPoolManager {
    /// Create a manager with the standard class ladder.
    pub fn new() -> Self {
        let mut pools = BTreeMap::new();

        for size in (32..=1024).step_by(32) {
            pools.insert(size, MemoryPool::new(size));
        }
        for size in (1024 + 128..=4096).step_by(128) {
            pools.insert(size, MemoryPool::new(size));
        }
        pools.insert(SEND_BUFFER_CHUNK_SIZE, MemoryPool::new(SEND_BUFFER_CHUNK_SIZE));

        Self { pools }
    }

    /// Allocate a block of at least `size` bytes.
    ///
    /// Picks the smallest class that fits, or allocates directly when
    /// `size` exceeds every class.
    pub fn allocate(&self, size: usize) -> PooledBlock {
        match self.pools.range(size..).next() {
            Some((&class_size, pool)) => {
                let data = pool.pop();
                trace!(size, class_size, "Allocated pooled block");
                PooledBlock {
                    data,
                    len: size,
                    class: Some(class_size),
                }
            }
            None => {
                trace!(size, "Allocated unpooled block");
                PooledBlock {
                    data: vec![0u8; size].into_boxed_slice(),
                    len: size,
                    class: None,
                }
            }
        }
    }

    /// Return a block to its class, or free it if it has none.
    pub fn release(&self, block: PooledBlock) {
        let Some(class_size) = block.class else {
            return;
        };
        match self.pools.get(&class_size) {
            Some(pool) => pool.push(block.data),
            None => debug_assert!(false, "unknown size class {class_size}"),
        }
    }

    /// Class a request of `size` bytes would be served from.
    pub fn class_for(&self, size: usize) -> Option<usize> {
        self.pools.range(size..).next().map(|(&class_size, _)| class_size)
    }

    /// Number of size classes.
    pub fn class_count(&self) -> usize {
        self.pools.len()
    }

    /// Statistics for the class serving `size`.
    pub fn stats_for(&self, size: usize) -> Option<ClassStats> {
        self.pools.range(size..).next().map(|(_, pool)| ClassStats {
            class_size: pool.class_size,
            blocks_created: pool.created.load(Ordering::Relaxed),
            available: pool.available(),
        })
    }
}

impl Default for MemoryPoolManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_class_ladder() {
        let manager = MemoryPoolManager::new();

        // 32 small + 24 medium + chunk class
        assert_eq!(manager.class_count(), 32 + 24 + 1);

        assert_eq!(manager.class_for(1), Some(32));
        assert_eq!(manager.class_for(32), Some(32));
        assert_eq!(manager.class_for(33), Some(64));
        assert_eq!(manager.class_for(1024), Some(1024));
        assert_eq!(manager.class_for(1025), Some(1152));
        assert_eq!(manager.class_for(4096), Some(4096));
        assert_eq!(manager.class_for(4097), Some(SEND_BUFFER_CHUNK_SIZE));
        assert_eq!(manager.class_for(SEND_BUFFER_CHUNK_SIZE + 1), None);
    }

    #[test]
    fn test_allocate_rounds_up() {
        let manager = MemoryPoolManager::new();

        let mut block = manager.allocate(100);
        assert_eq!(block.len(), 100);
        assert_eq!(block.capacity(), 128);
        assert_eq!(block.class_size(), Some(128));

        block.as_mut_slice()[0] = 7;
        assert_eq!(block.as_slice()[0], 7);

        manager.release(block);
    }

    #[test]
    fn test_release_then_allocate_reuses_block() {
        let manager = MemoryPoolManager::new();

        let block = manager.allocate(500);
        let stats = manager.stats_for(500).unwrap();
        assert_eq!(stats.blocks_created, 1);
        assert_eq!(stats.available, 0);

        manager.release(block);
        assert_eq!(manager.stats_for(500).unwrap().available, 1);

        // Same class again: no new block
        let block = manager.allocate(500);
        let stats = manager.stats_for(500).unwrap();
        assert_eq!(stats.blocks_created, 1);
        assert_eq!(stats.available, 0);

        manager.release(block);
    }

    #[test]
    fn test_dropped_block_is_not_pooled() {
        let manager = MemoryPoolManager::new();

        drop(manager.allocate(700));
        let stats = manager.stats_for(700).unwrap();
        assert_eq!(stats.blocks_created, 1);
        assert_eq!(stats.available, 0);

        // The next allocation in the class creates a fresh block
        let block = manager.allocate(700);
        assert_eq!(manager.stats_for(700).unwrap().blocks_created, 2);
        manager.release(block);
        assert_eq!(manager.stats_for(700).unwrap().available, 1);
    }

    #[test]
    fn test_oversized_allocation_is_direct() {
        let manager = MemoryPoolManager::new();

        let block = manager.allocate(64 * 1024);
        assert_eq!(block.len(), 64 * 1024);
        assert_eq!(block.class_size(), None);

        // Freed directly, no class affected
        manager.release(block);
        assert!(manager.stats_for(64 * 1024).is_none());
    }

    #[test]
    fn test_concurrent_same_class() {
        use std::sync::Arc;
        use std::thread;

        let manager = Arc::new(MemoryPoolManager::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let manager = Arc::clone(&manager);
                thread::spawn(move || {
                    for _ in 0..100 {
                        let block = manager.allocate(256);
                        assert_eq!(block.capacity(), 256);
                        manager.release(block);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let stats = manager.stats_for(256).unwrap();
        assert!(stats.blocks_created <= 4);
        assert_eq!(stats.available, stats.blocks_created);
    }
}
