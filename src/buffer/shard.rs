use crate::block::BlockId;
use crossbeam_utils::CachePadded;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Default number of lock shards. Large enough that unrelated blocks
/// rarely alias, small enough to keep the lock table cache-friendly.
pub const DEFAULT_LOCK_SHARDS: usize = 256;

/// Maps each block id onto one of a fixed number of read/write locks.
///
/// Contract with the buffer pool manager:
/// 1. a block may be evicted only while the evictor holds its shard's
///    write lock;
/// 2. a resident block is safe from eviction while its reference count
///    is above zero or any lock is held on its shard;
/// 3. the evictor skips candidates whose shard the calling thread
///    already holds, since re-locking the same shard would self-deadlock.
///
/// Two ids may alias to the same shard. That only reduces concurrency;
/// eviction re-verifies the candidate under the directory lock.
pub struct ShardedLockManager {
    shards: Vec<CachePadded<RwLock<()>>>,
}

impl ShardedLockManager {
    #[inline]
    pub fn new(num_shards: usize) -> Self {
        assert!(num_shards >= 1, "lock manager needs at least one shard");
        let shards = (0..num_shards)
            .map(|_| CachePadded::new(RwLock::new(())))
            .collect();
        ShardedLockManager { shards }
    }

    #[inline]
    pub fn num_shards(&self) -> usize {
        self.shards.len()
    }

    /// Deterministic shard index for a block id.
    #[inline]
    pub fn shard_of(&self, block: BlockId) -> usize {
        // Fibonacci hashing spreads both the domain (high) and counter
        // (low) bits across shards.
        let mixed = block.raw().wrapping_mul(0x9E37_79B9_7F4A_7C15);
        ((mixed >> 32) as usize) % self.shards.len()
    }

    /// Lock the block's shard in shared mode.
    #[inline]
    pub fn lock_shared(&self, block: BlockId) -> RwLockReadGuard<'_, ()> {
        self.shards[self.shard_of(block)].read()
    }

    /// Lock the block's shard in exclusive mode.
    #[inline]
    pub fn lock_exclusive(&self, block: BlockId) -> RwLockWriteGuard<'_, ()> {
        self.shards[self.shard_of(block)].write()
    }

    /// Try to lock the block's shard in exclusive mode without blocking.
    /// Returns `None` if another thread holds any lock on the shard,
    /// which the eviction sweep treats as "skip this candidate".
    #[inline]
    pub fn try_lock_exclusive(&self, block: BlockId) -> Option<RwLockWriteGuard<'_, ()>> {
        self.shards[self.shard_of(block)].try_write()
    }
}
