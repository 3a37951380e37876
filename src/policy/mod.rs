mod lru_k;

pub use lru_k::{new_lru_k, LruKPolicy, DEFAULT_CORRELATED_REFERENCE_PERIOD};

use crate::block::BlockId;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};

/// Strategy for selecting blocks to evict from the buffer pool.
///
/// Here and in all implementations, "block" covers both blocks and
/// blobs; the policy does not distinguish them. Lifecycle is driven
/// entirely by the buffer pool manager's notifications; the policy
/// never mutates the directory on its own.
pub trait EvictionPolicy: Send + Sync {
    /// Choose a block to evict. The policy must only return a block its
    /// own bookkeeping shows as unreferenced, and it assumes the block
    /// it returns is eventually evicted. Returns `None` if it knows of
    /// no admissible block.
    fn choose_block_to_evict(&self) -> Option<BlockId>;

    /// The block has just become resident (created or loaded) with a
    /// reference count of zero. Called before any `block_referenced`,
    /// so a block sitting in the pool unreferenced since creation is
    /// still visible to the policy and eligible for eviction.
    fn block_created(&self, block: BlockId);

    /// The block has been evicted, possibly without having been
    /// returned by `choose_block_to_evict`.
    fn block_evicted(&self, block: BlockId);

    /// The block's reference count has been incremented.
    fn block_referenced(&self, block: BlockId);

    /// The block's reference count has been decremented.
    fn block_unreferenced(&self, block: BlockId);

    /// The block is permanently gone. Policies that keep history past
    /// eviction drop it here. `block_evicted` is still delivered first
    /// when a resident block is deleted.
    fn block_deleted(&self, _block: BlockId) {}

    /// The policy's view of the block's reference count.
    fn ref_count(&self, block: BlockId) -> u32;
}

#[derive(Default)]
struct EvictAnyState {
    ref_counts: HashMap<BlockId, u32>,
    // Tracked separately so candidate selection need not scan the map.
    nonreferenced: HashSet<BlockId>,
}

/// Evicts the first unreferenced block it finds.
///
/// A single mutex for simplicity: this policy exists as a minimal
/// substitute for testing, performance is not a goal.
pub struct EvictAnyPolicy {
    state: Mutex<EvictAnyState>,
}

impl EvictAnyPolicy {
    #[inline]
    pub fn new() -> Self {
        EvictAnyPolicy {
            state: Mutex::new(EvictAnyState::default()),
        }
    }
}

impl Default for EvictAnyPolicy {
    #[inline]
    fn default() -> Self {
        EvictAnyPolicy::new()
    }
}

impl EvictionPolicy for EvictAnyPolicy {
    fn choose_block_to_evict(&self) -> Option<BlockId> {
        let mut g = self.state.lock();
        let block = *g.nonreferenced.iter().next()?;
        g.ref_counts.remove(&block);
        g.nonreferenced.remove(&block);
        Some(block)
    }

    fn block_created(&self, block: BlockId) {
        let mut g = self.state.lock();
        g.ref_counts.insert(block, 0);
        g.nonreferenced.insert(block);
    }

    fn block_evicted(&self, block: BlockId) {
        let mut g = self.state.lock();
        g.ref_counts.remove(&block);
        g.nonreferenced.remove(&block);
    }

    fn block_referenced(&self, block: BlockId) {
        let mut g = self.state.lock();
        let count = g.ref_counts.entry(block).or_insert(0);
        *count += 1;
        if *count == 1 {
            g.nonreferenced.remove(&block);
        }
    }

    fn block_unreferenced(&self, block: BlockId) {
        let mut g = self.state.lock();
        let count = g
            .ref_counts
            .get_mut(&block)
            .unwrap_or_else(|| panic!("unreference of unknown block {}", block));
        assert!(*count > 0, "unreference of unreferenced block {}", block);
        *count -= 1;
        if *count == 0 {
            g.nonreferenced.insert(block);
        }
    }

    fn ref_count(&self, block: BlockId) -> u32 {
        let g = self.state.lock();
        g.ref_counts.get(&block).copied().unwrap_or(0)
    }
}
