use crate::block::BlockId;
use crate::policy::EvictionPolicy;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

/// Default correlated reference period: references to the same block
/// closer together than this count as one logical access.
pub const DEFAULT_CORRELATED_REFERENCE_PERIOD: Duration = Duration::from_millis(200);

/// Build an LRU-K policy for `k` in 1..=3.
///
/// The history depth is a compile-time array length, so runtime
/// selection dispatches over the supported instantiations.
pub fn new_lru_k(k: usize, correlated_reference_period: Duration) -> Box<dyn EvictionPolicy> {
    match k {
        1 => Box::new(LruKPolicy::<1>::new(correlated_reference_period)),
        2 => Box::new(LruKPolicy::<2>::new(correlated_reference_period)),
        3 => Box::new(LruKPolicy::<3>::new(correlated_reference_period)),
        _ => panic!("LRU-K only supports k = 1, 2, or 3"),
    }
}

/// Per-block reference history.
///
/// `ref_list[0]` is the most recent non-correlated reference,
/// `ref_list[K - 1]` the oldest retained one. `None` stands for "never
/// referenced that far back" and sorts as infinitely old. The history
/// survives eviction so a reloaded block keeps its access pattern;
/// only deletion erases it.
struct BlockInfo<const K: usize> {
    ref_list: [Option<Instant>; K],
    /// Last reference regardless of whether it fell inside the
    /// correlated reference period of the one before it.
    last_reference: Option<Instant>,
    ref_count: u32,
    in_memory: bool,
}

impl<const K: usize> BlockInfo<K> {
    #[inline]
    fn new() -> Self {
        BlockInfo {
            ref_list: [None; K],
            last_reference: None,
            ref_count: 0,
            in_memory: false,
        }
    }

    /// Record a reference at `now`, mark the block in memory and bump
    /// the reference count. Returns true if the count was zero, in
    /// which case the caller drops the block from the nonreferenced set.
    fn record_reference(&mut self, now: Instant, correlated_reference_period: Duration) -> bool {
        if self.in_memory {
            // Only a reference past the correlated period starts a new
            // logical access; anything closer collapses into the last one.
            if self.since_last_reference(now) > correlated_reference_period {
                self.push_reference_time(now, true);
            }
        } else {
            // Just brought in, possibly after an eviction.
            self.push_reference_time(now, false);
            self.in_memory = true;
        }
        self.last_reference = Some(now);
        let was_zero = self.ref_count == 0;
        self.ref_count += 1;
        was_zero
    }

    #[inline]
    fn since_last_reference(&self, now: Instant) -> Duration {
        match self.last_reference {
            Some(last) => now.saturating_duration_since(last),
            None => Duration::MAX,
        }
    }

    /// Shift the history back one place and record `now` at the front.
    /// When the block stayed in memory, the correlated span between the
    /// newest retained reference and the last raw one is credited to the
    /// older entries so a long burst of correlated accesses does not
    /// make the block look cold.
    fn push_reference_time(&mut self, now: Instant, currently_in_memory: bool) {
        let correlated_span = if currently_in_memory {
            match (self.last_reference, self.ref_list[0]) {
                (Some(last), Some(newest)) => last.saturating_duration_since(newest),
                _ => Duration::ZERO,
            }
        } else {
            Duration::ZERO
        };
        for i in (1..K).rev() {
            self.ref_list[i] = self.ref_list[i - 1].map(|t| t + correlated_span);
        }
        self.ref_list[0] = Some(now);
    }

    /// Whether the block's last reference is outside the correlated
    /// reference period as of `now`. Never-referenced blocks qualify.
    #[inline]
    fn past_correlated_period(&self, now: Instant, period: Duration) -> bool {
        self.since_last_reference(now) > period
    }

    /// Victim ordering: a block past its correlated reference period
    /// precedes one inside it; among equals, the older Kth-most-recent
    /// reference wins, with `None` oldest of all.
    fn precedes(&self, other: &Self, now: Instant, period: Duration) -> bool {
        let lhs_past = self.past_correlated_period(now, period);
        let rhs_past = other.past_correlated_period(now, period);
        if lhs_past == rhs_past {
            self.ref_list[K - 1] < other.ref_list[K - 1]
        } else {
            lhs_past
        }
    }
}

struct LruKState<const K: usize> {
    blocks: HashMap<BlockId, BlockInfo<K>>,
    nonreferenced: HashSet<BlockId>,
}

/// LRU-K eviction: the victim is the unreferenced resident block whose
/// Kth-most-recent access lies furthest in the past, with references
/// inside the correlated reference period collapsed into one access
/// and recently touched blocks protected outright.
pub struct LruKPolicy<const K: usize> {
    state: Mutex<LruKState<K>>,
    correlated_reference_period: Duration,
}

impl<const K: usize> LruKPolicy<K> {
    #[inline]
    pub fn new(correlated_reference_period: Duration) -> Self {
        LruKPolicy {
            state: Mutex::new(LruKState {
                blocks: HashMap::new(),
                nonreferenced: HashSet::new(),
            }),
            correlated_reference_period,
        }
    }
}

impl<const K: usize> EvictionPolicy for LruKPolicy<K> {
    fn choose_block_to_evict(&self) -> Option<BlockId> {
        let now = Instant::now();
        let mut g = self.state.lock();
        let mut victim: Option<BlockId> = None;
        for &candidate in &g.nonreferenced {
            let info = &g.blocks[&candidate];
            if !info.in_memory {
                continue;
            }
            let better = match victim {
                None => true,
                Some(best) => {
                    info.precedes(&g.blocks[&best], now, self.correlated_reference_period)
                }
            };
            if better {
                victim = Some(candidate);
            }
        }
        let block = victim?;
        // The caller is assumed to evict it; history stays behind for a
        // future reload.
        let info = g.blocks.get_mut(&block).unwrap();
        debug_assert_eq!(info.ref_count, 0);
        info.in_memory = false;
        g.nonreferenced.remove(&block);
        Some(block)
    }

    fn block_created(&self, block: BlockId) {
        let mut g = self.state.lock();
        g.blocks.entry(block).or_insert_with(BlockInfo::new).in_memory = true;
        g.nonreferenced.insert(block);
    }

    fn block_evicted(&self, block: BlockId) {
        let mut g = self.state.lock();
        if let Some(info) = g.blocks.get_mut(&block) {
            debug_assert_eq!(info.ref_count, 0);
            info.in_memory = false;
        }
        g.nonreferenced.remove(&block);
    }

    fn block_referenced(&self, block: BlockId) {
        let now = Instant::now();
        let mut g = self.state.lock();
        let info = g.blocks.entry(block).or_insert_with(BlockInfo::new);
        if info.record_reference(now, self.correlated_reference_period) {
            g.nonreferenced.remove(&block);
        }
    }

    fn block_unreferenced(&self, block: BlockId) {
        let mut g = self.state.lock();
        let info = g
            .blocks
            .get_mut(&block)
            .unwrap_or_else(|| panic!("unreference of unknown block {}", block));
        assert!(
            info.ref_count > 0,
            "unreference of unreferenced block {}",
            block
        );
        info.ref_count -= 1;
        if info.ref_count == 0 {
            g.nonreferenced.insert(block);
        }
    }

    fn block_deleted(&self, block: BlockId) {
        let mut g = self.state.lock();
        g.blocks.remove(&block);
        g.nonreferenced.remove(&block);
    }

    fn ref_count(&self, block: BlockId) -> u32 {
        let g = self.state.lock();
        g.blocks.get(&block).map(|i| i.ref_count).unwrap_or(0)
    }
}
