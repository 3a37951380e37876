pub mod directory;
pub mod handle;
pub mod shard;
pub mod slots;

pub use directory::{BlockDirectory, BlockHandle};
pub use handle::{BlockRef, BlockRefMut};
pub use shard::{ShardedLockManager, DEFAULT_LOCK_SHARDS};
pub use slots::{
    slots_needed_for_bytes, PlacementHint, SlotAllocator, SlotMemory, SLOT_SIZE_BYTES,
};

use crate::block::{BlockId, BlockLayout, RelationSchema};
use crate::config::BufferPoolConfig;
use crate::error::{Error, Result};
use crate::file::{FileManager, LocalFileManager};
use crate::location::BlockLocator;
use crate::policy::{new_lru_k, EvictionPolicy, DEFAULT_CORRELATED_REFERENCE_PERIOD};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// The buffer pool: a bounded cache of disk-backed blocks and blobs.
///
/// The pool hands out scoped references over resident blocks, loads
/// missing blocks from its file manager (or a cluster peer through the
/// optional locator), and when its slot budget is exceeded evicts
/// unreferenced residents chosen by the eviction policy, saving dirty
/// ones first. The budget is soft: if every resident block is pinned,
/// allocation proceeds over budget rather than failing.
///
/// All operations take `&self` and may be called from any number of
/// threads. Per-block races between load and eviction are ordered by
/// the sharded lock manager; the directory lock is never held across
/// I/O.
pub struct BufferPoolManager {
    block_domain: u16,
    allocator: SlotAllocator,
    policy: Box<dyn EvictionPolicy>,
    file_manager: Box<dyn FileManager>,
    locator: Option<Box<dyn BlockLocator>>,
    directory: BlockDirectory,
    lock_manager: ShardedLockManager,
    // Raw value of the most recently issued block id of our domain.
    block_index: AtomicU64,
}

impl BufferPoolManager {
    /// Open a pool over a local storage directory with the default
    /// eviction policy, LRU-2 with the standard correlated reference
    /// period.
    pub fn new(config: BufferPoolConfig) -> Result<Self> {
        Self::with_policy(config, new_lru_k(2, DEFAULT_CORRELATED_REFERENCE_PERIOD))
    }

    /// Open a pool over a local storage directory with the given policy.
    pub fn with_policy(config: BufferPoolConfig, policy: Box<dyn EvictionPolicy>) -> Result<Self> {
        let file_manager = Box::new(LocalFileManager::new(&config.storage_dir)?);
        Self::with_parts(config, policy, file_manager, None)
    }

    /// Open a pool from parts: any policy, file manager and optional
    /// cluster locator.
    pub fn with_parts(
        config: BufferPoolConfig,
        policy: Box<dyn EvictionPolicy>,
        file_manager: Box<dyn FileManager>,
        locator: Option<Box<dyn BlockLocator>>,
    ) -> Result<Self> {
        config.validate()?;
        let pool_slots = config.resolved_pool_slots();
        log::info!(
            "buffer pool opening with {} slots of {} bytes, domain {}",
            pool_slots,
            SLOT_SIZE_BYTES,
            config.block_domain
        );
        // Seed the id counter past everything already on disk so a
        // restart never reissues an id.
        let max_used = file_manager.max_used_block_counter(config.block_domain);
        let block_index = AtomicU64::new(BlockId::new(config.block_domain, max_used).raw());
        if let Some(locator) = &locator {
            locator.register_domain(config.block_domain);
        }
        Ok(BufferPoolManager {
            block_domain: config.block_domain,
            allocator: SlotAllocator::new(pool_slots),
            policy,
            file_manager,
            locator,
            directory: BlockDirectory::new(),
            lock_manager: ShardedLockManager::new(config.lock_shards),
            block_index,
        })
    }

    /// The domain of ids created by this pool.
    #[inline]
    pub fn block_domain(&self) -> u16 {
        self.block_domain
    }

    #[inline]
    fn allocate_block_id(&self) -> BlockId {
        BlockId::from_raw(self.block_index.fetch_add(1, Ordering::AcqRel) + 1)
    }

    /// Create a new block of the given layout. The block starts
    /// resident, unreferenced and dirty; no I/O happens until it is
    /// saved or evicted.
    pub fn create_block(
        &self,
        relation: &RelationSchema,
        layout: &BlockLayout,
        hint: PlacementHint,
    ) -> Result<BlockId> {
        self.make_room_for(layout.num_slots, None)?;
        let memory = self.allocator.allocate(layout.num_slots, hint)?;
        let block = self.allocate_block_id();
        let handle = Arc::new(BlockHandle::new_block(block, *relation, memory, true));
        self.finish_insert(block, handle);
        Ok(block)
    }

    /// Create a new blob of `num_slots` slots. Same lifecycle as
    /// [`create_block`](Self::create_block).
    pub fn create_blob(&self, num_slots: usize, hint: PlacementHint) -> Result<BlockId> {
        assert!(num_slots > 0, "blob must occupy at least one slot");
        self.make_room_for(num_slots, None)?;
        let memory = self.allocator.allocate(num_slots, hint)?;
        let block = self.allocate_block_id();
        let handle = Arc::new(BlockHandle::new_blob(block, memory, true));
        self.finish_insert(block, handle);
        Ok(block)
    }

    fn finish_insert(&self, block: BlockId, handle: Arc<BlockHandle>) {
        self.directory.insert(block, handle);
        self.policy.block_created(block);
        if let Some(locator) = &self.locator {
            locator.block_added(block);
        }
    }

    /// A shared reference to a resident or loadable block.
    /// Panics if the identity is resident as a blob.
    pub fn get_block(
        &self,
        block: BlockId,
        relation: &RelationSchema,
        hint: PlacementHint,
    ) -> Result<BlockRef<'_>> {
        Ok(self.acquire(block, Some(*relation), hint)?.into())
    }

    /// A mutable reference to a resident or loadable block.
    pub fn get_block_mut(
        &self,
        block: BlockId,
        relation: &RelationSchema,
        hint: PlacementHint,
    ) -> Result<BlockRefMut<'_>> {
        self.acquire(block, Some(*relation), hint)
    }

    /// A shared reference to a resident or loadable blob.
    /// Panics if the identity is resident as a block.
    pub fn get_blob(&self, block: BlockId, hint: PlacementHint) -> Result<BlockRef<'_>> {
        Ok(self.acquire(block, None, hint)?.into())
    }

    /// A mutable reference to a resident or loadable blob.
    pub fn get_blob_mut(&self, block: BlockId, hint: PlacementHint) -> Result<BlockRefMut<'_>> {
        self.acquire(block, None, hint)
    }

    /// Two-phase residency check. The fast path holds the shard lock
    /// shared; a miss re-enters with the shard held exclusive so that
    /// exactly one thread loads a cold identity, everyone else finding
    /// the handle it inserted. The returned reference is pinned while
    /// the shard lock is still held, so no eviction can slip between
    /// lookup and pin.
    fn acquire(
        &self,
        block: BlockId,
        relation: Option<RelationSchema>,
        hint: PlacementHint,
    ) -> Result<BlockRefMut<'_>> {
        let expect_blob = relation.is_none();
        {
            let _shard = self.lock_manager.lock_shared(block);
            if let Some(handle) = self.directory.find(block) {
                verify_kind(&handle, expect_blob);
                return Ok(BlockRefMut::new(handle, self.policy.as_ref()));
            }
        }
        // No shared-to-exclusive upgrade: release, relock, re-check.
        let locked_shard = self.lock_manager.shard_of(block);
        let _shard = self.lock_manager.lock_exclusive(block);
        if let Some(handle) = self.directory.find(block) {
            verify_kind(&handle, expect_blob);
            return Ok(BlockRefMut::new(handle, self.policy.as_ref()));
        }
        // Sole loader for this identity.
        let memory = self.load_image(block, hint, locked_shard)?;
        let handle = Arc::new(match relation {
            Some(relation) => BlockHandle::new_block(block, relation, memory, false),
            None => BlockHandle::new_blob(block, memory, false),
        });
        self.finish_insert(block, Arc::clone(&handle));
        Ok(BlockRefMut::new(handle, self.policy.as_ref()))
    }

    /// Bring the raw image of `block` into fresh slots, preferring a
    /// cluster peer over the local file manager when a locator is
    /// configured. Peer failures degrade to the local read.
    fn load_image(
        &self,
        block: BlockId,
        hint: PlacementHint,
        locked_shard: usize,
    ) -> Result<SlotMemory> {
        if let Some(locator) = &self.locator {
            for peer in locator.peer_addresses(block) {
                match locator.pull_block(block, &peer) {
                    Ok(Some(image)) => {
                        if image.is_empty() || image.len() % SLOT_SIZE_BYTES != 0 {
                            log::warn!(
                                "peer {} sent malformed image of block {} ({} bytes), ignoring",
                                peer,
                                block,
                                image.len()
                            );
                            continue;
                        }
                        let num_slots = image.len() / SLOT_SIZE_BYTES;
                        self.make_room_for(num_slots, Some(locked_shard))?;
                        let mut memory = self.allocator.allocate(num_slots, hint)?;
                        memory.bytes_mut().copy_from_slice(&image);
                        return Ok(memory);
                    }
                    Ok(None) => {}
                    Err(e) => {
                        log::warn!("pull of block {} from peer {} failed: {}", block, peer, e);
                    }
                }
            }
        }
        let num_slots = self.file_manager.num_slots(block)?;
        self.make_room_for(num_slots, Some(locked_shard))?;
        let mut memory = self.allocator.allocate(num_slots, hint)?;
        self.file_manager.read_block_or_blob(block, memory.bytes_mut())?;
        Ok(memory)
    }

    /// Persist `block` if resident. Returns `Ok(false)` when it is not
    /// resident, `Ok(true)` otherwise; a clean block is not rewritten
    /// unless `force` is set. Write errors surface unchanged, with the
    /// dirty flag intact.
    pub fn save_block_or_blob(&self, block: BlockId, force: bool) -> Result<bool> {
        let handle = match self.directory.find(block) {
            Some(handle) => handle,
            None => return Ok(false),
        };
        if !handle.is_dirty() && !force {
            return Ok(true);
        }
        self.file_manager.write_block_or_blob(block, handle.bytes())?;
        handle.set_dirty(false);
        Ok(true)
    }

    /// Drop `block` from memory without saving it; the caller saves
    /// first if its content matters. Panics if any scoped reference is
    /// still live, since evicting a referenced block would leave it
    /// reading freed memory.
    pub fn evict_block_or_blob(&self, block: BlockId) -> Result<()> {
        let _shard = self.lock_manager.lock_exclusive(block);
        let handle = self
            .directory
            .remove(block)
            .ok_or(Error::BlockNotFoundInMemory(block))?;
        assert!(
            handle.ref_count() == 0,
            "evicting block {} with {} live references",
            block,
            handle.ref_count()
        );
        self.policy.block_evicted(block);
        if let Some(locator) = &self.locator {
            locator.block_removed(block);
        }
        Ok(())
    }

    /// Remove `block` everywhere: evict it if resident, delete its
    /// stored image, and retire its identity with the policy. The only
    /// operation after which an id is permanently unusable.
    pub fn delete_block_or_blob_file(&self, block: BlockId) -> Result<()> {
        match self.evict_block_or_blob(block) {
            Ok(()) | Err(Error::BlockNotFoundInMemory(_)) => {}
            Err(e) => return Err(e),
        }
        self.file_manager.delete_block_or_blob(block)?;
        self.policy.block_deleted(block);
        Ok(())
    }

    /// Evict unreferenced blocks until `slots` more fit in the budget.
    ///
    /// `locked_shard` is the shard the caller already holds, whose
    /// candidates are skipped to avoid self-deadlock. Candidates whose
    /// shard is busy, or which got referenced or evicted since they
    /// were chosen, are skipped as well; the policy drops every chosen
    /// candidate from its admissible set, so the loop terminates. When
    /// candidates run out the pool proceeds over budget, keeping the
    /// budget soft rather than failing a workload that pins everything.
    fn make_room_for(&self, slots: usize, locked_shard: Option<usize>) -> Result<()> {
        while self.allocator.over_budget(slots) {
            let candidate = match self.policy.choose_block_to_evict() {
                Some(candidate) => candidate,
                None => {
                    log::debug!(
                        "no eviction candidates, proceeding over budget ({} + {} of {} slots)",
                        self.allocator.slots_in_use(),
                        slots,
                        self.allocator.max_slots()
                    );
                    return Ok(());
                }
            };
            if Some(self.lock_manager.shard_of(candidate)) == locked_shard {
                continue;
            }
            let _shard = match self.lock_manager.try_lock_exclusive(candidate) {
                Some(guard) => guard,
                None => continue,
            };
            let handle = match self.directory.find(candidate) {
                Some(handle) => handle,
                None => continue,
            };
            // Re-check under the shard lock: the candidate may have been
            // referenced between selection and now.
            if handle.ref_count() != 0 {
                continue;
            }
            if handle.is_dirty() {
                self.file_manager
                    .write_block_or_blob(candidate, handle.bytes())?;
                handle.set_dirty(false);
            }
            let removed = self.directory.remove(candidate);
            debug_assert!(removed.is_some());
            self.policy.block_evicted(candidate);
            if let Some(locator) = &self.locator {
                locator.block_removed(candidate);
            }
            log::debug!("evicted block {} to make room", candidate);
        }
        Ok(())
    }

    /// Whether `block` is resident, as a point-in-time answer.
    #[inline]
    pub fn block_or_blob_is_loaded(&self, block: BlockId) -> bool {
        self.directory.contains(block)
    }

    /// Whether `block` is resident with unsaved changes.
    #[inline]
    pub fn block_or_blob_is_loaded_and_dirty(&self, block: BlockId) -> bool {
        self.directory
            .find(block)
            .map(|handle| handle.is_dirty())
            .unwrap_or(false)
    }

    #[inline]
    pub fn slots_in_use(&self) -> usize {
        self.allocator.slots_in_use()
    }

    #[inline]
    pub fn max_pool_slots(&self) -> usize {
        self.allocator.max_slots()
    }

    /// Bytes of slot memory currently mapped.
    #[inline]
    pub fn memory_size_bytes(&self) -> usize {
        self.slots_in_use() * SLOT_SIZE_BYTES
    }
}

impl Drop for BufferPoolManager {
    fn drop(&mut self) {
        for (block, handle) in self.directory.drain() {
            if handle.is_dirty() {
                log::warn!("block {} still dirty at shutdown, content not saved", block);
            }
        }
        if let Some(locator) = &self.locator {
            locator.unregister_domain(self.block_domain);
        }
    }
}

fn verify_kind(handle: &BlockHandle, expect_blob: bool) {
    if handle.is_blob() != expect_blob {
        if expect_blob {
            panic!(
                "blob {} requested but the identity is loaded as a block",
                handle.id()
            );
        } else {
            panic!(
                "block {} requested but the identity is loaded as a blob",
                handle.id()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::EvictAnyPolicy;
    use easy_parallel::Parallel;
    use parking_lot::Mutex;
    use rand::Rng;
    use std::env;
    use std::fs;
    use std::path::PathBuf;
    use std::sync::atomic::AtomicUsize;

    fn scratch_config(tag: &str, pool_slots: usize) -> (BufferPoolConfig, PathBuf) {
        let nonce: u64 = rand::rng().random();
        let dir = env::temp_dir().join(format!("quarry_pool_{}_{}", tag, nonce));
        let config = BufferPoolConfig::default()
            .storage_dir(dir.to_string_lossy())
            .pool_slots(pool_slots);
        (config, dir)
    }

    fn evict_any_pool(config: BufferPoolConfig) -> BufferPoolManager {
        BufferPoolManager::with_policy(config, Box::new(EvictAnyPolicy::new())).unwrap()
    }

    /// Wraps the local file manager and counts backend traffic.
    struct CountingFileManager {
        inner: LocalFileManager,
        reads: Arc<AtomicUsize>,
        writes: Arc<AtomicUsize>,
    }

    impl CountingFileManager {
        fn new(dir: &PathBuf) -> (Self, Arc<AtomicUsize>, Arc<AtomicUsize>) {
            let reads = Arc::new(AtomicUsize::new(0));
            let writes = Arc::new(AtomicUsize::new(0));
            let fm = CountingFileManager {
                inner: LocalFileManager::new(dir).unwrap(),
                reads: Arc::clone(&reads),
                writes: Arc::clone(&writes),
            };
            (fm, reads, writes)
        }
    }

    impl FileManager for CountingFileManager {
        fn num_slots(&self, block: BlockId) -> Result<usize> {
            self.inner.num_slots(block)
        }

        fn read_block_or_blob(&self, block: BlockId, buffer: &mut [u8]) -> Result<()> {
            self.reads.fetch_add(1, Ordering::AcqRel);
            self.inner.read_block_or_blob(block, buffer)
        }

        fn write_block_or_blob(&self, block: BlockId, buffer: &[u8]) -> Result<()> {
            self.writes.fetch_add(1, Ordering::AcqRel);
            self.inner.write_block_or_blob(block, buffer)
        }

        fn delete_block_or_blob(&self, block: BlockId) -> Result<()> {
            self.inner.delete_block_or_blob(block)
        }

        fn max_used_block_counter(&self, domain: u16) -> u64 {
            self.inner.max_used_block_counter(domain)
        }
    }

    #[test]
    fn test_create_write_save_evict_reload() {
        let (config, dir) = scratch_config("round_trip", 8);
        let pool = evict_any_pool(config);
        let relation = RelationSchema::new(11);
        let block = pool
            .create_block(&relation, &BlockLayout::with_num_slots(2), PlacementHint::None)
            .unwrap();
        assert!(pool.block_or_blob_is_loaded_and_dirty(block));

        {
            let mut r = pool
                .get_block_mut(block, &relation, PlacementHint::None)
                .unwrap();
            r.block_mut().write_at(64, b"forty-two tuples").unwrap();
        }
        assert!(pool.save_block_or_blob(block, false).unwrap());
        assert!(!pool.block_or_blob_is_loaded_and_dirty(block));

        pool.evict_block_or_blob(block).unwrap();
        assert!(!pool.block_or_blob_is_loaded(block));
        assert_eq!(pool.slots_in_use(), 0);

        let r = pool
            .get_block(block, &relation, PlacementHint::None)
            .unwrap();
        assert_eq!(r.num_slots(), 2);
        assert_eq!(r.block().relation(), relation);
        assert_eq!(&r.bytes()[64..80], b"forty-two tuples");
        drop(r);
        drop(pool);
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_referenced_blocks_survive_memory_pressure() {
        let (config, dir) = scratch_config("pinned", 1);
        let pool = evict_any_pool(config);
        let a = pool.create_blob(1, PlacementHint::None).unwrap();
        let pinned = pool.get_blob_mut(a, PlacementHint::None).unwrap();
        assert_eq!(pinned.pin_count(), 1);

        // Budget is exhausted and the only candidate is pinned, so the
        // pool goes over budget instead of evicting it.
        let b = pool.create_blob(1, PlacementHint::None).unwrap();
        assert!(pool.block_or_blob_is_loaded(a));
        assert!(pool.block_or_blob_is_loaded(b));
        assert_eq!(pool.slots_in_use(), 2);

        // Once unpinned, both become admissible and the next allocation
        // sweeps until the budget holds again.
        pinned.release();
        let c = pool.create_blob(1, PlacementHint::None).unwrap();
        assert!(!pool.block_or_blob_is_loaded(a));
        assert!(!pool.block_or_blob_is_loaded(b));
        assert!(pool.block_or_blob_is_loaded(c));
        assert_eq!(pool.slots_in_use(), 1);

        // Evicted under pressure means saved first: a reload sees them.
        let r = pool.get_blob(a, PlacementHint::None).unwrap();
        assert_eq!(r.num_slots(), 1);
        drop(r);
        drop(pool);
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_concurrent_cold_get_reads_backend_once() {
        let (config, dir) = scratch_config("cold_get", 8);
        let (fm, reads, _writes) = CountingFileManager::new(&dir);
        let pool = BufferPoolManager::with_parts(
            config,
            Box::new(EvictAnyPolicy::new()),
            Box::new(fm),
            None,
        )
        .unwrap();

        let blob = pool.create_blob(1, PlacementHint::None).unwrap();
        {
            let mut r = pool.get_blob_mut(blob, PlacementHint::None).unwrap();
            r.blob_mut().write_at(0, b"cold").unwrap();
        }
        pool.save_block_or_blob(blob, false).unwrap();
        pool.evict_block_or_blob(blob).unwrap();
        assert!(!pool.block_or_blob_is_loaded(blob));

        let instance_addrs: Mutex<Vec<usize>> = Mutex::new(Vec::new());
        Parallel::new()
            .each(0..8, |_| {
                let r = pool.get_blob(blob, PlacementHint::None).unwrap();
                assert_eq!(&r.bytes()[..4], b"cold");
                instance_addrs.lock().push(r.bytes().as_ptr() as usize);
            })
            .run();

        assert_eq!(reads.load(Ordering::Acquire), 1);
        let addrs = instance_addrs.into_inner();
        assert_eq!(addrs.len(), 8);
        assert!(addrs.iter().all(|&a| a == addrs[0]));
        drop(pool);
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_slot_accounting_across_create_and_evict() {
        let (config, dir) = scratch_config("accounting", 16);
        let pool = evict_any_pool(config);
        let relation = RelationSchema::new(1);
        let layout = BlockLayout::with_num_slots(2);

        let blocks: Vec<BlockId> = (0..4)
            .map(|_| {
                pool.create_block(&relation, &layout, PlacementHint::None)
                    .unwrap()
            })
            .collect();
        assert_eq!(pool.slots_in_use(), 8);
        assert_eq!(pool.memory_size_bytes(), 8 * SLOT_SIZE_BYTES);

        for block in &blocks[..2] {
            pool.evict_block_or_blob(*block).unwrap();
        }
        assert_eq!(pool.slots_in_use(), 4);
        assert!(matches!(
            pool.evict_block_or_blob(blocks[0]),
            Err(Error::BlockNotFoundInMemory(_))
        ));
        drop(pool);
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_delete_makes_identity_unusable() {
        let (config, dir) = scratch_config("delete", 8);
        let pool = evict_any_pool(config);
        let relation = RelationSchema::new(5);
        let block = pool
            .create_block(&relation, &BlockLayout::with_num_slots(1), PlacementHint::None)
            .unwrap();

        // Never saved: eviction discards the content, deletion of the
        // missing file still succeeds.
        pool.evict_block_or_blob(block).unwrap();
        pool.delete_block_or_blob_file(block).unwrap();

        match pool.get_block(block, &relation, PlacementHint::None) {
            Err(Error::BlockNotFoundInPersistentStorage(b)) => assert_eq!(b, block),
            other => panic!("unexpected result: {:?}", other.map(|r| r.id())),
        }
        drop(pool);
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_delete_resident_block() {
        let (config, dir) = scratch_config("delete_resident", 8);
        let pool = evict_any_pool(config);
        let blob = pool.create_blob(1, PlacementHint::None).unwrap();
        pool.save_block_or_blob(blob, false).unwrap();

        pool.delete_block_or_blob_file(blob).unwrap();
        assert!(!pool.block_or_blob_is_loaded(blob));
        assert!(matches!(
            pool.get_blob(blob, PlacementHint::None),
            Err(Error::BlockNotFoundInPersistentStorage(_))
        ));
        drop(pool);
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_save_semantics() {
        let (config, dir) = scratch_config("save", 8);
        let (fm, _reads, writes) = CountingFileManager::new(&dir);
        let pool = BufferPoolManager::with_parts(
            config,
            Box::new(EvictAnyPolicy::new()),
            Box::new(fm),
            None,
        )
        .unwrap();

        let absent = BlockId::new(1, 999);
        assert!(!pool.save_block_or_blob(absent, true).unwrap());

        let blob = pool.create_blob(1, PlacementHint::None).unwrap();
        assert!(pool.save_block_or_blob(blob, false).unwrap());
        assert_eq!(writes.load(Ordering::Acquire), 1);

        // Clean and unforced: no I/O.
        assert!(pool.save_block_or_blob(blob, false).unwrap());
        assert_eq!(writes.load(Ordering::Acquire), 1);

        assert!(pool.save_block_or_blob(blob, true).unwrap());
        assert_eq!(writes.load(Ordering::Acquire), 2);
        drop(pool);
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_id_allocation_seeded_from_storage() {
        let (config, dir) = scratch_config("seed", 8);
        {
            let fm = LocalFileManager::new(&dir).unwrap();
            let image = vec![0u8; SLOT_SIZE_BYTES];
            fm.write_block_or_blob(BlockId::new(1, 7), &image).unwrap();
        }
        let pool = evict_any_pool(config);
        let block = pool.create_blob(1, PlacementHint::None).unwrap();
        assert_eq!(block.domain(), 1);
        assert_eq!(block.counter(), 8);
        drop(pool);
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_concurrent_get_and_eviction_sweep_progress() {
        for lock_shards in [1usize, 4] {
            let (config, dir) = scratch_config("sweep", 2);
            let pool = evict_any_pool(config.lock_shards(lock_shards));
            let hot = pool.create_blob(1, PlacementHint::None).unwrap();
            pool.save_block_or_blob(hot, false).unwrap();

            Parallel::new()
                .add(|| {
                    // Keeps re-pinning the hot blob; reloads it whenever
                    // the sweep took it in between.
                    for _ in 0..50 {
                        let r = pool.get_blob(hot, PlacementHint::None).unwrap();
                        assert_eq!(r.num_slots(), 1);
                    }
                })
                .add(|| {
                    // Every create pressures the budget and runs a sweep
                    // that may pick the hot blob as candidate.
                    for _ in 0..20 {
                        let scratch = pool.create_blob(1, PlacementHint::None).unwrap();
                        pool.delete_block_or_blob_file(scratch).unwrap();
                    }
                })
                .run();

            assert!(pool.slots_in_use() <= pool.max_pool_slots() + 1);
            drop(pool);
            fs::remove_dir_all(&dir).unwrap();
        }
    }

    /// Locator test double holding one block image on a single peer.
    struct OnePeerLocator {
        served: BlockId,
        image: Vec<u8>,
        pulls: AtomicUsize,
    }

    impl BlockLocator for OnePeerLocator {
        fn register_domain(&self, _domain: u16) {}
        fn unregister_domain(&self, _domain: u16) {}
        fn block_added(&self, _block: BlockId) {}
        fn block_removed(&self, _block: BlockId) {}

        fn peer_addresses(&self, block: BlockId) -> Vec<String> {
            if block == self.served {
                vec![String::from("dead-peer:1"), String::from("peer:2")]
            } else {
                Vec::new()
            }
        }

        fn pull_block(&self, block: BlockId, peer: &str) -> Result<Option<Vec<u8>>> {
            if peer == "dead-peer:1" {
                return Err(Error::FileReadError(String::from("peer unreachable")));
            }
            self.pulls.fetch_add(1, Ordering::AcqRel);
            if block == self.served {
                Ok(Some(self.image.clone()))
            } else {
                Ok(None)
            }
        }
    }

    #[test]
    fn test_remote_pull_before_local_read() {
        let (config, dir) = scratch_config("remote", 8);
        let remote_id = BlockId::new(9, 1);
        let mut image = vec![0u8; SLOT_SIZE_BYTES];
        image[..6].copy_from_slice(b"remote");
        let locator = OnePeerLocator {
            served: remote_id,
            image,
            pulls: AtomicUsize::new(0),
        };
        let (fm, reads, _writes) = CountingFileManager::new(&dir);
        let pool = BufferPoolManager::with_parts(
            config,
            Box::new(EvictAnyPolicy::new()),
            Box::new(fm),
            Some(Box::new(locator)),
        )
        .unwrap();

        // The dead peer is skipped, the live one serves the image, and
        // the local backend is never touched.
        let r = pool.get_blob(remote_id, PlacementHint::None).unwrap();
        assert_eq!(&r.bytes()[..6], b"remote");
        assert_eq!(reads.load(Ordering::Acquire), 0);
        drop(r);
        drop(pool);
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    #[should_panic(expected = "loaded as a blob")]
    fn test_kind_mismatch_panics() {
        let (config, _dir) = scratch_config("mismatch", 8);
        let pool = evict_any_pool(config);
        let blob = pool.create_blob(1, PlacementHint::None).unwrap();
        let _ = pool.get_block(blob, &RelationSchema::new(1), PlacementHint::None);
    }
}
