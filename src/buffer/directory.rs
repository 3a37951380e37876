use crate::block::{BlockId, BlockInstance, BlockKind, RelationSchema, StorageBlob, StorageBlock};
use crate::buffer::slots::SlotMemory;
use parking_lot::RwLock;
use std::cell::UnsafeCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

/// A resident block: the slot memory, the block object constructed over
/// it, the live reference count and the dirty flag.
///
/// The handle is shared through `Arc` between the directory and scoped
/// references; the reference count below is the eviction gate and is
/// maintained in all builds, not just debug ones.
pub struct BlockHandle {
    id: BlockId,
    memory: SlotMemory,
    instance: UnsafeCell<BlockInstance>,
    ref_count: AtomicU32,
    dirty: AtomicBool,
}

// The instance aliases the handle-owned slot memory through raw
// pointers; access is serialized by the scoped-reference discipline.
unsafe impl Send for BlockHandle {}
unsafe impl Sync for BlockHandle {}

impl BlockHandle {
    /// Construct a block over freshly allocated or loaded slot memory.
    #[inline]
    pub(crate) fn new_block(
        id: BlockId,
        relation: RelationSchema,
        memory: SlotMemory,
        dirty: bool,
    ) -> Self {
        let instance = unsafe {
            BlockInstance::Block(StorageBlock::new(
                relation,
                memory.as_ptr(),
                memory.len_bytes(),
            ))
        };
        BlockHandle {
            id,
            memory,
            instance: UnsafeCell::new(instance),
            ref_count: AtomicU32::new(0),
            dirty: AtomicBool::new(dirty),
        }
    }

    /// Construct a blob over freshly allocated or loaded slot memory.
    #[inline]
    pub(crate) fn new_blob(id: BlockId, memory: SlotMemory, dirty: bool) -> Self {
        let instance =
            unsafe { BlockInstance::Blob(StorageBlob::new(memory.as_ptr(), memory.len_bytes())) };
        BlockHandle {
            id,
            memory,
            instance: UnsafeCell::new(instance),
            ref_count: AtomicU32::new(0),
            dirty: AtomicBool::new(dirty),
        }
    }

    #[inline]
    pub fn id(&self) -> BlockId {
        self.id
    }

    #[inline]
    pub fn num_slots(&self) -> usize {
        self.memory.num_slots()
    }

    #[inline]
    pub fn kind(&self) -> BlockKind {
        self.instance().kind()
    }

    #[inline]
    pub fn is_blob(&self) -> bool {
        self.instance().is_blob()
    }

    #[inline]
    pub fn instance(&self) -> &BlockInstance {
        unsafe { &*self.instance.get() }
    }

    /// Mutable access to the block instance.
    ///
    /// # Safety
    ///
    /// Caller must be the sole mutable referent, which the buffer pool
    /// guarantees through the single-writer convention on mutable
    /// scoped references.
    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn instance_mut(&self) -> &mut BlockInstance {
        unsafe { &mut *self.instance.get() }
    }

    /// Raw bytes of the whole block, for persistence.
    #[inline]
    pub fn bytes(&self) -> &[u8] {
        self.memory.bytes()
    }

    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_dirty(&self, dirty: bool) {
        self.dirty.store(dirty, Ordering::Release);
    }

    #[inline]
    pub fn ref_count(&self) -> u32 {
        self.ref_count.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn acquire_ref(&self) {
        self.ref_count.fetch_add(1, Ordering::AcqRel);
    }

    #[inline]
    pub(crate) fn release_ref(&self) {
        let prev = self.ref_count.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "reference count underflow on block {}", self.id);
    }
}

/// In-memory mapping from block id to resident handle.
///
/// One reader/writer lock guards the map structure. The lock is held
/// only for map manipulation, never across I/O; presence races on a
/// single block are resolved by the per-block shard locks.
pub struct BlockDirectory {
    map: RwLock<HashMap<BlockId, Arc<BlockHandle>>>,
}

impl BlockDirectory {
    #[inline]
    pub fn new() -> Self {
        BlockDirectory {
            map: RwLock::new(HashMap::new()),
        }
    }

    #[inline]
    pub fn find(&self, block: BlockId) -> Option<Arc<BlockHandle>> {
        let g = self.map.read();
        g.get(&block).cloned()
    }

    #[inline]
    pub fn contains(&self, block: BlockId) -> bool {
        let g = self.map.read();
        g.contains_key(&block)
    }

    /// Insert a resident handle. Ids are allocated by an atomic counter
    /// and loads are serialized per shard, so a duplicate insert means
    /// corrupted accounting and aborts.
    #[inline]
    pub fn insert(&self, block: BlockId, handle: Arc<BlockHandle>) {
        let mut g = self.map.write();
        let prev = g.insert(block, handle);
        assert!(prev.is_none(), "duplicate resident block {}", block);
    }

    #[inline]
    pub fn remove(&self, block: BlockId) -> Option<Arc<BlockHandle>> {
        let mut g = self.map.write();
        g.remove(&block)
    }

    #[inline]
    pub fn len(&self) -> usize {
        let g = self.map.read();
        g.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove and return all resident handles, for shutdown.
    #[inline]
    pub fn drain(&self) -> Vec<(BlockId, Arc<BlockHandle>)> {
        let mut g = self.map.write();
        g.drain().collect()
    }
}

impl Default for BlockDirectory {
    #[inline]
    fn default() -> Self {
        BlockDirectory::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::slots::{PlacementHint, SlotAllocator};

    fn test_handle(id: BlockId, allocator: &SlotAllocator) -> Arc<BlockHandle> {
        let memory = allocator.allocate(1, PlacementHint::None).unwrap();
        Arc::new(BlockHandle::new_blob(id, memory, true))
    }

    #[test]
    fn test_directory_find_insert_remove() {
        let allocator = SlotAllocator::new(4);
        let dir = BlockDirectory::new();
        let id = BlockId::new(1, 1);
        assert!(dir.find(id).is_none());

        dir.insert(id, test_handle(id, &allocator));
        assert!(dir.contains(id));
        assert_eq!(dir.len(), 1);
        let found = dir.find(id).unwrap();
        assert_eq!(found.id(), id);
        drop(found);

        let removed = dir.remove(id).unwrap();
        assert_eq!(removed.num_slots(), 1);
        assert!(dir.find(id).is_none());
        drop(removed);
        assert_eq!(allocator.slots_in_use(), 0);
    }

    #[test]
    #[should_panic(expected = "duplicate resident block")]
    fn test_directory_double_insert_aborts() {
        let allocator = SlotAllocator::new(4);
        let dir = BlockDirectory::new();
        let id = BlockId::new(1, 2);
        dir.insert(id, test_handle(id, &allocator));
        dir.insert(id, test_handle(id, &allocator));
    }

    #[test]
    fn test_handle_ref_count() {
        let allocator = SlotAllocator::new(4);
        let handle = test_handle(BlockId::new(1, 3), &allocator);
        assert_eq!(handle.ref_count(), 0);
        handle.acquire_ref();
        handle.acquire_ref();
        assert_eq!(handle.ref_count(), 2);
        handle.release_ref();
        assert_eq!(handle.ref_count(), 1);
        handle.release_ref();
        assert_eq!(handle.ref_count(), 0);
    }

    #[test]
    #[should_panic(expected = "reference count underflow")]
    fn test_handle_ref_count_underflow_aborts() {
        let allocator = SlotAllocator::new(4);
        let handle = test_handle(BlockId::new(1, 4), &allocator);
        handle.release_ref();
    }
}
