use crate::block::{BlockId, BlockInstance, StorageBlob, StorageBlock};
use crate::buffer::directory::BlockHandle;
use crate::policy::EvictionPolicy;
use std::sync::Arc;

/// A mutable scoped reference to a resident block or blob.
///
/// While any scoped reference is live the block is pinned: its handle
/// reference count is above zero and the eviction sweep will not take
/// it. Construction increments the count and notifies the eviction
/// policy; drop (on scope exit or explicit [`release`](Self::release))
/// reverses both. A moved-from or released reference drops as a no-op.
///
/// Mutable and immutable references are exclusive at the handle level
/// by convention: the engine hands a block to at most one writer at a
/// time, matching the single-writer/multiple-reader discipline of the
/// data underneath. A mutable reference converts into an immutable one
/// via `From`, never the reverse.
pub struct BlockRefMut<'a> {
    handle: Option<Arc<BlockHandle>>,
    policy: &'a dyn EvictionPolicy,
}

impl<'a> BlockRefMut<'a> {
    #[inline]
    pub(crate) fn new(handle: Arc<BlockHandle>, policy: &'a dyn EvictionPolicy) -> Self {
        handle.acquire_ref();
        policy.block_referenced(handle.id());
        BlockRefMut {
            handle: Some(handle),
            policy,
        }
    }

    #[inline]
    fn handle(&self) -> &BlockHandle {
        self.handle.as_ref().expect("released block reference")
    }

    #[inline]
    pub fn id(&self) -> BlockId {
        self.handle().id()
    }

    #[inline]
    pub fn num_slots(&self) -> usize {
        self.handle().num_slots()
    }

    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.handle().is_dirty()
    }

    /// Live reference count of the underlying block, including this one.
    #[inline]
    pub fn pin_count(&self) -> u32 {
        self.handle().ref_count()
    }

    #[inline]
    pub fn instance(&self) -> &BlockInstance {
        self.handle().instance()
    }

    /// The block variant. Panics if this reference points at a blob.
    #[inline]
    pub fn block(&self) -> &StorageBlock {
        match self.instance() {
            BlockInstance::Block(b) => b,
            BlockInstance::Blob(_) => panic!("block {} is a blob", self.id()),
        }
    }

    /// Mutable access to the block variant; marks the block dirty.
    #[inline]
    pub fn block_mut(&mut self) -> &mut StorageBlock {
        let handle = self.handle.as_ref().expect("released block reference");
        handle.set_dirty(true);
        match unsafe { handle.instance_mut() } {
            BlockInstance::Block(b) => b,
            BlockInstance::Blob(_) => panic!("block {} is a blob", handle.id()),
        }
    }

    /// The blob variant. Panics if this reference points at a block.
    #[inline]
    pub fn blob(&self) -> &StorageBlob {
        match self.instance() {
            BlockInstance::Blob(b) => b,
            BlockInstance::Block(_) => panic!("blob {} is a block", self.id()),
        }
    }

    /// Mutable access to the blob variant; marks the blob dirty.
    #[inline]
    pub fn blob_mut(&mut self) -> &mut StorageBlob {
        let handle = self.handle.as_ref().expect("released block reference");
        handle.set_dirty(true);
        match unsafe { handle.instance_mut() } {
            BlockInstance::Blob(b) => b,
            BlockInstance::Block(_) => panic!("blob {} is a block", handle.id()),
        }
    }

    /// Raw bytes of the whole block.
    #[inline]
    pub fn bytes(&self) -> &[u8] {
        self.handle().bytes()
    }

    /// Unpin the block now instead of at scope exit.
    #[inline]
    pub fn release(mut self) {
        self.unpin();
    }

    #[inline]
    fn unpin(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.release_ref();
            self.policy.block_unreferenced(handle.id());
        }
    }

    #[inline]
    pub(crate) fn take_handle(mut self) -> (Arc<BlockHandle>, &'a dyn EvictionPolicy) {
        let handle = self.handle.take().expect("released block reference");
        (handle, self.policy)
    }
}

impl Drop for BlockRefMut<'_> {
    fn drop(&mut self) {
        self.unpin();
    }
}

/// An immutable scoped reference to a resident block or blob.
/// Same pinning semantics as [`BlockRefMut`], read-only surface.
pub struct BlockRef<'a> {
    handle: Option<Arc<BlockHandle>>,
    policy: &'a dyn EvictionPolicy,
}

impl<'a> BlockRef<'a> {
    #[inline]
    fn handle(&self) -> &BlockHandle {
        self.handle.as_ref().expect("released block reference")
    }

    #[inline]
    pub fn id(&self) -> BlockId {
        self.handle().id()
    }

    #[inline]
    pub fn num_slots(&self) -> usize {
        self.handle().num_slots()
    }

    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.handle().is_dirty()
    }

    /// Live reference count of the underlying block, including this one.
    #[inline]
    pub fn pin_count(&self) -> u32 {
        self.handle().ref_count()
    }

    #[inline]
    pub fn instance(&self) -> &BlockInstance {
        self.handle().instance()
    }

    /// The block variant. Panics if this reference points at a blob.
    #[inline]
    pub fn block(&self) -> &StorageBlock {
        match self.instance() {
            BlockInstance::Block(b) => b,
            BlockInstance::Blob(_) => panic!("block {} is a blob", self.id()),
        }
    }

    /// The blob variant. Panics if this reference points at a block.
    #[inline]
    pub fn blob(&self) -> &StorageBlob {
        match self.instance() {
            BlockInstance::Blob(b) => b,
            BlockInstance::Block(_) => panic!("blob {} is a block", self.id()),
        }
    }

    /// Raw bytes of the whole block.
    #[inline]
    pub fn bytes(&self) -> &[u8] {
        self.handle().bytes()
    }

    /// Unpin the block now instead of at scope exit.
    #[inline]
    pub fn release(mut self) {
        self.unpin();
    }

    #[inline]
    fn unpin(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.release_ref();
            self.policy.block_unreferenced(handle.id());
        }
    }
}

impl Drop for BlockRef<'_> {
    fn drop(&mut self) {
        self.unpin();
    }
}

/// A mutable reference gives up write access by moving into an
/// immutable one. The pin transfers: no count or policy notification
/// changes hands.
impl<'a> From<BlockRefMut<'a>> for BlockRef<'a> {
    #[inline]
    fn from(src: BlockRefMut<'a>) -> Self {
        let (handle, policy) = src.take_handle();
        BlockRef {
            handle: Some(handle),
            policy,
        }
    }
}
