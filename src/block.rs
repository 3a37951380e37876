use crate::error::{Error, Result};
use std::fmt;

/// Number of bits of a block id reserved for the domain.
pub const BLOCK_ID_DOMAIN_BITS: u32 = 16;
/// Number of bits of a block id reserved for the per-domain counter.
pub const BLOCK_ID_COUNTER_BITS: u32 = 48;
/// Largest valid domain. Domain 0 is reserved for the invalid id.
pub const MAX_BLOCK_DOMAIN: u16 = u16::MAX;
/// Largest per-domain counter value that fits in a block id.
pub const MAX_BLOCK_COUNTER: u64 = (1u64 << BLOCK_ID_COUNTER_BITS) - 1;

/// Globally unique identity of a block or blob.
///
/// The upper 16 bits hold the domain (the cluster partition which
/// allocated the id), the lower 48 bits a counter that increases
/// monotonically within each domain. The all-zero value is reserved
/// as invalid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(u64);

pub const INVALID_BLOCK_ID: BlockId = BlockId(0);

impl BlockId {
    /// Encode a block id from domain and counter.
    ///
    /// Domain must be nonzero and counter must fit in 48 bits.
    #[inline]
    pub fn new(domain: u16, counter: u64) -> Self {
        assert!(domain != 0, "block domain must be nonzero");
        assert!(counter <= MAX_BLOCK_COUNTER, "block counter overflow");
        BlockId(((domain as u64) << BLOCK_ID_COUNTER_BITS) | counter)
    }

    #[inline]
    pub fn from_raw(raw: u64) -> Self {
        BlockId(raw)
    }

    #[inline]
    pub fn raw(self) -> u64 {
        self.0
    }

    /// Returns the domain encoded in this id.
    #[inline]
    pub fn domain(self) -> u16 {
        (self.0 >> BLOCK_ID_COUNTER_BITS) as u16
    }

    /// Returns the per-domain counter encoded in this id.
    #[inline]
    pub fn counter(self) -> u64 {
        self.0 & MAX_BLOCK_COUNTER
    }

    #[inline]
    pub fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.domain(), self.counter())
    }
}

/// Minimal view of the catalog relation a block belongs to.
/// The catalog itself is an external collaborator; the buffer pool
/// only carries the relation id through block construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelationSchema {
    pub relation_id: u32,
}

impl RelationSchema {
    #[inline]
    pub fn new(relation_id: u32) -> Self {
        RelationSchema { relation_id }
    }
}

/// Physical layout of a new block: how many slots it occupies.
/// Sub-block organization (row store, column store, indexes) is the
/// concern of the block internals, not of the buffer pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockLayout {
    pub num_slots: usize,
}

impl BlockLayout {
    #[inline]
    pub fn with_num_slots(num_slots: usize) -> Self {
        assert!(num_slots > 0, "block layout must occupy at least one slot");
        BlockLayout { num_slots }
    }
}

/// Whether an instance holds structured tuples or an undifferentiated
/// byte range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Block,
    Blob,
}

/// A block of structured tuple storage, constructed over buffer pool
/// memory owned by its handle.
pub struct StorageBlock {
    relation: RelationSchema,
    data: *mut u8,
    len: usize,
}

impl StorageBlock {
    /// # Safety
    ///
    /// `data` must point to `len` bytes that outlive this instance.
    #[inline]
    pub(crate) unsafe fn new(relation: RelationSchema, data: *mut u8, len: usize) -> Self {
        StorageBlock {
            relation,
            data,
            len,
        }
    }

    #[inline]
    pub fn relation(&self) -> RelationSchema {
        self.relation
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.data, self.len) }
    }

    /// Write an opaque tuple payload at the given offset.
    /// Fails if the payload does not fit within the block.
    #[inline]
    pub fn write_at(&mut self, offset: usize, payload: &[u8]) -> Result<()> {
        if offset.saturating_add(payload.len()) > self.len {
            return Err(Error::TupleTooLargeForBlock {
                tuple_bytes: payload.len(),
                block_bytes: self.len,
            });
        }
        unsafe {
            std::ptr::copy_nonoverlapping(payload.as_ptr(), self.data.add(offset), payload.len());
        }
        Ok(())
    }
}

/// A blob: an undifferentiated byte range over buffer pool memory.
pub struct StorageBlob {
    data: *mut u8,
    len: usize,
}

impl StorageBlob {
    /// # Safety
    ///
    /// `data` must point to `len` bytes that outlive this instance.
    #[inline]
    pub(crate) unsafe fn new(data: *mut u8, len: usize) -> Self {
        StorageBlob { data, len }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.data, self.len) }
    }

    #[inline]
    pub fn write_at(&mut self, offset: usize, payload: &[u8]) -> Result<()> {
        if offset.saturating_add(payload.len()) > self.len {
            return Err(Error::TupleTooLargeForBlock {
                tuple_bytes: payload.len(),
                block_bytes: self.len,
            });
        }
        unsafe {
            std::ptr::copy_nonoverlapping(payload.as_ptr(), self.data.add(offset), payload.len());
        }
        Ok(())
    }
}

/// The resident block object. The set of variants is fixed, so the
/// instance is a tagged enum dispatched explicitly instead of an open
/// polymorphic hierarchy.
pub enum BlockInstance {
    Block(StorageBlock),
    Blob(StorageBlob),
}

impl BlockInstance {
    #[inline]
    pub fn kind(&self) -> BlockKind {
        match self {
            BlockInstance::Block(_) => BlockKind::Block,
            BlockInstance::Blob(_) => BlockKind::Blob,
        }
    }

    #[inline]
    pub fn is_blob(&self) -> bool {
        matches!(self, BlockInstance::Blob(_))
    }
}
