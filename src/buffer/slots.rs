use crate::error::{Error, Result};
use libc::{
    c_void, madvise, mmap, munmap, MADV_DONTFORK, MADV_HUGEPAGE, MAP_ANONYMOUS, MAP_FAILED,
    MAP_PRIVATE, PROT_READ, PROT_WRITE,
};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Size of one buffer pool slot. All allocations are whole slot counts.
pub const SLOT_SIZE_BYTES: usize = 2 * 1024 * 1024;

/// Returns the number of slots needed to store the given number of bytes.
///
/// Blobs sized with this helper may carry some extra bytes, modulo the
/// slot size. Blocks have internal metadata that needs storage beyond
/// the raw tuple bytes, so their layouts specify slot counts directly.
#[inline]
pub fn slots_needed_for_bytes(bytes: usize) -> usize {
    (bytes + SLOT_SIZE_BYTES - 1) / SLOT_SIZE_BYTES
}

/// Placement hint for slot allocation, e.g. a locality domain picked by
/// the catalog's placement scheme. The allocator may consult it but is
/// free to ignore it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PlacementHint {
    #[default]
    None,
    Locality(u32),
}

/// Acquires and releases raw, zero-initialized memory in units of
/// [`SLOT_SIZE_BYTES`] and tracks total slots in use.
///
/// The in-use counter is a soft budget: callers consult
/// [`SlotAllocator::over_budget`] and evict, but `allocate` itself never
/// refuses an allocation the OS can satisfy.
pub struct SlotAllocator {
    max_slots: usize,
    slots_in_use: Arc<AtomicUsize>,
}

impl SlotAllocator {
    #[inline]
    pub fn new(max_slots: usize) -> Self {
        SlotAllocator {
            max_slots,
            slots_in_use: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Upper limit on slots, as configured.
    #[inline]
    pub fn max_slots(&self) -> usize {
        self.max_slots
    }

    /// Snapshot of slots currently allocated.
    #[inline]
    pub fn slots_in_use(&self) -> usize {
        self.slots_in_use.load(Ordering::Acquire)
    }

    /// Whether allocating `additional` slots would exceed the budget.
    #[inline]
    pub fn over_budget(&self, additional: usize) -> bool {
        self.slots_in_use() + additional > self.max_slots
    }

    /// Allocate a zeroed region of `num_slots` slots.
    ///
    /// The memory is mapped anonymously so it is zero-filled by the OS,
    /// and advised towards huge pages like the rest of the engine's pools.
    pub fn allocate(&self, num_slots: usize, hint: PlacementHint) -> Result<SlotMemory> {
        debug_assert!(num_slots > 0);
        if let PlacementHint::Locality(node) = hint {
            log::debug!("allocating {} slots with locality hint {}", num_slots, node);
        }
        let total_bytes = num_slots * SLOT_SIZE_BYTES;
        let ptr = unsafe {
            let chunk = mmap(
                std::ptr::null_mut(),
                total_bytes,
                PROT_READ | PROT_WRITE,
                MAP_PRIVATE | MAP_ANONYMOUS,
                -1,
                0,
            );
            if chunk == MAP_FAILED {
                return Err(Error::OutOfMemory(num_slots));
            }
            madvise(chunk, total_bytes, MADV_HUGEPAGE);
            madvise(chunk, total_bytes, MADV_DONTFORK);
            NonNull::new_unchecked(chunk as *mut u8)
        };
        self.slots_in_use.fetch_add(num_slots, Ordering::AcqRel);
        Ok(SlotMemory {
            ptr,
            num_slots,
            usage: Arc::clone(&self.slots_in_use),
        })
    }
}

/// An owned region of slot memory. Dropping it unmaps the region and
/// returns its slots to the allocator's accounting, so slots can never
/// leak from an early-return path.
pub struct SlotMemory {
    ptr: NonNull<u8>,
    num_slots: usize,
    usage: Arc<AtomicUsize>,
}

impl SlotMemory {
    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    #[inline]
    pub fn num_slots(&self) -> usize {
        self.num_slots
    }

    #[inline]
    pub fn len_bytes(&self) -> usize {
        self.num_slots * SLOT_SIZE_BYTES
    }

    #[inline]
    pub fn bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len_bytes()) }
    }

    #[inline]
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len_bytes()) }
    }
}

impl Drop for SlotMemory {
    fn drop(&mut self) {
        unsafe {
            munmap(self.ptr.as_ptr() as *mut c_void, self.len_bytes());
        }
        self.usage.fetch_sub(self.num_slots, Ordering::AcqRel);
    }
}

unsafe impl Send for SlotMemory {}
unsafe impl Sync for SlotMemory {}
