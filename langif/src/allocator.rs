use std::{
    alloc::{self, Layout},
    ptr::NonNull,
};

/// Granule of runtime owned buffers, capacities are rounded up to it.
pub const EMA_ALIGN: usize = 16;

pub trait Allocator: Send + Sync {
    /// Zeroed memory for a non zero sized `layout`, `None` when exhausted.
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>>;

    /// # Safety
    /// `ptr` must come from `allocate` on this allocator with the same layout.
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RustAllocator;

impl Allocator for RustAllocator {
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
        debug_assert!(layout.size() > 0, "zero sized allocations are not routed here");
        // SAFETY: non zero size by contract
        NonNull::new(unsafe { alloc::alloc_zeroed(layout) })
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        // SAFETY: by contract
        unsafe { alloc::dealloc(ptr.as_ptr(), layout) };
    }
}

/// Runtime owned payload storage.
/// Not freed on drop, the store gives it back to the allocator it came from.
#[derive(Debug)]
pub struct EmaBuffer {
    ptr: NonNull<u8>,
    capacity: usize,
}

// SAFETY: the buffer is uniquely owned by its record, access goes through the record lock
unsafe impl Send for EmaBuffer {}
// SAFETY: see above
unsafe impl Sync for EmaBuffer {}

pub fn round_capacity(size: usize) -> Option<usize> {
    size.checked_next_multiple_of(EMA_ALIGN)
}

impl EmaBuffer {
    pub fn empty() -> Self {
        Self {
            ptr: NonNull::dangling(),
            capacity: 0,
        }
    }

    /// Exactly `capacity` bytes, zeroed.
    pub fn allocate(allocator: &dyn Allocator, capacity: usize) -> Option<Self> {
        if capacity == 0 {
            return Some(Self::empty());
        }
        let layout = Self::layout(capacity)?;
        let ptr = allocator.allocate(layout)?;
        Some(Self { ptr, capacity })
    }

    /// # Safety
    /// `allocator` must be the one that produced this buffer.
    pub unsafe fn free(self, allocator: &dyn Allocator) {
        if self.capacity == 0 {
            return;
        }
        let Some(layout) = Self::layout(self.capacity) else {
            return;
        };
        // SAFETY: same allocator and layout by contract
        unsafe { allocator.deallocate(self.ptr, layout) };
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    #[inline]
    pub fn as_nonnull(&self) -> NonNull<u8> {
        self.ptr
    }

    /// Zero `range` of the buffer.
    pub fn zero(&mut self, start: usize, end: usize) {
        debug_assert!(start <= end && end <= self.capacity);
        if start == end {
            return;
        }
        // SAFETY: range is inside the allocation
        unsafe { self.ptr.as_ptr().add(start).write_bytes(0, end - start) };
    }

    fn layout(capacity: usize) -> Option<Layout> {
        Layout::from_size_align(capacity, EMA_ALIGN).ok()
    }
}
