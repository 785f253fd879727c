use std::{
    alloc::{self, Layout},
    ptr::NonNull,
};

pub const FOREIGN_ALIGN: usize = 16;

/// Gives captured memory back to its allocator once the last reference is gone.
pub type FreeFn = unsafe fn(ForeignData);

/// A buffer owned outside the value store.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ForeignData {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: the store never dereferences foreign memory on its own, the owner
// decides which thread touches it
unsafe impl Send for ForeignData {}
// SAFETY: see above
unsafe impl Sync for ForeignData {}

impl ForeignData {
    /// # Safety
    /// `ptr` must be valid for reads and writes of `len` bytes for as long as
    /// any record refers to it.
    pub unsafe fn from_raw_parts(ptr: NonNull<u8>, len: usize) -> Self {
        Self { ptr, len }
    }

    /// Allocate a zeroed buffer with the global allocator, the counterpart of
    /// [`free_allocated`].
    pub fn allocate(len: usize) -> Option<Self> {
        if len == 0 {
            return Some(Self {
                ptr: NonNull::dangling(),
                len,
            });
        }
        let layout = Layout::from_size_align(len, FOREIGN_ALIGN).ok()?;
        // SAFETY: layout has a non zero size
        let ptr = NonNull::new(unsafe { alloc::alloc_zeroed(layout) })?;
        Some(Self { ptr, len })
    }

    #[inline]
    pub fn as_ptr(self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    #[inline]
    pub fn as_nonnull(self) -> NonNull<u8> {
        self.ptr
    }

    #[inline]
    pub fn len(self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(self) -> bool {
        self.len == 0
    }

    /// # Safety
    /// the buffer must still be alive and not mutated through another path
    pub unsafe fn as_slice<'a>(self) -> &'a [u8] {
        // SAFETY: by contract
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// # Safety
    /// the buffer must still be alive and not aliased
    pub unsafe fn as_mut_slice<'a>(self) -> &'a mut [u8] {
        // SAFETY: by contract
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

/// Frees a buffer obtained from [`ForeignData::allocate`].
///
/// # Safety
/// `data` must come from [`ForeignData::allocate`] and must not be used afterwards.
pub unsafe fn free_allocated(data: ForeignData) {
    if data.len == 0 {
        return;
    }
    let Ok(layout) = Layout::from_size_align(data.len, FOREIGN_ALIGN) else {
        return;
    };
    // SAFETY: same layout as the allocation by contract
    unsafe { alloc::dealloc(data.ptr.as_ptr(), layout) };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_gives_zeroed_aligned_memory() {
        let data = ForeignData::allocate(100).expect("allocation");
        assert_eq!(data.len(), 100);
        assert_eq!(data.as_ptr() as usize % FOREIGN_ALIGN, 0);
        unsafe {
            assert!(data.as_slice().iter().all(|&b| b == 0));
            data.as_mut_slice()[99] = 7;
            assert_eq!(data.as_slice()[99], 7);
            free_allocated(data);
        }
    }

    #[test]
    fn empty_buffers_never_touch_the_allocator() {
        let data = ForeignData::allocate(0).expect("empty allocation");
        assert!(data.is_empty());
        unsafe {
            assert!(data.as_slice().is_empty());
            free_allocated(data);
        }
    }
}
