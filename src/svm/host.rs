//! Aligned host memory for the emulated path

use std::alloc::{self, Layout};
use std::ptr::NonNull;

/// Zeroed, aligned heap block freed on drop
#[derive(Debug)]
pub struct AlignedBlock {
    ptr: NonNull<u8>,
    layout: Layout,
}

impl AlignedBlock {
    /// `None` on a zero size, a bad alignment, or allocator failure
    pub fn zeroed(size: usize, alignment: usize) -> Option<Self> {
        if size == 0 {
            return None;
        }
        let layout = Layout::from_size_align(size, alignment).ok()?;
        // SAFETY: layout has a non-zero size.
        let ptr = NonNull::new(unsafe { alloc::alloc_zeroed(layout) })?;
        Some(Self { ptr, layout })
    }

    pub fn as_ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    pub fn len(&self) -> usize {
        self.layout.size()
    }

    pub fn is_empty(&self) -> bool {
        self.layout.size() == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the block is live, initialized by alloc_zeroed, and spans
        // `layout.size()` bytes.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.layout.size()) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above, and `&mut self` makes this the only safe view.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.layout.size()) }
    }
}

impl Drop for AlignedBlock {
    fn drop(&mut self) {
        // SAFETY: allocated in `zeroed` with this exact layout.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

/// Round `size` up to a power-of-two `alignment`
pub fn align_up(size: usize, alignment: usize) -> Option<usize> {
    debug_assert!(alignment.is_power_of_two());
    size.checked_add(alignment - 1).map(|s| s & !(alignment - 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(100, 64), Some(128));
        assert_eq!(align_up(128, 64), Some(128));
        assert_eq!(align_up(1, 1), Some(1));
        assert_eq!(align_up(usize::MAX, 64), None);
    }

    #[test]
    fn test_block_is_aligned_and_zeroed() {
        let mut block = AlignedBlock::zeroed(256, 128).expect("should allocate");
        assert_eq!(block.as_ptr().as_ptr() as usize % 128, 0);
        assert!(block.as_slice().iter().all(|b| *b == 0));
        block.as_mut_slice()[3] = 7;
        assert_eq!(block.as_slice()[3], 7);
        assert_eq!(block.len(), 256);
    }

    #[test]
    fn test_block_rejects_bad_requests() {
        assert!(AlignedBlock::zeroed(0, 64).is_none());
        assert!(AlignedBlock::zeroed(64, 3).is_none());
    }
}
