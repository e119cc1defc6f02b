use std::{
    alloc::{alloc_zeroed, dealloc, handle_alloc_error, Layout},
    mem::align_of,
    ops::{Deref, DerefMut},
    ptr::NonNull,
    slice::{from_raw_parts, from_raw_parts_mut},
};

/// Zero-initialized host memory with the alignment of the widest scalar a
/// kernel may read from it.
pub struct Blob {
    ptr: NonNull<u8>,
    len: usize,
}

impl Blob {
    pub fn new(size: usize) -> Self {
        if size == 0 {
            return Self {
                ptr: NonNull::<u64>::dangling().cast(),
                len: 0,
            };
        }
        let layout = layout(size);
        let ptr = unsafe { alloc_zeroed(layout) };
        match NonNull::new(ptr) {
            Some(ptr) => Self { ptr, len: size },
            None => handle_alloc_error(layout),
        }
    }
}

impl Drop for Blob {
    #[inline]
    fn drop(&mut self) {
        let &mut Blob { ptr, len } = self;
        if len > 0 {
            unsafe { dealloc(ptr.as_ptr(), layout(len)) }
        }
    }
}

#[inline(always)]
const fn layout(size: usize) -> Layout {
    unsafe { Layout::from_size_align_unchecked(size, align_of::<u64>()) }
}

impl Deref for Blob {
    type Target = [u8];
    #[inline]
    fn deref(&self) -> &[u8] {
        unsafe { from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl DerefMut for Blob {
    #[inline]
    fn deref_mut(&mut self) -> &mut [u8] {
        unsafe { from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

#[test]
fn test_zeroed() {
    let blob = Blob::new(100);
    assert_eq!(blob.len(), 100);
    assert!(blob.iter().all(|&b| b == 0));
    assert_eq!(blob.as_ptr() as usize % align_of::<u64>(), 0);
    assert!(Blob::new(0).is_empty());
}
