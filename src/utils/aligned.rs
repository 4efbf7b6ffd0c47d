//! Word-aligned byte buffers for VM arenas.

use std::ops::{Deref, DerefMut};

/// Heap buffer whose base is 4-byte aligned, as an arena must be.
pub struct AlignedBuffer {
    words: Vec<u32>,
    len: usize,
}

impl AlignedBuffer {
    /// Returns a zeroed buffer of `len` bytes.
    pub fn new(len: usize) -> Self {
        Self {
            words: vec![0u32; len.div_ceil(4)],
            len,
        }
    }
}

impl Deref for AlignedBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: `words` owns at least `len` initialized bytes and u8 has
        // no alignment requirement.
        unsafe { std::slice::from_raw_parts(self.words.as_ptr().cast::<u8>(), self.len) }
    }
}

impl DerefMut for AlignedBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        // SAFETY: as above; the mutable borrow of `self` is exclusive.
        unsafe { std::slice::from_raw_parts_mut(self.words.as_mut_ptr().cast::<u8>(), self.len) }
    }
}
