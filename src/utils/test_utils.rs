//! Test utilities for VM testing.

#[cfg(test)]
pub mod utils {
    use crate::utils::aligned::AlignedBuffer;

    /// Returns a zeroed, aligned arena buffer of `len` bytes.
    pub fn aligned_buffer(len: usize) -> AlignedBuffer {
        AlignedBuffer::new(len)
    }
}
