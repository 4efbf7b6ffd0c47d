//! Relocatable arena and position-independent references.
//!
//! All VM state lives in one caller-supplied byte block. The first
//! [`HEADER_SIZE`] bytes hold the VM header; everything after it is carved out
//! by the bump allocator. Internal pointers are stored as [`Ref`] offsets from
//! the arena base, so the block can be copied elsewhere and reattached.
//!
//! Every multi-byte value in the arena is little-endian. Loads and stores are
//! bounds-checked and return `None` instead of panicking when a reference
//! leaves the block.

use std::fmt;
use std::ops::Range;

/// Size of the VM header at offset 0.
pub const HEADER_SIZE: u32 = 64;
/// First byte of an initialized arena.
pub const MEMORY_MAGIC: u8 = 127;
/// Required alignment of the arena base.
pub const ARENA_ALIGN: usize = 4;

/// Field offsets of the VM header.
pub(crate) mod header {
    pub const MAGIC: u32 = 0;
    pub const VERSION: u32 = 1;
    pub const SYSCALL: u32 = 2;
    pub const HEAP_SIZE: u32 = 4;
    pub const HEAP_USED: u32 = 8;
    pub const APP_NAME: u32 = 12;
    pub const FLAGS: u32 = 24;
    pub const MODULES_CREATED: u32 = 25;
    pub const MODULES_IMPORTED: u32 = 26;
    pub const MODULE_INIT_HEAD: u32 = 27;
    pub const MODULES: u32 = 28;
    pub const STACK: u32 = 32;
    pub const STACK_SIZE: u32 = 36;
    pub const RP: u32 = 38;
    pub const SP: u32 = 40;
    pub const SP_EXPECTED: u32 = 42;
    pub const FRAME: u32 = 44;
    pub const STATE: u32 = 48;
    pub const MODULE_CAPACITY: u32 = 49;
    pub const CONTEXT: u32 = 56;
}

/// Opaque 32-bit offset from the arena base. Offset 0 is the null reference.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct Ref(pub u32);

impl Ref {
    pub const NULL: Ref = Ref(0);

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    pub const fn offset(self) -> u32 {
        self.0
    }

    /// Returns the reference `bytes` further into the arena, or `None` on overflow.
    pub const fn add(self, bytes: u32) -> Option<Ref> {
        match self.0.checked_add(bytes) {
            Some(offset) => Some(Ref(offset)),
            None => None,
        }
    }
}

impl fmt::Display for Ref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{:#x}", self.0)
    }
}

/// Bounds-checked little-endian view over the arena bytes.
pub(crate) struct Arena<'a> {
    bytes: &'a mut [u8],
}

impl<'a> Arena<'a> {
    /// Wraps a buffer whose length has already been validated to fit `u32`
    /// and hold the header.
    pub(crate) fn new(bytes: &'a mut [u8]) -> Self {
        Self { bytes }
    }

    pub(crate) fn len(&self) -> u32 {
        self.bytes.len() as u32
    }

    fn range(&self, at: u32, len: u32) -> Option<Range<usize>> {
        let end = at.checked_add(len)?;
        if end as usize > self.bytes.len() {
            return None;
        }
        Some(at as usize..end as usize)
    }

    pub(crate) fn slice(&self, at: u32, len: u32) -> Option<&[u8]> {
        let range = self.range(at, len)?;
        self.bytes.get(range)
    }

    pub(crate) fn slice_mut(&mut self, at: u32, len: u32) -> Option<&mut [u8]> {
        let range = self.range(at, len)?;
        self.bytes.get_mut(range)
    }

    fn load<const N: usize>(&self, at: u32) -> Option<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.slice(at, N as u32)?);
        Some(out)
    }

    fn store<const N: usize>(&mut self, at: u32, value: [u8; N]) -> Option<()> {
        self.slice_mut(at, N as u32)?.copy_from_slice(&value);
        Some(())
    }

    pub(crate) fn load_u8(&self, at: u32) -> Option<u8> {
        self.bytes.get(at as usize).copied()
    }

    pub(crate) fn load_u16(&self, at: u32) -> Option<u16> {
        self.load(at).map(u16::from_le_bytes)
    }

    pub(crate) fn load_u32(&self, at: u32) -> Option<u32> {
        self.load(at).map(u32::from_le_bytes)
    }

    pub(crate) fn load_u64(&self, at: u32) -> Option<u64> {
        self.load(at).map(u64::from_le_bytes)
    }

    pub(crate) fn store_u8(&mut self, at: u32, value: u8) -> Option<()> {
        *self.bytes.get_mut(at as usize)? = value;
        Some(())
    }

    pub(crate) fn store_u16(&mut self, at: u32, value: u16) -> Option<()> {
        self.store(at, value.to_le_bytes())
    }

    pub(crate) fn store_u32(&mut self, at: u32, value: u32) -> Option<()> {
        self.store(at, value.to_le_bytes())
    }

    pub(crate) fn store_u64(&mut self, at: u32, value: u64) -> Option<()> {
        self.store(at, value.to_le_bytes())
    }

    pub(crate) fn fill(&mut self, at: u32, len: u32, value: u8) -> Option<()> {
        self.slice_mut(at, len)?.fill(value);
        Some(())
    }

    // Header fields always lie inside the arena: `Vm::initialize` and
    // `Vm::reattach` reject buffers shorter than the header.

    pub(crate) fn hdr_u8(&self, field: u32) -> u8 {
        self.load_u8(field).unwrap_or(0)
    }

    pub(crate) fn hdr_u16(&self, field: u32) -> u16 {
        self.load_u16(field).unwrap_or(0)
    }

    pub(crate) fn hdr_u32(&self, field: u32) -> u32 {
        self.load_u32(field).unwrap_or(0)
    }

    pub(crate) fn hdr_u64(&self, field: u32) -> u64 {
        self.load_u64(field).unwrap_or(0)
    }

    pub(crate) fn set_hdr_u8(&mut self, field: u32, value: u8) {
        let _ = self.store_u8(field, value);
    }

    pub(crate) fn set_hdr_u16(&mut self, field: u32, value: u16) {
        let _ = self.store_u16(field, value);
    }

    pub(crate) fn set_hdr_u32(&mut self, field: u32, value: u32) {
        let _ = self.store_u32(field, value);
    }

    pub(crate) fn set_hdr_u64(&mut self, field: u32, value: u64) {
        let _ = self.store_u64(field, value);
    }
}
