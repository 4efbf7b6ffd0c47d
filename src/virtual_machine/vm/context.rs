use crate::virtual_machine::arena::Ref;

/// Largest pop count a frame can record.
pub(crate) const MAX_POP: u8 = 127;

/// Packed call frame stored in a single stack cell.
///
/// Bit 0 is the trust level, bits 1-7 the number of cells popped on return
/// (arguments plus locals), byte 1 the module index and bytes 2-3 the
/// instruction pointer relative to the module image.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Frame(pub u32);

impl Frame {
    pub(crate) const fn new(trusted: bool, pop: u8, module: u8, ip: u16) -> Self {
        Self(
            trusted as u32
                | ((pop as u32 & MAX_POP as u32) << 1)
                | ((module as u32) << 8)
                | ((ip as u32) << 16),
        )
    }

    pub const fn is_trusted(self) -> bool {
        self.0 & 1 != 0
    }

    pub const fn pop(self) -> u8 {
        ((self.0 >> 1) & MAX_POP as u32) as u8
    }

    pub const fn module(self) -> u8 {
        (self.0 >> 8) as u8
    }

    pub const fn ip(self) -> u16 {
        (self.0 >> 16) as u16
    }

    pub(crate) const fn with_ip(self, ip: u16) -> Self {
        Self((self.0 & 0xFFFF) | ((ip as u32) << 16))
    }
}

/// Import slot meaning "the calling module itself".
pub(crate) const SELF_SLOT: u8 = 255;

/// Packed function token: byte 1 is the import slot, bytes 2-3 the
/// descriptor offset inside the target image.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct FuncToken(pub u32);

impl FuncToken {
    pub const fn new(slot: u8, offset: u16) -> Self {
        Self(((slot as u32) << 8) | ((offset as u32) << 16))
    }

    pub const fn slot(self) -> u8 {
        (self.0 >> 8) as u8
    }

    pub const fn offset(self) -> u16 {
        (self.0 >> 16) as u16
    }
}

/// Untagged 4-byte stack cell. The opcode decides how it is read.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Cell(pub u32);

impl Cell {
    pub const fn from_i32(value: i32) -> Self {
        Self(value as u32)
    }

    pub const fn from_f32(value: f32) -> Self {
        Self(value.to_bits())
    }

    pub const fn from_bool(value: bool) -> Self {
        Self(value as u32)
    }

    pub const fn from_ref(value: Ref) -> Self {
        Self(value.0)
    }

    pub const fn i32(self) -> i32 {
        self.0 as i32
    }

    pub const fn u32(self) -> u32 {
        self.0
    }

    pub const fn f32(self) -> f32 {
        f32::from_bits(self.0)
    }

    pub const fn reference(self) -> Ref {
        Ref(self.0)
    }

    pub const fn frame(self) -> Frame {
        Frame(self.0)
    }

    pub const fn ftn(self) -> FuncToken {
        FuncToken(self.0)
    }
}

/// Splits a 64-bit value into its (low, high) cells.
pub(crate) const fn split64(value: u64) -> (Cell, Cell) {
    (Cell(value as u32), Cell((value >> 32) as u32))
}

pub(crate) const fn join64(lo: Cell, hi: Cell) -> u64 {
    lo.0 as u64 | ((hi.0 as u64) << 32)
}

/// Interpreter registers, cached from the VM header while `execute` runs.
#[derive(Clone, Copy, Debug, Default)]
pub(super) struct Regs {
    /// Arena offset of cell 0.
    pub(super) stack: u32,
    /// Capacity in cells.
    pub(super) size: u16,
    pub(super) rp: u16,
    pub(super) sp: u16,
    pub(super) frame: Frame,
}
