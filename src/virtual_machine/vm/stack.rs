//! Host-side stack management.
//!
//! The stack is one cell array: the return region grows up from cell 0
//! (`rp`), the operand region grows down from the capacity (`sp`). Hosts use
//! the operations below to pass syscall arguments and results.

use super::{AllocFlags, Vm};
use crate::virtual_machine::arena::{Ref, header};
use crate::virtual_machine::errors::VmError;

const CELL: u32 = 4;
const MAX_CELLS: u32 = u16::MAX as u32;
const OUTSIDE: VmError = VmError::InvalidOperation {
    reason: "stack lies outside the arena",
};

fn cells_for(bytes: u32) -> Result<u16, VmError> {
    if bytes > MAX_CELLS * CELL {
        return Err(VmError::ArgumentInvalid {
            reason: "stack request exceeds 65535 cells",
        });
    }
    Ok(bytes.div_ceil(CELL) as u16)
}

impl<'a> Vm<'a> {
    pub(super) fn stack_base(&self) -> Ref {
        Ref(self.arena.hdr_u32(header::STACK))
    }

    /// Allocates the cell array. `bytes` must be a multiple of the cell size.
    pub fn stack_create(&mut self, bytes: u32) -> Result<(), VmError> {
        if bytes > MAX_CELLS * CELL || bytes % CELL != 0 {
            return Err(VmError::ArgumentInvalid {
                reason: "stack size must be a multiple of 4 bytes and at most 65535 cells",
            });
        }
        if !self.stack_base().is_null() {
            return Err(VmError::InvalidOperation {
                reason: "stack already created",
            });
        }

        let stack = self.heap_alloc(1, bytes, CELL, AllocFlags::NONE)?;
        let count = (bytes / CELL) as u16;
        self.arena.set_hdr_u32(header::STACK, stack.offset());
        self.arena.set_hdr_u16(header::STACK_SIZE, count);
        self.arena.set_hdr_u16(header::RP, 0);
        self.arena.set_hdr_u16(header::SP, count);
        self.arena.set_hdr_u16(header::SP_EXPECTED, count);
        Ok(())
    }

    /// Reserves `bytes` (rounded up to whole cells) on the operand stack.
    ///
    /// Fails without moving the cursors when the space between the return
    /// and operand regions is too small.
    pub fn stack_alloc(&mut self, bytes: u32, flags: AllocFlags) -> Result<Ref, VmError> {
        let count = cells_for(bytes)?;
        let stack = self.stack_base();
        if stack.is_null() {
            return Err(VmError::InvalidOperation {
                reason: "stack not created",
            });
        }

        let sp = self.arena.hdr_u16(header::SP);
        let rp = self.arena.hdr_u16(header::RP);
        let available = sp.saturating_sub(rp);
        if available < count {
            return Err(VmError::StackOverflow {
                needed: count as u32,
                available: available as u32,
            });
        }

        let sp = sp - count;
        self.arena.set_hdr_u16(header::SP, sp);
        let block = stack.offset() + sp as u32 * CELL;
        if flags.contains(AllocFlags::ZERO_MEMORY) {
            self.arena.fill(block, count as u32 * CELL, 0).ok_or(OUTSIDE)?;
        }
        Ok(Ref(block))
    }

    /// Releases `bytes` (rounded up to whole cells) from the operand stack.
    pub fn stack_free(&mut self, bytes: u32) -> Result<(), VmError> {
        let count = cells_for(bytes)?;
        if self.stack_base().is_null() {
            return Err(VmError::InvalidOperation {
                reason: "stack not created",
            });
        }

        let sp = self.arena.hdr_u16(header::SP);
        let used = self.stack_size().saturating_sub(sp);
        if used < count {
            return Err(VmError::StackOverflow {
                needed: count as u32,
                available: used as u32,
            });
        }
        self.arena.set_hdr_u16(header::SP, sp + count);
        Ok(())
    }

    /// Reference to the top operand cell, `None` when the operand stack is empty.
    pub fn stack_top(&self) -> Option<Ref> {
        let stack = self.stack_base();
        let sp = self.arena.hdr_u16(header::SP);
        if stack.is_null() || sp == self.stack_size() {
            return None;
        }
        Some(Ref(stack.offset() + sp as u32 * CELL))
    }

    /// Capacity in cells.
    pub fn stack_size(&self) -> u16 {
        self.arena.hdr_u16(header::STACK_SIZE)
    }

    /// Free bytes between the return and operand regions.
    pub fn stack_available(&self) -> u32 {
        if self.stack_base().is_null() {
            return 0;
        }
        let sp = self.arena.hdr_u16(header::SP);
        let rp = self.arena.hdr_u16(header::RP);
        sp.saturating_sub(rp) as u32 * CELL
    }

    /// Current operand cursor, in cells.
    pub fn stack_pointer(&self) -> u16 {
        self.arena.hdr_u16(header::SP)
    }

    fn top_cells(&self, count: u16) -> Result<u32, VmError> {
        let sp = self.arena.hdr_u16(header::SP);
        let size = self.stack_size();
        match self.stack_top() {
            Some(top) if size - sp >= count => Ok(top.offset()),
            _ => Err(VmError::StackImbalance {
                expected: size.saturating_sub(count),
                actual: sp,
            }),
        }
    }

    fn push_raw(&mut self, value: u64, cells: u16) -> Result<(), VmError> {
        let at = self.stack_alloc(cells as u32 * CELL, AllocFlags::NONE)?;
        let stored = self.arena.store_u32(at.offset(), value as u32).and_then(|()| {
            if cells == 2 {
                self.arena.store_u32(at.offset() + CELL, (value >> 32) as u32)
            } else {
                Some(())
            }
        });
        match stored {
            Some(()) => Ok(()),
            None => {
                self.stack_free(cells as u32 * CELL)?;
                Err(OUTSIDE)
            }
        }
    }

    fn pop_raw(&mut self, cells: u16) -> Result<u64, VmError> {
        let at = self.top_cells(cells)?;
        let lo = self.arena.load_u32(at).ok_or(OUTSIDE)? as u64;
        let hi = if cells == 2 {
            self.arena.load_u32(at + CELL).ok_or(OUTSIDE)? as u64
        } else {
            0
        };
        self.stack_free(cells as u32 * CELL)?;
        Ok(lo | (hi << 32))
    }

    pub fn push_i32(&mut self, value: i32) -> Result<(), VmError> {
        self.push_raw(value as u32 as u64, 1)
    }

    pub fn pop_i32(&mut self) -> Result<i32, VmError> {
        Ok(self.pop_raw(1)? as u32 as i32)
    }

    pub fn push_ref(&mut self, value: Ref) -> Result<(), VmError> {
        self.push_raw(value.offset() as u64, 1)
    }

    pub fn pop_ref(&mut self) -> Result<Ref, VmError> {
        Ok(Ref(self.pop_raw(1)? as u32))
    }

    pub fn push_i64(&mut self, value: i64) -> Result<(), VmError> {
        self.push_raw(value as u64, 2)
    }

    pub fn pop_i64(&mut self) -> Result<i64, VmError> {
        Ok(self.pop_raw(2)? as i64)
    }

    pub fn push_f32(&mut self, value: f32) -> Result<(), VmError> {
        self.push_raw(value.to_bits() as u64, 1)
    }

    pub fn pop_f32(&mut self) -> Result<f32, VmError> {
        Ok(f32::from_bits(self.pop_raw(1)? as u32))
    }

    pub fn push_f64(&mut self, value: f64) -> Result<(), VmError> {
        self.push_raw(value.to_bits(), 2)
    }

    pub fn pop_f64(&mut self) -> Result<f64, VmError> {
        Ok(f64::from_bits(self.pop_raw(2)?))
    }
}

#[cfg(test)]
mod tests {
    use crate::utils::test_utils::utils::aligned_buffer;
    use crate::virtual_machine::arena::Ref;
    use crate::virtual_machine::errors::VmError;
    use crate::virtual_machine::vm::{AllocFlags, Vm};

    #[test]
    fn create_validates_size() {
        let mut buf = aligned_buffer(512);
        let mut vm = Vm::initialize(&mut buf, 0, 0).unwrap();
        assert!(matches!(vm.stack_create(6), Err(VmError::ArgumentInvalid { .. })));
        assert!(matches!(
            vm.stack_create(65536 * 4),
            Err(VmError::ArgumentInvalid { .. })
        ));
        assert_eq!(vm.stack_available(), 0);
        assert!(vm.stack_top().is_none());

        vm.stack_create(64).unwrap();
        assert_eq!(vm.stack_size(), 16);
        assert_eq!(vm.stack_available(), 64);
        assert!(matches!(
            vm.stack_create(64),
            Err(VmError::InvalidOperation { .. })
        ));
    }

    #[test]
    fn create_needs_heap_room() {
        let mut buf = aligned_buffer(128);
        let mut vm = Vm::initialize(&mut buf, 0, 0).unwrap();
        assert!(matches!(
            vm.stack_create(128),
            Err(VmError::OutOfMemory { .. })
        ));
    }

    #[test]
    fn alloc_then_free_restores_availability() {
        let mut buf = aligned_buffer(512);
        let mut vm = Vm::initialize(&mut buf, 0, 0).unwrap();
        vm.stack_create(64).unwrap();

        let before = vm.stack_available();
        let block = vm.stack_alloc(5, AllocFlags::ZERO_MEMORY).unwrap();
        assert_eq!(vm.stack_available(), before - 8);
        assert_eq!(vm.stack_top(), Some(block));
        vm.stack_free(5).unwrap();
        assert_eq!(vm.stack_available(), before);
        assert!(vm.stack_top().is_none());
    }

    #[test]
    fn zeroing_covers_the_whole_last_cell() {
        let mut buf = aligned_buffer(512);
        let mut vm = Vm::initialize(&mut buf, 0, 0).unwrap();
        vm.stack_create(16).unwrap();
        vm.push_i64(-1).unwrap();
        vm.stack_free(8).unwrap();

        let block = vm.stack_alloc(5, AllocFlags::ZERO_MEMORY).unwrap();
        assert_eq!(vm.resolve(block, 8).unwrap(), &[0u8; 8]);
    }

    #[test]
    fn over_request_leaves_cursors_alone() {
        let mut buf = aligned_buffer(512);
        let mut vm = Vm::initialize(&mut buf, 0, 0).unwrap();
        vm.stack_create(16).unwrap();
        vm.stack_alloc(8, AllocFlags::NONE).unwrap();

        let sp = vm.stack_pointer();
        assert!(matches!(
            vm.stack_alloc(12, AllocFlags::NONE),
            Err(VmError::StackOverflow { .. })
        ));
        assert_eq!(vm.stack_pointer(), sp);
        assert!(matches!(vm.stack_free(12), Err(VmError::StackOverflow { .. })));
        assert_eq!(vm.stack_pointer(), sp);
    }

    #[test]
    fn typed_push_pop() {
        let mut buf = aligned_buffer(512);
        let mut vm = Vm::initialize(&mut buf, 0, 0).unwrap();
        vm.stack_create(64).unwrap();

        vm.push_i32(-7).unwrap();
        vm.push_i64(i64::MIN + 3).unwrap();
        vm.push_f64(2.5).unwrap();
        vm.push_f32(-0.5).unwrap();
        assert_eq!(vm.stack_available(), 64 - 24);

        assert_eq!(vm.pop_f32().unwrap(), -0.5);
        assert_eq!(vm.pop_f64().unwrap(), 2.5);
        assert_eq!(vm.pop_i64().unwrap(), i64::MIN + 3);
        assert_eq!(vm.pop_i32().unwrap(), -7);
        assert!(matches!(vm.pop_i32(), Err(VmError::StackImbalance { .. })));
    }

    #[test]
    fn references_pass_through_the_stack() {
        let mut buf = aligned_buffer(512);
        let mut vm = Vm::initialize(&mut buf, 0, 0).unwrap();
        vm.stack_create(16).unwrap();
        let block = vm.heap_alloc(1, 8, 4, AllocFlags::ZERO_MEMORY).unwrap();

        vm.push_ref(block).unwrap();
        vm.push_ref(Ref::NULL).unwrap();
        assert_eq!(vm.pop_ref().unwrap(), Ref::NULL);
        assert_eq!(vm.pop_ref().unwrap(), block);
    }

    #[test]
    fn low_word_sits_at_the_lower_cell() {
        let mut buf = aligned_buffer(512);
        let mut vm = Vm::initialize(&mut buf, 0, 0).unwrap();
        vm.stack_create(16).unwrap();
        vm.push_i64(0x1111_2222_3333_4444).unwrap();
        let top = vm.stack_top().unwrap();
        let bytes = vm.resolve(top, 8).unwrap();
        assert_eq!(&bytes[..4], &0x3333_4444u32.to_le_bytes());
        assert_eq!(&bytes[4..], &0x1111_2222u32.to_le_bytes());
    }
}
