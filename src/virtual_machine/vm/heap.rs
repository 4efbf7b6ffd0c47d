use super::{AllocFlags, Vm};
use crate::debug;
use crate::virtual_machine::arena::{Ref, header};
use crate::virtual_machine::errors::VmError;

impl<'a> Vm<'a> {
    /// Carves a permanent block of `count * size` bytes out of the arena.
    ///
    /// The bump cursor is rounded up to `alignment` (1, 2 or 4) first. Blocks
    /// are never freed.
    pub fn heap_alloc(
        &mut self,
        count: u32,
        size: u32,
        alignment: u32,
        flags: AllocFlags,
    ) -> Result<Ref, VmError> {
        if !matches!(alignment, 1 | 2 | 4) {
            return Err(VmError::ArgumentInvalid {
                reason: "alignment must be 1, 2 or 4",
            });
        }

        let used = self.arena.hdr_u32(header::HEAP_USED);
        let heap_size = self.arena.hdr_u32(header::HEAP_SIZE);
        let out_of_memory = VmError::OutOfMemory {
            requested: count as u64 * size as u64,
            available: heap_size.saturating_sub(used),
        };

        let total = count.checked_mul(size).ok_or(out_of_memory.clone())?;
        let offset = used
            .checked_add(alignment - 1)
            .ok_or(out_of_memory.clone())?
            & !(alignment - 1);
        let available = heap_size.checked_sub(offset).ok_or(out_of_memory.clone())?;
        if total > available {
            return Err(out_of_memory);
        }

        self.arena.set_hdr_u32(header::HEAP_USED, offset + total);
        if flags.contains(AllocFlags::ZERO_MEMORY) {
            let _ = self.arena.fill(offset, total, 0);
        }
        debug!("heap: allocated {total} bytes at {:#x}", offset);
        Ok(Ref(offset))
    }

    /// Total arena length in bytes.
    pub fn heap_size(&self) -> u32 {
        self.arena.hdr_u32(header::HEAP_SIZE)
    }

    /// Bytes left behind the bump cursor.
    pub fn heap_available(&self) -> u32 {
        self.heap_size()
            .saturating_sub(self.arena.hdr_u32(header::HEAP_USED))
    }
}

#[cfg(test)]
mod tests {
    use crate::utils::test_utils::utils::aligned_buffer;
    use crate::virtual_machine::arena::HEADER_SIZE;
    use crate::virtual_machine::errors::VmError;
    use crate::virtual_machine::vm::{AllocFlags, Vm};

    #[test]
    fn rejects_bad_alignment() {
        let mut buf = aligned_buffer(256);
        let mut vm = Vm::initialize(&mut buf, 0, 0).unwrap();
        for alignment in [0, 3, 8] {
            assert!(matches!(
                vm.heap_alloc(1, 4, alignment, AllocFlags::NONE),
                Err(VmError::ArgumentInvalid { .. })
            ));
        }
    }

    #[test]
    fn size_overflow_is_out_of_memory() {
        let mut buf = aligned_buffer(256);
        let mut vm = Vm::initialize(&mut buf, 0, 0).unwrap();
        assert!(matches!(
            vm.heap_alloc(u32::MAX, 2, 1, AllocFlags::NONE),
            Err(VmError::OutOfMemory { .. })
        ));
        assert!(matches!(
            vm.heap_alloc(1, 256, 1, AllocFlags::NONE),
            Err(VmError::OutOfMemory { .. })
        ));
        assert_eq!(vm.heap_available(), 256 - HEADER_SIZE);
    }

    #[test]
    fn blocks_are_disjoint_and_aligned() {
        let mut buf = aligned_buffer(256);
        let mut vm = Vm::initialize(&mut buf, 0, 0).unwrap();
        let a = vm.heap_alloc(3, 1, 1, AllocFlags::NONE).unwrap();
        let b = vm.heap_alloc(1, 2, 2, AllocFlags::NONE).unwrap();
        let c = vm.heap_alloc(2, 4, 4, AllocFlags::NONE).unwrap();
        assert_eq!(a.offset(), HEADER_SIZE);
        assert_eq!(b.offset() % 2, 0);
        assert!(b.offset() >= a.offset() + 3);
        assert_eq!(c.offset() % 4, 0);
        assert!(c.offset() >= b.offset() + 2);
        assert_eq!(vm.heap_available(), 256 - (c.offset() + 8));
    }

    #[test]
    fn exact_fit_then_exhausted() {
        let mut buf = aligned_buffer(128);
        let mut vm = Vm::initialize(&mut buf, 0, 0).unwrap();
        let rest = vm.heap_available();
        assert!(vm.heap_alloc(1, rest, 4, AllocFlags::NONE).is_ok());
        assert_eq!(vm.heap_available(), 0);
        assert!(matches!(
            vm.heap_alloc(1, 1, 1, AllocFlags::NONE),
            Err(VmError::OutOfMemory { .. })
        ));
        assert!(vm.heap_alloc(0, 1, 1, AllocFlags::NONE).is_ok());
    }

    #[test]
    fn zero_memory_flag_clears_the_block() {
        let mut buf = aligned_buffer(256);
        buf.fill(0xAB);
        let mut vm = Vm::initialize(&mut buf, 0, 0).unwrap();
        let dirty = vm.heap_alloc(1, 8, 4, AllocFlags::NONE).unwrap();
        assert!(vm.resolve(dirty, 8).unwrap().iter().all(|b| *b == 0xAB));
        let clean = vm.heap_alloc(1, 8, 4, AllocFlags::ZERO_MEMORY).unwrap();
        assert!(vm.resolve(clean, 8).unwrap().iter().all(|b| *b == 0));
    }
}
