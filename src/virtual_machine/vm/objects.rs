//! Objects, arrays and slices.
//!
//! Objects are zeroed heap blocks addressed by a single reference. Arrays
//! are handles of two cells, the reference on top of the element count.
//! Null references are rejected before any bounds check.

use super::interpreter::Flow;
use super::{AllocFlags, Vm};
use super::context::Cell;
use crate::virtual_machine::arena::Ref;
use crate::virtual_machine::errors::VmError;
use crate::virtual_machine::isa::Opcode;

type Result<T> = std::result::Result<T, VmError>;

fn non_null(reference: Ref) -> Result<Ref> {
    if reference.is_null() {
        Err(VmError::NullReference)
    } else {
        Ok(reference)
    }
}

/// Element width of an LDELEM or STELEM opcode.
fn element_size(op: Opcode) -> u16 {
    match op {
        Opcode::LdelemI8 | Opcode::LdelemU8 | Opcode::StelemX8 => 1,
        Opcode::LdelemI16 | Opcode::LdelemU16 | Opcode::StelemX16 => 2,
        Opcode::LdelemX64 | Opcode::StelemX64 => 8,
        _ => 4,
    }
}

impl<'a> Vm<'a> {
    fn address(&self, base: Ref, offset: u32) -> Result<u32> {
        self.mem(base.offset().checked_add(offset))
    }

    /// Reads a field or element, sign- or zero-extended to a cell.
    fn load_value(&self, op: Opcode, at: u32) -> Result<u32> {
        let value = match op {
            Opcode::LdfldI8 | Opcode::LdelemI8 => {
                self.mem(self.arena.load_u8(at))? as i8 as i32 as u32
            }
            Opcode::LdfldU8 | Opcode::LdelemU8 => self.mem(self.arena.load_u8(at))? as u32,
            Opcode::LdfldI16 | Opcode::LdelemI16 => {
                self.mem(self.arena.load_u16(at))? as i16 as i32 as u32
            }
            Opcode::LdfldU16 | Opcode::LdelemU16 => self.mem(self.arena.load_u16(at))? as u32,
            _ => self.mem(self.arena.load_u32(at))?,
        };
        Ok(value)
    }

    fn store_value(&mut self, size: u16, at: u32, value: u32) -> Result<()> {
        let stored = match size {
            1 => self.arena.store_u8(at, value as u8),
            2 => self.arena.store_u16(at, value as u16),
            _ => self.arena.store_u32(at, value),
        };
        self.mem(stored)
    }

    fn load_wide(&self, at: u32) -> Result<u64> {
        self.mem(self.arena.load_u64(at))
    }

    fn store_wide(&mut self, at: u32, value: u64) -> Result<()> {
        let stored = self.arena.store_u64(at, value);
        self.mem(stored)
    }

    /// Validates an array handle at cells `k` (reference) and `k + 1`
    /// (length) against `index`, returning the element address.
    fn element(&self, k: u16, index: i32, size: u16) -> Result<u32> {
        let array = non_null(self.cell(k)?.reference())?;
        let length = self.cell(k + 1)?.i32();
        if index < 0 || index >= length {
            return Err(VmError::IndexOutOfRange { index, length });
        }
        let offset = self.mem((index as u32).checked_mul(size as u32))?;
        self.address(array, offset)
    }

    pub(super) fn object_op(&mut self, op: Opcode, code: &[u8], ip: u16) -> Result<Flow> {
        match op {
            Opcode::Newobj => {
                let size = self.imm_u16(code, ip, 1)?;
                self.room(1)?;
                let object = self.heap_alloc(1, size as u32, 4, AllocFlags::ZERO_MEMORY)?;
                self.push(1)?;
                self.set_cell(0, Cell::from_ref(object))?;
            }
            Opcode::Newarr => {
                let size = self.imm_u16(code, ip, 1)?;
                let length = self.cell(0)?.i32();
                if length < 0 {
                    return Err(VmError::ArgumentInvalid {
                        reason: "array length is negative",
                    });
                }
                self.room(1)?;
                let array =
                    self.heap_alloc(length as u32, size as u32, 4, AllocFlags::ZERO_MEMORY)?;
                self.push(1)?;
                self.set_cell(0, Cell::from_ref(array))?;
            }
            Opcode::Slice1 => {
                let start = self.cell(0)?.i32();
                let array = non_null(self.cell(1)?.reference())?;
                let length = self.cell(2)?.i32();
                if start < 0 || start > length {
                    return Err(VmError::ArgumentInvalid {
                        reason: "slice start outside the array",
                    });
                }
                let base = self.address(array, start as u32)?;
                self.pop(1)?;
                self.set_cell(0, Cell(base))?;
                self.set_cell(1, Cell::from_i32(length - start))?;
            }
            Opcode::Slice2 => {
                let count = self.cell(0)?.i32();
                let start = self.cell(1)?.i32();
                let array = non_null(self.cell(2)?.reference())?;
                let length = self.cell(3)?.i32();
                if start < 0 || start > length || count < 0 || count > length - start {
                    return Err(VmError::ArgumentInvalid {
                        reason: "slice range outside the array",
                    });
                }
                let base = self.address(array, start as u32)?;
                self.pop(2)?;
                self.set_cell(0, Cell(base))?;
                self.set_cell(1, Cell::from_i32(count))?;
            }

            Opcode::LdfldI8
            | Opcode::LdfldU8
            | Opcode::LdfldI16
            | Opcode::LdfldU16
            | Opcode::LdfldX32 => {
                let offset = self.imm_u16(code, ip, 1)?;
                let object = non_null(self.cell(0)?.reference())?;
                let at = self.address(object, offset as u32)?;
                let value = self.load_value(op, at)?;
                self.set_cell(0, Cell(value))?;
            }
            Opcode::LdfldX64 => {
                let offset = self.imm_u16(code, ip, 1)?;
                let object = non_null(self.cell(0)?.reference())?;
                let value = self.load_wide(self.address(object, offset as u32)?)?;
                self.push(1)?;
                self.set_cell2(0, value)?;
            }
            Opcode::Ldflda => {
                let offset = self.imm_u16(code, ip, 1)?;
                let object = non_null(self.cell(0)?.reference())?;
                let at = self.address(object, offset as u32)?;
                self.set_cell(0, Cell(at))?;
            }
            Opcode::StfldX8 | Opcode::StfldX16 | Opcode::StfldX32 => {
                let offset = self.imm_u16(code, ip, 1)?;
                let value = self.cell(0)?.u32();
                let object = non_null(self.cell(1)?.reference())?;
                let at = self.address(object, offset as u32)?;
                let size = match op {
                    Opcode::StfldX8 => 1,
                    Opcode::StfldX16 => 2,
                    _ => 4,
                };
                self.store_value(size, at, value)?;
                self.pop(2)?;
            }
            Opcode::StfldX64 => {
                let offset = self.imm_u16(code, ip, 1)?;
                let value = self.cell2(0)?;
                let object = non_null(self.cell(2)?.reference())?;
                let at = self.address(object, offset as u32)?;
                self.store_wide(at, value)?;
                self.pop(3)?;
            }

            Opcode::LdelemI8
            | Opcode::LdelemU8
            | Opcode::LdelemI16
            | Opcode::LdelemU16
            | Opcode::LdelemX32 => {
                let index = self.cell(0)?.i32();
                let at = self.element(1, index, element_size(op))?;
                let value = self.load_value(op, at)?;
                self.pop(2)?;
                self.set_cell(0, Cell(value))?;
            }
            Opcode::LdelemX64 => {
                let index = self.cell(0)?.i32();
                let at = self.element(1, index, 8)?;
                let value = self.load_wide(at)?;
                self.pop(1)?;
                self.set_cell2(0, value)?;
            }
            Opcode::Ldelema => {
                let size = self.imm_u16(code, ip, 1)?;
                let index = self.cell(0)?.i32();
                let at = self.element(1, index, size)?;
                self.pop(2)?;
                self.set_cell(0, Cell(at))?;
            }
            Opcode::StelemX8 | Opcode::StelemX16 | Opcode::StelemX32 => {
                let value = self.cell(0)?.u32();
                let index = self.cell(1)?.i32();
                let size = element_size(op);
                let at = self.element(2, index, size)?;
                self.store_value(size, at, value)?;
                self.pop(4)?;
            }
            Opcode::StelemX64 => {
                let value = self.cell2(0)?;
                let index = self.cell(2)?.i32();
                let at = self.element(3, index, 8)?;
                self.store_wide(at, value)?;
                self.pop(5)?;
            }

            _ => return Err(self.fault("opcode has no handler")),
        }
        Ok(Flow::Next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn element_widths() {
        assert_eq!(element_size(Opcode::LdelemU8), 1);
        assert_eq!(element_size(Opcode::StelemX16), 2);
        assert_eq!(element_size(Opcode::LdelemX32), 4);
        assert_eq!(element_size(Opcode::StelemX64), 8);
    }

    #[test]
    fn null_is_rejected() {
        assert_eq!(non_null(Ref::NULL), Err(VmError::NullReference));
        assert_eq!(non_null(Ref(64)), Ok(Ref(64)));
    }
}
