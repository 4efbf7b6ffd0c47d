//! Fetch-decode-execute loop.
//!
//! Registers are loaded from the header when a run starts and written back on
//! every exit, so the header is authoritative whenever the host holds
//! control. Stack offsets in this module are relative to the operand top:
//! `cell(0)` is the top cell, `cell(1)` the one below it.

use super::Vm;
use super::context::{Cell, Frame, FuncToken, MAX_POP, Regs, SELF_SLOT, join64, split64};
use crate::{debug, trace};
use crate::virtual_machine::arena::{Ref, header};
use crate::virtual_machine::errors::VmError;
use crate::virtual_machine::image::FuncDef;
use crate::virtual_machine::isa::Opcode;

const CELL: u32 = 4;

/// Why a run stopped without faulting.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(super) enum Exit {
    Halt,
    Yield,
}

/// What to do after an instruction.
pub(super) enum Flow {
    /// Fall through to the next instruction.
    Next,
    /// Continue at an offset in the current module.
    Jump(u16),
    /// The instruction installed a new frame.
    Transfer,
    Halt,
    Yield,
}

impl<'a> Vm<'a> {
    fn load_regs(&mut self) {
        self.regs = Regs {
            stack: self.arena.hdr_u32(header::STACK),
            size: self.arena.hdr_u16(header::STACK_SIZE),
            rp: self.arena.hdr_u16(header::RP),
            sp: self.arena.hdr_u16(header::SP),
            frame: Frame(self.arena.hdr_u32(header::FRAME)),
        };
    }

    fn store_regs(&mut self) {
        self.arena.set_hdr_u16(header::RP, self.regs.rp);
        self.arena.set_hdr_u16(header::SP, self.regs.sp);
        self.arena.set_hdr_u32(header::FRAME, self.regs.frame.0);
    }

    /// Invalid-program fault at the current instruction.
    pub(super) fn fault(&self, reason: &'static str) -> VmError {
        VmError::InvalidProgram {
            module: self.regs.frame.module(),
            ip: self.regs.frame.ip(),
            reason,
        }
    }

    pub(super) fn mem<T>(&self, value: Option<T>) -> Result<T, VmError> {
        value.ok_or_else(|| self.fault("reference lies outside the arena"))
    }

    // ==================== Cells ====================

    fn slot(&self, index: u32) -> Result<u32, VmError> {
        if index >= self.regs.size as u32 {
            return Err(VmError::StackImbalance {
                expected: self.regs.size,
                actual: self.regs.sp,
            });
        }
        Ok(self.regs.stack + index * CELL)
    }

    fn load_cell(&self, index: u32) -> Result<Cell, VmError> {
        let at = self.slot(index)?;
        self.mem(self.arena.load_u32(at)).map(Cell)
    }

    fn store_cell(&mut self, index: u32, value: Cell) -> Result<(), VmError> {
        let at = self.slot(index)?;
        let stored = self.arena.store_u32(at, value.0);
        self.mem(stored)
    }

    pub(super) fn cell(&self, k: u16) -> Result<Cell, VmError> {
        self.load_cell(self.regs.sp as u32 + k as u32)
    }

    pub(super) fn set_cell(&mut self, k: u16, value: Cell) -> Result<(), VmError> {
        self.store_cell(self.regs.sp as u32 + k as u32, value)
    }

    /// Two-cell value with its low word at `k`.
    pub(super) fn cell2(&self, k: u16) -> Result<u64, VmError> {
        Ok(join64(self.cell(k)?, self.cell(k + 1)?))
    }

    pub(super) fn set_cell2(&mut self, k: u16, value: u64) -> Result<(), VmError> {
        let (lo, hi) = split64(value);
        self.set_cell(k, lo)?;
        self.set_cell(k + 1, hi)
    }

    pub(super) fn room(&self, n: u16) -> Result<(), VmError> {
        let available = self.regs.sp.saturating_sub(self.regs.rp);
        if available < n {
            return Err(VmError::StackOverflow {
                needed: n as u32,
                available: available as u32,
            });
        }
        Ok(())
    }

    pub(super) fn push(&mut self, n: u16) -> Result<(), VmError> {
        self.room(n)?;
        self.regs.sp -= n;
        Ok(())
    }

    pub(super) fn pop(&mut self, n: u16) -> Result<(), VmError> {
        let sp = self.regs.sp as u32 + n as u32;
        if sp > self.regs.size as u32 {
            return Err(VmError::StackImbalance {
                expected: self.regs.size,
                actual: self.regs.sp,
            });
        }
        self.regs.sp = sp as u16;
        Ok(())
    }

    fn push_frame(&mut self, frame: Frame) -> Result<(), VmError> {
        self.room(1)?;
        self.store_cell(self.regs.rp as u32, Cell(frame.0))?;
        self.regs.rp += 1;
        Ok(())
    }

    // ==================== Immediates ====================

    fn imm<const N: usize>(&self, code: &[u8], ip: u16, at: usize) -> Result<[u8; N], VmError> {
        let start = ip as usize + at;
        code.get(start..start + N)
            .and_then(|bytes| bytes.try_into().ok())
            .ok_or_else(|| self.fault("operand runs past the end of the image"))
    }

    pub(super) fn imm_u8(&self, code: &[u8], ip: u16, at: usize) -> Result<u8, VmError> {
        self.imm::<1>(code, ip, at).map(|b| b[0])
    }

    fn imm_i8(&self, code: &[u8], ip: u16, at: usize) -> Result<i8, VmError> {
        self.imm_u8(code, ip, at).map(|b| b as i8)
    }

    pub(super) fn imm_u16(&self, code: &[u8], ip: u16, at: usize) -> Result<u16, VmError> {
        self.imm(code, ip, at).map(u16::from_le_bytes)
    }

    fn imm_u32(&self, code: &[u8], ip: u16, at: usize) -> Result<u32, VmError> {
        self.imm(code, ip, at).map(u32::from_le_bytes)
    }

    // ==================== Driver ====================

    /// Runs from the saved frame until HALT, a syscall or a fault.
    pub(super) fn resume(&mut self) -> Result<Exit, VmError> {
        self.load_regs();
        let result = self.run();
        self.store_regs();
        if result != Ok(Exit::Yield) {
            self.arena.set_hdr_u16(header::SP_EXPECTED, self.regs.sp);
            self.arena.set_hdr_u16(header::SYSCALL, 0);
        }
        result
    }

    fn run(&mut self) -> Result<Exit, VmError> {
        loop {
            let frame = self.regs.frame;
            let code = self.image(frame.module())?;
            let ip = frame.ip();

            let byte = code
                .get(ip as usize)
                .copied()
                .ok_or_else(|| self.fault("instruction pointer past the end of the image"))?;
            let op = Opcode::from_u8(byte)
                .filter(Opcode::is_supported)
                .ok_or_else(|| self.fault("undefined or unsupported opcode"))?;
            trace!(
                "{}:{:04x} {:<16} sp={} rp={}",
                frame.module(),
                ip,
                op.mnemonic(),
                self.regs.sp,
                self.regs.rp
            );

            match self.step(op, code, ip)? {
                Flow::Next => {
                    let next = ip
                        .checked_add(op.size())
                        .ok_or_else(|| self.fault("instruction pointer past the end of the image"))?;
                    self.regs.frame = frame.with_ip(next);
                }
                Flow::Jump(target) => self.regs.frame = frame.with_ip(target),
                Flow::Transfer => {}
                Flow::Halt => return Ok(Exit::Halt),
                Flow::Yield => return Ok(Exit::Yield),
            }
        }
    }

    fn step(&mut self, op: Opcode, code: &'a [u8], ip: u16) -> Result<Flow, VmError> {
        match op {
            // ==================== Basic ====================
            Opcode::Halt => {
                if self.regs.sp != self.regs.size {
                    return Err(VmError::StackImbalance {
                        expected: self.regs.size,
                        actual: self.regs.sp,
                    });
                }
                Ok(Flow::Halt)
            }
            Opcode::Nop => Ok(Flow::Next),
            Opcode::Break => {
                self.regs.frame = self.regs.frame.with_ip(ip + 1);
                Err(VmError::Breakpoint)
            }
            Opcode::PopX32 => {
                self.pop(1)?;
                Ok(Flow::Next)
            }
            Opcode::PopX64 => {
                self.pop(2)?;
                Ok(Flow::Next)
            }
            Opcode::DupX32 => {
                let value = self.cell(0)?;
                self.push(1)?;
                self.set_cell(0, value)?;
                Ok(Flow::Next)
            }
            Opcode::DupX64 => {
                let value = self.cell2(0)?;
                self.push(2)?;
                self.set_cell2(0, value)?;
                Ok(Flow::Next)
            }
            Opcode::Swap => {
                let (a, b) = (self.cell(0)?, self.cell(1)?);
                self.set_cell(0, b)?;
                self.set_cell(1, a)?;
                Ok(Flow::Next)
            }
            Opcode::Over => {
                let value = self.cell(1)?;
                self.push(1)?;
                self.set_cell(0, value)?;
                Ok(Flow::Next)
            }
            Opcode::Rot => {
                let (a, b, c) = (self.cell(0)?, self.cell(1)?, self.cell(2)?);
                self.set_cell(0, b)?;
                self.set_cell(1, c)?;
                self.set_cell(2, a)?;
                Ok(Flow::Next)
            }
            Opcode::Nip => {
                let value = self.cell(0)?;
                self.set_cell(1, value)?;
                self.pop(1)?;
                Ok(Flow::Next)
            }
            Opcode::Tuck => {
                let (a, b) = (self.cell(0)?, self.cell(1)?);
                self.push(1)?;
                self.set_cell(0, a)?;
                self.set_cell(1, b)?;
                self.set_cell(2, a)?;
                Ok(Flow::Next)
            }

            // ==================== Locals ====================
            Opcode::LdlocX32 => {
                let index = self.imm_u8(code, ip, 1)? as u16;
                let value = self.cell(index)?;
                self.push(1)?;
                self.set_cell(0, value)?;
                Ok(Flow::Next)
            }
            Opcode::LdlocX64 => {
                let index = self.imm_u8(code, ip, 1)? as u16;
                let value = self.cell2(index)?;
                self.push(2)?;
                self.set_cell2(0, value)?;
                Ok(Flow::Next)
            }
            Opcode::Ldloca => {
                let index = self.imm_u8(code, ip, 1)? as u32;
                let address = self.slot(self.regs.sp as u32 + index)?;
                self.push(1)?;
                self.set_cell(0, Cell::from_ref(Ref(address)))?;
                Ok(Flow::Next)
            }
            Opcode::StlocX32 => {
                let index = self.imm_u8(code, ip, 1)? as u16;
                let value = self.cell(0)?;
                self.set_cell(index, value)?;
                self.pop(1)?;
                Ok(Flow::Next)
            }
            Opcode::StlocX64 => {
                let index = self.imm_u8(code, ip, 1)? as u16;
                let value = self.cell2(0)?;
                self.set_cell2(index, value)?;
                self.pop(2)?;
                Ok(Flow::Next)
            }

            // ==================== Calls ====================
            Opcode::Ret | Opcode::RetX32 | Opcode::RetX64 => self.ret(op),
            Opcode::Call => {
                let token = FuncToken::new(self.imm_u8(code, ip, 1)?, self.imm_u16(code, ip, 2)?);
                self.call(op, token, code, ip)
            }
            Opcode::Calli => {
                let token = self.cell(0)?.ftn();
                self.call(op, token, code, ip)
            }
            Opcode::Syscall => self.syscall_op(code, ip),

            // ==================== Branches ====================
            Opcode::BrS => {
                let offset = self.imm_i8(code, ip, 1)? as i32;
                self.branch(ip, op, offset)
            }
            Opcode::BrfalseS | Opcode::BrtrueS => {
                let offset = self.imm_i8(code, ip, 1)? as i32;
                self.branch_if(op, ip, offset)
            }
            Opcode::Br => {
                let offset = self.imm_u16(code, ip, 1)? as i16 as i32;
                self.branch(ip, op, offset)
            }
            Opcode::Brfalse | Opcode::Brtrue => {
                let offset = self.imm_u16(code, ip, 1)? as i16 as i32;
                self.branch_if(op, ip, offset)
            }

            // ==================== Constants ====================
            Opcode::LdcI32M1
            | Opcode::LdcI32_0
            | Opcode::LdcI32_1
            | Opcode::LdcI32_2
            | Opcode::LdcI32_3
            | Opcode::LdcI32_4
            | Opcode::LdcI32_5
            | Opcode::LdcI32_6
            | Opcode::LdcI32_7
            | Opcode::LdcI32_8 => {
                let value = op as u8 as i32 - Opcode::LdcI32_0 as u8 as i32;
                self.push(1)?;
                self.set_cell(0, Cell::from_i32(value))?;
                Ok(Flow::Next)
            }
            Opcode::LdcI32S => {
                let value = self.imm_i8(code, ip, 1)? as i32;
                self.push(1)?;
                self.set_cell(0, Cell::from_i32(value))?;
                Ok(Flow::Next)
            }
            Opcode::LdcX32 => {
                let value = self.imm_u32(code, ip, 1)?;
                self.push(1)?;
                self.set_cell(0, Cell(value))?;
                Ok(Flow::Next)
            }
            Opcode::LdcX64 => {
                let lo = self.imm_u32(code, ip, 1)?;
                let hi = self.imm_u32(code, ip, 5)?;
                self.push(2)?;
                self.set_cell(0, Cell(lo))?;
                self.set_cell(1, Cell(hi))?;
                Ok(Flow::Next)
            }
            Opcode::Ldftn => {
                let token = FuncToken::new(self.imm_u8(code, ip, 1)?, self.imm_u16(code, ip, 2)?);
                self.push(1)?;
                self.set_cell(0, Cell(token.0))?;
                Ok(Flow::Next)
            }

            // ==================== Object model ====================
            Opcode::Newobj
            | Opcode::Newarr
            | Opcode::Slice1
            | Opcode::Slice2
            | Opcode::LdfldI8
            | Opcode::LdfldU8
            | Opcode::LdfldI16
            | Opcode::LdfldU16
            | Opcode::LdfldX32
            | Opcode::LdfldX64
            | Opcode::Ldflda
            | Opcode::StfldX8
            | Opcode::StfldX16
            | Opcode::StfldX32
            | Opcode::StfldX64
            | Opcode::LdelemI8
            | Opcode::LdelemU8
            | Opcode::LdelemI16
            | Opcode::LdelemU16
            | Opcode::LdelemX32
            | Opcode::LdelemX64
            | Opcode::Ldelema
            | Opcode::StelemX8
            | Opcode::StelemX16
            | Opcode::StelemX32
            | Opcode::StelemX64 => self.object_op(op, code, ip),

            // ==================== Numeric families ====================
            _ => self.numeric_op(op),
        }
    }

    fn branch(&self, ip: u16, op: Opcode, offset: i32) -> Result<Flow, VmError> {
        let target = ip as i32 + op.size() as i32 + offset;
        u16::try_from(target)
            .map(Flow::Jump)
            .map_err(|_| self.fault("branch target outside the image"))
    }

    fn branch_if(&mut self, op: Opcode, ip: u16, offset: i32) -> Result<Flow, VmError> {
        let value = self.cell(0)?.i32();
        self.pop(1)?;
        let taken = match op {
            Opcode::BrtrueS | Opcode::Brtrue => value != 0,
            _ => value == 0,
        };
        if taken {
            self.branch(ip, op, offset)
        } else {
            Ok(Flow::Next)
        }
    }

    // ==================== Frames ====================

    /// Validates the callee and builds its frame without touching the stack.
    fn callee_frame(&self, trusted: bool, f: &FuncDef, module: u8) -> Result<Frame, VmError> {
        let needed = 1 + f.loc_count as u32 + f.max_stack as u32;
        let available = self.regs.sp.saturating_sub(self.regs.rp) as u32;
        if available < needed {
            return Err(VmError::StackOverflow { needed, available });
        }
        let pop = f.arg_count as u32 + f.loc_count as u32;
        if pop > MAX_POP as u32 {
            return Err(self.fault("function declares more than 127 argument and local cells"));
        }
        Ok(Frame::new(trusted, pop as u8, module, f.code))
    }

    fn call(&mut self, op: Opcode, token: FuncToken, code: &[u8], ip: u16) -> Result<Flow, VmError> {
        let caller = self.regs.frame;
        let module = if token.slot() == SELF_SLOT {
            caller.module()
        } else {
            self.import_of(caller.module(), token.slot())?
                .ok_or_else(|| self.fault("import slot out of range"))?
        };
        let f = FuncDef::read(self.image(module)?, token.offset())
            .ok_or_else(|| self.fault("function descriptor outside the image"))?;
        let trusted = self.check_trust(caller.is_trusted(), &f, module)?;
        let frame = self.callee_frame(trusted, &f, module)?;

        if op == Opcode::Calli {
            self.pop(1)?;
        }
        let next = ip + op.size();
        let tail_call = caller.pop() == 0 && code.get(next as usize) == Some(&(Opcode::Ret as u8));
        if !tail_call {
            self.push_frame(caller.with_ip(next))?;
        }

        self.regs.frame = frame;
        self.push(f.loc_count as u16)?;
        Ok(Flow::Transfer)
    }

    fn ret(&mut self, op: Opcode) -> Result<Flow, VmError> {
        let frame = self.regs.frame;
        let pop = frame.pop() as u16;
        match op {
            Opcode::RetX64 => {
                let value = self.cell2(0)?;
                self.set_cell2(pop, value)?;
            }
            Opcode::RetX32 => {
                let value = self.cell(0)?;
                self.set_cell(pop, value)?;
            }
            _ => {}
        }
        self.pop(pop)?;

        if self.regs.rp == 0 {
            return Err(self.fault("return with an empty return stack"));
        }
        self.regs.rp -= 1;
        let saved = self.load_cell(self.regs.rp as u32)?.frame();
        if frame.is_trusted() && !saved.is_trusted() {
            debug!("leaving full trust in module {}", frame.module());
        }
        self.regs.frame = saved;
        Ok(Flow::Transfer)
    }

    fn syscall_op(&mut self, code: &[u8], ip: u16) -> Result<Flow, VmError> {
        let frame = self.regs.frame;
        if !frame.is_trusted() {
            return Err(VmError::SecurityViolation {
                module: frame.module(),
                ip,
            });
        }
        let adjustment = self.imm_i8(code, ip, 1)? as i32;
        let syscall = self.imm_u16(code, ip, 2)?;
        let expected = self.regs.sp as i32 + adjustment;
        if expected < self.regs.rp as i32 || expected > self.regs.size as i32 {
            return Err(self.fault("syscall adjustment leaves the operand stack"));
        }

        self.arena.set_hdr_u16(header::SP_EXPECTED, expected as u16);
        self.arena.set_hdr_u16(header::SYSCALL, syscall);
        self.regs.frame = frame.with_ip(ip + Opcode::Syscall.size());
        debug!("syscall {syscall}, expecting sp={expected}");
        Ok(Flow::Yield)
    }

    /// Pushes a call to `offset` in `module` on top of the saved frame, as if
    /// the saved frame had called it.
    pub(super) fn enter(&mut self, module: u8, offset: u16) -> Result<(), VmError> {
        self.load_regs();
        let result = self.enter_frame(module, offset);
        self.store_regs();
        result
    }

    fn enter_frame(&mut self, module: u8, offset: u16) -> Result<(), VmError> {
        let caller = self.regs.frame;
        let f = FuncDef::read(self.image(module)?, offset)
            .ok_or_else(|| self.fault("entry point outside the image"))?;
        let trusted = self.check_trust(caller.is_trusted(), &f, module)?;
        let frame = self.callee_frame(trusted, &f, module)?;
        self.push_frame(caller)?;
        self.regs.frame = frame;
        self.push(f.loc_count as u16)
    }
}
