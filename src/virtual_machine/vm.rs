//! Stack-based virtual machine running inside a caller-supplied arena.
//!
//! A [`Vm`] borrows one byte block for its whole lifetime and never touches
//! the OS heap. The host drives it through a fixed protocol:
//!
//! ```text
//! initialize -> module_import (startup) -> module_import (each missing) ->
//! execute -> [syscall: pop args, push results] -> execute -> ... -> Completed
//! ```
//!
//! Module images stay owned by the host and are borrowed for the same
//! lifetime as the arena.

mod context;
mod heap;
mod interpreter;
mod modules;
mod numeric;
mod objects;
mod stack;
#[cfg(test)]
mod tests;
mod trust;

pub use context::{Cell, Frame, FuncToken};
pub(crate) use context::SELF_SLOT;

use crate::debug;
use crate::virtual_machine::arena::{
    ARENA_ALIGN, Arena, HEADER_SIZE, MEMORY_MAGIC, Ref, header,
};
use crate::virtual_machine::errors::VmError;
use crate::virtual_machine::image::ModuleDef;
use crate::virtual_machine::VERSION_MAJOR;
use context::Regs;
use interpreter::Exit;
use std::ops::BitOr;

/// Most modules a single VM can hold. Index 255 is reserved.
pub const MAX_MODULES: usize = 255;
/// Module index meaning "none" in queue links and name references.
pub(crate) const INVALID_MODULE: u8 = 255;

/// Header state bit set once `main` has been entered.
const MAIN_STARTED: u8 = 1;

/// Flags for [`Vm::heap_alloc`] and [`Vm::stack_alloc`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct AllocFlags(pub u32);

impl AllocFlags {
    pub const NONE: AllocFlags = AllocFlags(0);
    /// Zero-fill the returned block.
    pub const ZERO_MEMORY: AllocFlags = AllocFlags(1);

    pub const fn contains(self, other: AllocFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

/// Flags for [`Vm::module_import`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ImportFlags(pub u8);

impl ImportFlags {
    pub const NONE: ImportFlags = ImportFlags(0);
    /// The image has been verified elsewhere. Required, since the VM does
    /// not verify bytecode itself.
    pub const SKIP_VERIFICATION: ImportFlags = ImportFlags(1);
    /// Security-safe-critical functions of this module may elevate
    /// sandboxed callers to full trust.
    pub const TRUSTED_MODULE: ImportFlags = ImportFlags(2);

    pub const fn contains(self, other: ImportFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for ImportFlags {
    type Output = ImportFlags;

    fn bitor(self, rhs: Self) -> Self {
        ImportFlags(self.0 | rhs.0)
    }
}

/// State of the VM after a successful [`Vm::execute`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Outcome {
    /// All initializers and `main` ran to completion.
    Completed,
    /// Bytecode requested a host service; call `execute` again to resume.
    Syscall(Suspended),
}

/// A pending syscall.
///
/// The host reads arguments off the operand stack, pushes results and must
/// leave the operand cursor at exactly `sp_expected` before resuming.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Suspended {
    pub syscall: u16,
    pub sp_expected: u16,
}

/// An embedded virtual machine bound to its arena.
pub struct Vm<'a> {
    arena: Arena<'a>,
    images: [&'a [u8]; MAX_MODULES],
    regs: Regs,
}

fn check_buffer(buffer: &[u8]) -> Result<(), VmError> {
    if buffer.as_ptr().align_offset(ARENA_ALIGN) != 0 {
        return Err(VmError::ArgumentInvalid {
            reason: "arena is not 4-byte aligned",
        });
    }
    if buffer.len() < HEADER_SIZE as usize {
        return Err(VmError::ArgumentInvalid {
            reason: "arena is smaller than the VM header",
        });
    }
    if buffer.len() > u32::MAX as usize {
        return Err(VmError::ArgumentInvalid {
            reason: "arena exceeds the 32-bit offset space",
        });
    }
    Ok(())
}

impl<'a> Vm<'a> {
    /// Formats `buffer` as a fresh VM.
    ///
    /// `flags` are stored in the header for the host; no bits are defined yet.
    pub fn initialize(buffer: &'a mut [u8], context: usize, flags: u8) -> Result<Self, VmError> {
        check_buffer(buffer)?;
        let len = buffer.len() as u32;

        let mut arena = Arena::new(buffer);
        let _ = arena.fill(0, HEADER_SIZE, 0);
        arena.set_hdr_u8(header::MAGIC, MEMORY_MAGIC);
        arena.set_hdr_u8(header::VERSION, VERSION_MAJOR);
        arena.set_hdr_u32(header::HEAP_SIZE, len);
        arena.set_hdr_u32(header::HEAP_USED, HEADER_SIZE);
        arena.set_hdr_u8(header::FLAGS, flags);
        arena.set_hdr_u64(header::CONTEXT, context as u64);
        debug!("vm initialized over {len} bytes");

        Ok(Self {
            arena,
            images: [&[]; MAX_MODULES],
            regs: Regs::default(),
        })
    }

    /// Rebinds a VM whose arena bytes were copied to `buffer`.
    ///
    /// `images` must be the images imported into the original VM, in module
    /// index order.
    pub fn reattach(buffer: &'a mut [u8], images: &[&'a [u8]]) -> Result<Self, VmError> {
        check_buffer(buffer)?;
        let len = buffer.len() as u32;
        let arena = Arena::new(buffer);

        if arena.hdr_u8(header::MAGIC) != MEMORY_MAGIC
            || arena.hdr_u8(header::VERSION) != VERSION_MAJOR
        {
            return Err(VmError::ArgumentInvalid {
                reason: "buffer does not hold an initialized VM",
            });
        }
        if arena.hdr_u32(header::HEAP_SIZE) != len {
            return Err(VmError::ArgumentInvalid {
                reason: "arena length differs from the recorded heap size",
            });
        }
        if images.len() != arena.hdr_u8(header::MODULES_IMPORTED) as usize {
            return Err(VmError::ArgumentInvalid {
                reason: "image count differs from the imported module count",
            });
        }

        let mut vm = Self {
            arena,
            images: [&[]; MAX_MODULES],
            regs: Regs::default(),
        };
        for (index, &image) in images.iter().enumerate() {
            if vm.module_image_size(index as u8)? as usize != image.len() {
                return Err(VmError::ArgumentInvalid {
                    reason: "image differs from the one imported",
                });
            }
            vm.images[index] = image;
        }
        Ok(vm)
    }

    /// Returns the host context passed to [`Vm::initialize`].
    pub fn context(&self) -> usize {
        self.arena.hdr_u64(header::CONTEXT) as usize
    }

    /// Returns the flags passed to [`Vm::initialize`].
    pub fn flags(&self) -> u8 {
        self.arena.hdr_u8(header::FLAGS)
    }

    /// Returns the raw arena bytes, header included.
    pub fn arena_bytes(&self) -> &[u8] {
        self.arena.slice(0, self.arena.len()).unwrap_or(&[])
    }

    /// Resolves a reference to `len` bytes of the arena.
    pub fn resolve(&self, reference: Ref, len: u32) -> Result<&[u8], VmError> {
        if reference.is_null() {
            return Err(VmError::ArgumentNull { what: "reference" });
        }
        self.arena
            .slice(reference.offset(), len)
            .ok_or(VmError::ArgumentInvalid {
                reason: "reference lies outside the arena",
            })
    }

    /// Mutable counterpart of [`Vm::resolve`].
    pub fn resolve_mut(&mut self, reference: Ref, len: u32) -> Result<&mut [u8], VmError> {
        if reference.is_null() {
            return Err(VmError::ArgumentNull { what: "reference" });
        }
        self.arena
            .slice_mut(reference.offset(), len)
            .ok_or(VmError::ArgumentInvalid {
                reason: "reference lies outside the arena",
            })
    }

    /// Returns the pending syscall id, 0 when none.
    pub fn syscall(&self) -> u16 {
        self.arena.hdr_u16(header::SYSCALL)
    }

    /// Runs pending initializers and `main`, or resumes after a syscall.
    pub fn execute(&mut self) -> Result<Outcome, VmError> {
        let imported = self.arena.hdr_u8(header::MODULES_IMPORTED);
        if imported == 0 {
            return Err(VmError::InvalidOperation {
                reason: "no startup module imported",
            });
        }
        if imported != self.arena.hdr_u8(header::MODULES_CREATED) {
            return Err(VmError::InvalidOperation {
                reason: "imported modules are still missing",
            });
        }
        let sp = self.arena.hdr_u16(header::SP);
        let sp_expected = self.arena.hdr_u16(header::SP_EXPECTED);
        if sp != sp_expected {
            return Err(VmError::StackImbalance {
                expected: sp_expected,
                actual: sp,
            });
        }

        if self.resume()? == Exit::Yield {
            return Ok(self.suspended());
        }

        while let Some((module, initializer)) = self.next_initializer()? {
            debug!("initializing module {module}");
            self.enter(module, initializer)?;
            if self.resume()? == Exit::Yield {
                return Ok(self.suspended());
            }
        }

        let state = self.arena.hdr_u8(header::STATE);
        if state & MAIN_STARTED == 0 {
            self.arena.set_hdr_u8(header::STATE, state | MAIN_STARTED);
            let main = ModuleDef::new(self.images[0])
                .and_then(|def| def.app_info())
                .map(|app| app.main)
                .ok_or(VmError::InvalidOperation {
                    reason: "startup image lost its app info",
                })?;
            if main != 0 {
                debug!("executing main");
                self.enter(0, main)?;
                if self.resume()? == Exit::Yield {
                    return Ok(self.suspended());
                }
            }
        }

        Ok(Outcome::Completed)
    }

    fn suspended(&self) -> Outcome {
        Outcome::Syscall(Suspended {
            syscall: self.arena.hdr_u16(header::SYSCALL),
            sp_expected: self.arena.hdr_u16(header::SP_EXPECTED),
        })
    }
}
