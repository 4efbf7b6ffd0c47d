//! Two-level trust boundary.
//!
//! Frames run either sandboxed or in full trust. Entering a function is
//! checked against the caller's level:
//! - security-critical functions require a full-trust caller;
//! - security-safe-critical functions elevate a sandboxed caller, but only
//!   when their module was imported with [`ImportFlags::TRUSTED_MODULE`];
//! - every other function inherits the caller's level.
//!
//! Trust is part of the frame, so returning restores the caller's level.

use super::{ImportFlags, Vm};
use crate::debug;
use crate::virtual_machine::errors::VmError;
use crate::virtual_machine::image::FuncDef;

impl<'a> Vm<'a> {
    /// Returns the trust level the callee runs at.
    pub(super) fn check_trust(
        &self,
        caller_trusted: bool,
        callee: &FuncDef,
        module: u8,
    ) -> Result<bool, VmError> {
        if caller_trusted || !(callee.is_security_critical() || callee.is_security_safe_critical())
        {
            return Ok(caller_trusted);
        }
        if callee.is_security_safe_critical()
            && self.module_flags(module)?.contains(ImportFlags::TRUSTED_MODULE)
        {
            debug!("entering full trust in module {module}");
            return Ok(true);
        }
        Err(VmError::SecurityViolation {
            module: self.regs.frame.module(),
            ip: self.regs.frame.ip(),
        })
    }
}
