//! Arithmetic, bitwise, comparison and conversion families.
//!
//! Binary operators read `value1` below `value2` and leave the result where
//! `value1` was. 64-bit values occupy two cells, low word first.

use super::Vm;
use super::context::Cell;
use super::interpreter::Flow;
use crate::virtual_machine::errors::VmError;
use crate::virtual_machine::isa::Opcode;

type Result<T> = std::result::Result<T, VmError>;

fn checked<T>(value: Option<T>) -> Result<T> {
    value.ok_or(VmError::Overflow)
}

fn nonzero<T: Default + PartialEq>(divisor: T) -> Result<T> {
    if divisor == T::default() {
        Err(VmError::DivideByZero)
    } else {
        Ok(divisor)
    }
}

fn bool32(value: bool) -> Result<u32> {
    Ok(value as u32)
}

fn cmp_f32(a: f32, b: f32) -> Option<std::cmp::Ordering> {
    a.partial_cmp(&b)
}

fn cmp_f64(a: f64, b: f64) -> Option<std::cmp::Ordering> {
    a.partial_cmp(&b)
}

/// Evaluates a comparison opcode against `partial_cmp`. The `_UN` forms
/// are also true when either operand is NaN.
fn compare(op: Opcode, order: Option<std::cmp::Ordering>) -> bool {
    use std::cmp::Ordering::{Equal, Greater, Less};
    match op {
        Opcode::CeqF32 | Opcode::CeqF64 => order == Some(Equal),
        Opcode::CeqF32Un | Opcode::CeqF64Un => !matches!(order, Some(Less | Greater)),
        Opcode::CneF32 | Opcode::CneF64 => matches!(order, Some(Less | Greater)),
        Opcode::CneF32Un | Opcode::CneF64Un => order != Some(Equal),
        Opcode::CgtF32 | Opcode::CgtF64 => order == Some(Greater),
        Opcode::CgtF32Un | Opcode::CgtF64Un => !matches!(order, Some(Less | Equal)),
        Opcode::CgeF32 | Opcode::CgeF64 => matches!(order, Some(Greater | Equal)),
        Opcode::CgeF32Un | Opcode::CgeF64Un => order != Some(Less),
        Opcode::CltF32 | Opcode::CltF64 => order == Some(Less),
        Opcode::CltF32Un | Opcode::CltF64Un => !matches!(order, Some(Greater | Equal)),
        Opcode::CleF32 | Opcode::CleF64 => matches!(order, Some(Less | Equal)),
        _ => order != Some(Greater),
    }
}

impl<'a> Vm<'a> {
    // ==================== Stack shapes ====================

    /// value2 value1 -> result, one cell each.
    fn binary32(&mut self, f: impl FnOnce(u32, u32) -> Result<u32>) -> Result<Flow> {
        let b = self.cell(0)?.u32();
        let a = self.cell(1)?.u32();
        self.set_cell(1, Cell(f(a, b)?))?;
        self.pop(1)?;
        Ok(Flow::Next)
    }

    fn unary32(&mut self, f: impl FnOnce(u32) -> Result<u32>) -> Result<Flow> {
        let value = self.cell(0)?.u32();
        self.set_cell(0, Cell(f(value)?))?;
        Ok(Flow::Next)
    }

    /// value2 value1 -> result, two cells each.
    fn binary64(&mut self, f: impl FnOnce(u64, u64) -> Result<u64>) -> Result<Flow> {
        let b = self.cell2(0)?;
        let a = self.cell2(2)?;
        self.set_cell2(2, f(a, b)?)?;
        self.pop(2)?;
        Ok(Flow::Next)
    }

    /// value2 value1 -> result, two-cell operands and a one-cell result.
    fn compare64(&mut self, f: impl FnOnce(u64, u64) -> bool) -> Result<Flow> {
        let b = self.cell2(0)?;
        let a = self.cell2(2)?;
        self.set_cell(3, Cell::from_bool(f(a, b)))?;
        self.pop(3)?;
        Ok(Flow::Next)
    }

    fn unary64(&mut self, f: impl FnOnce(u64) -> Result<u64>) -> Result<Flow> {
        let value = self.cell2(0)?;
        self.set_cell2(0, f(value)?)?;
        Ok(Flow::Next)
    }

    /// amount value -> result, with a one-cell amount and a two-cell value.
    fn shift64(&mut self, f: impl FnOnce(u64, u32) -> u64) -> Result<Flow> {
        let amount = self.cell(0)?.u32();
        let value = self.cell2(1)?;
        self.set_cell2(1, f(value, amount))?;
        self.pop(1)?;
        Ok(Flow::Next)
    }

    /// One-cell operand widened to a two-cell result.
    fn widen(&mut self, f: impl FnOnce(u32) -> u64) -> Result<Flow> {
        let value = self.cell(0)?.u32();
        self.push(1)?;
        self.set_cell2(0, f(value))?;
        Ok(Flow::Next)
    }

    /// Two-cell operand narrowed to a one-cell result.
    fn narrow(&mut self, f: impl FnOnce(u64) -> u32) -> Result<Flow> {
        let value = self.cell2(0)?;
        self.pop(1)?;
        self.set_cell(0, Cell(f(value)))?;
        Ok(Flow::Next)
    }

    // ==================== Dispatch ====================

    pub(super) fn numeric_op(&mut self, op: Opcode) -> Result<Flow> {
        let i = |v: u32| v as i32;
        let l = |v: u64| v as i64;
        let f = f32::from_bits;
        let d = f64::from_bits;

        match op {
            // i32
            Opcode::AddI32 => self.binary32(|a, b| Ok(checked(i(a).checked_add(i(b)))? as u32)),
            Opcode::SubI32 => self.binary32(|a, b| Ok(checked(i(a).checked_sub(i(b)))? as u32)),
            Opcode::MulI32 => self.binary32(|a, b| Ok(checked(i(a).checked_mul(i(b)))? as u32)),
            Opcode::DivI32 => self.binary32(|a, b| {
                let b = nonzero(i(b))?;
                Ok(checked(i(a).checked_div(b))? as u32)
            }),
            Opcode::DivI32Un => self.binary32(|a, b| Ok(a / nonzero(b)?)),
            Opcode::RemI32 => self.binary32(|a, b| Ok(i(a).wrapping_rem(nonzero(i(b))?) as u32)),
            Opcode::RemI32Un => self.binary32(|a, b| Ok(a % nonzero(b)?)),
            Opcode::NegI32 => self.unary32(|v| Ok(checked(i(v).checked_neg())? as u32)),
            Opcode::ShlI32 => self.binary32(|a, b| Ok(a.wrapping_shl(b))),
            Opcode::ShrI32 => self.binary32(|a, b| Ok(i(a).wrapping_shr(b) as u32)),
            Opcode::ShrI32Un => self.binary32(|a, b| Ok(a.wrapping_shr(b))),
            Opcode::AndI32 => self.binary32(|a, b| Ok(a & b)),
            Opcode::OrI32 => self.binary32(|a, b| Ok(a | b)),
            Opcode::XorI32 => self.binary32(|a, b| Ok(a ^ b)),
            Opcode::NotI32 => self.unary32(|v| Ok(!v)),
            Opcode::CeqI32 => self.binary32(|a, b| bool32(a == b)),
            Opcode::CneI32 => self.binary32(|a, b| bool32(a != b)),
            Opcode::CgtI32 => self.binary32(|a, b| bool32(i(a) > i(b))),
            Opcode::CgtI32Un => self.binary32(|a, b| bool32(a > b)),
            Opcode::CgeI32 => self.binary32(|a, b| bool32(i(a) >= i(b))),
            Opcode::CgeI32Un => self.binary32(|a, b| bool32(a >= b)),
            Opcode::CltI32 => self.binary32(|a, b| bool32(i(a) < i(b))),
            Opcode::CltI32Un => self.binary32(|a, b| bool32(a < b)),
            Opcode::CleI32 => self.binary32(|a, b| bool32(i(a) <= i(b))),
            Opcode::CleI32Un => self.binary32(|a, b| bool32(a <= b)),
            Opcode::ConvI8I32 => self.unary32(|v| Ok(v as i8 as i32 as u32)),
            Opcode::ConvU8I32 => self.unary32(|v| Ok(v as u8 as u32)),
            Opcode::ConvI16I32 => self.unary32(|v| Ok(v as i16 as i32 as u32)),
            Opcode::ConvU16I32 => self.unary32(|v| Ok(v as u16 as u32)),

            // i64
            Opcode::AddI64 => self.binary64(|a, b| Ok(checked(l(a).checked_add(l(b)))? as u64)),
            Opcode::SubI64 => self.binary64(|a, b| Ok(checked(l(a).checked_sub(l(b)))? as u64)),
            Opcode::MulI64 => self.binary64(|a, b| Ok(checked(l(a).checked_mul(l(b)))? as u64)),
            Opcode::DivI64 => self.binary64(|a, b| {
                let b = nonzero(l(b))?;
                Ok(checked(l(a).checked_div(b))? as u64)
            }),
            Opcode::DivI64Un => self.binary64(|a, b| Ok(a / nonzero(b)?)),
            Opcode::RemI64 => self.binary64(|a, b| Ok(l(a).wrapping_rem(nonzero(l(b))?) as u64)),
            Opcode::RemI64Un => self.binary64(|a, b| Ok(a % nonzero(b)?)),
            Opcode::NegI64 => self.unary64(|v| Ok(checked(l(v).checked_neg())? as u64)),
            Opcode::ShlI64 => self.shift64(|v, n| v.wrapping_shl(n)),
            Opcode::ShrI64 => self.shift64(|v, n| l(v).wrapping_shr(n) as u64),
            Opcode::ShrI64Un => self.shift64(|v, n| v.wrapping_shr(n)),
            Opcode::AndI64 => self.binary64(|a, b| Ok(a & b)),
            Opcode::OrI64 => self.binary64(|a, b| Ok(a | b)),
            Opcode::XorI64 => self.binary64(|a, b| Ok(a ^ b)),
            Opcode::NotI64 => self.unary64(|v| Ok(!v)),
            Opcode::CeqI64 => self.compare64(|a, b| a == b),
            Opcode::CneI64 => self.compare64(|a, b| a != b),
            Opcode::CgtI64 => self.compare64(|a, b| l(a) > l(b)),
            Opcode::CgtI64Un => self.compare64(|a, b| a > b),
            Opcode::CgeI64 => self.compare64(|a, b| l(a) >= l(b)),
            Opcode::CgeI64Un => self.compare64(|a, b| a >= b),
            Opcode::CltI64 => self.compare64(|a, b| l(a) < l(b)),
            Opcode::CltI64Un => self.compare64(|a, b| a < b),
            Opcode::CleI64 => self.compare64(|a, b| l(a) <= l(b)),
            Opcode::CleI64Un => self.compare64(|a, b| a <= b),
            Opcode::ConvI8I64 => self.narrow(|v| v as i8 as i32 as u32),
            Opcode::ConvU8I64 => self.narrow(|v| v as u8 as u32),
            Opcode::ConvI16I64 => self.narrow(|v| v as i16 as i32 as u32),
            Opcode::ConvU16I64 => self.narrow(|v| v as u16 as u32),
            Opcode::ConvI32I64 | Opcode::ConvU32I64 => self.narrow(|v| v as u32),
            Opcode::ConvI64I32 => self.widen(|v| i(v) as i64 as u64),
            Opcode::ConvU64I32 => self.widen(|v| v as u64),
            Opcode::ConvI64F32 => self.widen(|v| f(v) as i64 as u64),
            Opcode::ConvU64F32 => self.widen(|v| f(v) as u64),
            Opcode::ConvI64F64 => self.unary64(|v| Ok(d(v) as i64 as u64)),
            Opcode::ConvU64F64 => self.unary64(|v| Ok(d(v) as u64)),

            // f32
            Opcode::AddF32 => self.binary32(|a, b| Ok((f(a) + f(b)).to_bits())),
            Opcode::SubF32 => self.binary32(|a, b| Ok((f(a) - f(b)).to_bits())),
            Opcode::MulF32 => self.binary32(|a, b| Ok((f(a) * f(b)).to_bits())),
            Opcode::DivF32 => self.binary32(|a, b| Ok((f(a) / f(b)).to_bits())),
            Opcode::RemF32 => self.binary32(|a, b| Ok((f(a) % f(b)).to_bits())),
            Opcode::NegF32 => self.unary32(|v| Ok((-f(v)).to_bits())),
            Opcode::CeqF32
            | Opcode::CeqF32Un
            | Opcode::CneF32
            | Opcode::CneF32Un
            | Opcode::CgtF32
            | Opcode::CgtF32Un
            | Opcode::CgeF32
            | Opcode::CgeF32Un
            | Opcode::CltF32
            | Opcode::CltF32Un
            | Opcode::CleF32
            | Opcode::CleF32Un => self.binary32(|a, b| bool32(compare(op, cmp_f32(f(a), f(b))))),
            Opcode::ConvI8F32 => self.unary32(|v| Ok(f(v) as i8 as i32 as u32)),
            Opcode::ConvU8F32 => self.unary32(|v| Ok(f(v) as u8 as u32)),
            Opcode::ConvI16F32 => self.unary32(|v| Ok(f(v) as i16 as i32 as u32)),
            Opcode::ConvU16F32 => self.unary32(|v| Ok(f(v) as u16 as u32)),
            Opcode::ConvI32F32 => self.unary32(|v| Ok(f(v) as i32 as u32)),
            Opcode::ConvU32F32 => self.unary32(|v| Ok(f(v) as u32)),
            Opcode::ConvF32I32 => self.unary32(|v| Ok((i(v) as f32).to_bits())),
            Opcode::ConvF32I32Un => self.unary32(|v| Ok((v as f32).to_bits())),
            Opcode::ConvF32I64 => self.narrow(|v| (l(v) as f32).to_bits()),
            Opcode::ConvF32I64Un => self.narrow(|v| (v as f32).to_bits()),
            Opcode::ConvF32F64 => self.narrow(|v| (d(v) as f32).to_bits()),

            // f64
            Opcode::AddF64 => self.binary64(|a, b| Ok((d(a) + d(b)).to_bits())),
            Opcode::SubF64 => self.binary64(|a, b| Ok((d(a) - d(b)).to_bits())),
            Opcode::MulF64 => self.binary64(|a, b| Ok((d(a) * d(b)).to_bits())),
            Opcode::DivF64 => self.binary64(|a, b| Ok((d(a) / d(b)).to_bits())),
            Opcode::RemF64 => self.binary64(|a, b| Ok((d(a) % d(b)).to_bits())),
            Opcode::NegF64 => self.unary64(|v| Ok((-d(v)).to_bits())),
            Opcode::CeqF64
            | Opcode::CeqF64Un
            | Opcode::CneF64
            | Opcode::CneF64Un
            | Opcode::CgtF64
            | Opcode::CgtF64Un
            | Opcode::CgeF64
            | Opcode::CgeF64Un
            | Opcode::CltF64
            | Opcode::CltF64Un
            | Opcode::CleF64
            | Opcode::CleF64Un => self.compare64(|a, b| compare(op, cmp_f64(d(a), d(b)))),
            Opcode::ConvI8F64 => self.narrow(|v| d(v) as i8 as i32 as u32),
            Opcode::ConvU8F64 => self.narrow(|v| d(v) as u8 as u32),
            Opcode::ConvI16F64 => self.narrow(|v| d(v) as i16 as i32 as u32),
            Opcode::ConvU16F64 => self.narrow(|v| d(v) as u16 as u32),
            Opcode::ConvI32F64 => self.narrow(|v| d(v) as i32 as u32),
            Opcode::ConvU32F64 => self.narrow(|v| d(v) as u32),
            Opcode::ConvF64I32 => self.widen(|v| (i(v) as f64).to_bits()),
            Opcode::ConvF64I32Un => self.widen(|v| (v as f64).to_bits()),
            Opcode::ConvF64I64 => self.unary64(|v| Ok((l(v) as f64).to_bits())),
            Opcode::ConvF64I64Un => self.unary64(|v| Ok((v as f64).to_bits())),
            Opcode::ConvF64F32 => self.widen(|v| (f(v) as f64).to_bits()),

            _ => Err(self.fault("opcode has no handler")),
        }
    }
}
