//! Instruction Set Architecture (ISA) definitions.
//!
//! The [`for_each_opcode!`] macro holds the canonical opcode table and invokes a
//! callback macro for code generation, so the interpreter, the assembler and
//! the tests all agree on numbering, encoded size and required features.
//!
//! This module generates:
//! - The [`Opcode`] enum with its byte values
//! - [`Opcode::from_u8`] for decoding, returning `None` for unassigned bytes
//! - Mnemonic, encoded size and feature lookups
//!
//! # Bytecode Format
//!
//! Instructions are variable length and little-endian:
//! - Opcode: 1 byte
//! - Local index, short constant, short branch offset: 1 byte
//! - Field offset, element size, long branch offset: 2 bytes
//! - Function token (`CALL`, `LDFTN`): import slot byte + 2-byte descriptor offset
//! - `SYSCALL`: signed cursor adjustment byte + 2-byte syscall id
//! - `LDC_X32` / `LDC_X64`: 4 / 8 immediate bytes
//!
//! Stack comments read top first: `value2 value1 ... -> result ...` pops
//! `value2` (top) and `value1`, then pushes `result`.

/// Feature bits an image may require and a build may provide.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Features(pub u16);

impl Features {
    pub const NONE: Features = Features(0);
    /// 64-bit integer arithmetic.
    pub const I64: Features = Features(1);
    /// 32-bit floats.
    pub const F32: Features = Features(2);
    /// 64-bit floats.
    pub const F64: Features = Features(4);
    /// Objects, arrays and references.
    pub const REFS: Features = Features(8);

    /// Features compiled into this build, selected by cargo features.
    pub const fn compiled() -> Features {
        let mut bits = 0;
        if cfg!(feature = "i64") {
            bits |= Self::I64.0;
        }
        if cfg!(feature = "f32") {
            bits |= Self::F32.0;
        }
        if cfg!(feature = "f64") {
            bits |= Self::F64.0;
        }
        if cfg!(feature = "refs") {
            bits |= Self::REFS.0;
        }
        Features(bits)
    }

    pub const fn union(self, other: Features) -> Features {
        Features(self.0 | other.0)
    }

    /// Returns true if every bit of `self` is present in `other`.
    pub const fn is_subset_of(self, other: Features) -> bool {
        self.0 & other.0 == self.0
    }
}

const NONE: Features = Features::NONE;
const I64: Features = Features::I64;
const F32: Features = Features::F32;
const F64: Features = Features::F64;
const REFS: Features = Features::REFS;

/// Invokes a callback macro with the complete opcode table.
///
/// Columns: variant = byte, mnemonic, encoded size in bytes, required features.
macro_rules! for_each_opcode {
    ($callback:ident) => {
        $callback! {
            // =========================
            // Basic
            // =========================
            /// HALT ; ... -> ... (operand stack must be empty)
            Halt = 0x00, "HALT", 1, NONE,
            /// NOP ; ... -> ...
            Nop = 0x01, "NOP", 1, NONE,
            /// BREAK ; ... -> ... (stops with a breakpoint fault)
            Break = 0x02, "BREAK", 1, NONE,
            /// POP_X32 ; value ... -> ...
            PopX32 = 0x04, "POP_X32", 1, NONE,
            /// POP_X64 ; value ... -> ...
            PopX64 = 0x05, "POP_X64", 1, NONE,
            /// DUP_X32 ; value ... -> value value ...
            DupX32 = 0x06, "DUP_X32", 1, NONE,
            /// DUP_X64 ; value ... -> value value ...
            DupX64 = 0x07, "DUP_X64", 1, NONE,
            /// SWAP ; value1 value2 ... -> value2 value1 ...
            Swap = 0x08, "SWAP", 1, NONE,
            /// OVER ; value1 value2 ... -> value2 value1 value2 ...
            Over = 0x09, "OVER", 1, NONE,
            /// ROT ; value1 value2 value3 ... -> value2 value3 value1 ...
            Rot = 0x0A, "ROT", 1, NONE,
            /// NIP ; value1 value2 ... -> value1 ...
            Nip = 0x0B, "NIP", 1, NONE,
            /// TUCK ; value1 value2 ... -> value1 value2 value1 ...
            Tuck = 0x0C, "TUCK", 1, NONE,
            // =========================
            // Locals (indexed from the operand top)
            // =========================
            /// LDLOC_X32 index ; ... -> value ...
            LdlocX32 = 0x10, "LDLOC_X32", 2, NONE,
            /// LDLOC_X64 index ; ... -> value ...
            LdlocX64 = 0x11, "LDLOC_X64", 2, NONE,
            /// LDLOCA index ; ... -> address ...
            Ldloca = 0x12, "LDLOCA", 2, REFS,
            /// STLOC_X32 index ; value ... -> ...
            StlocX32 = 0x13, "STLOC_X32", 2, NONE,
            /// STLOC_X64 index ; value ... -> ...
            StlocX64 = 0x14, "STLOC_X64", 2, NONE,
            // =========================
            // Calls
            // =========================
            /// RET ; ... -> ...
            Ret = 0x18, "RET", 1, NONE,
            /// RET_X32 ; value ... -> value
            RetX32 = 0x19, "RET_X32", 1, NONE,
            /// RET_X64 ; value ... -> value
            RetX64 = 0x1A, "RET_X64", 1, NONE,
            /// CALL slot, offset ; argumentN ... argument0 ... -> result ...
            Call = 0x1B, "CALL", 4, NONE,
            /// CALLI ; ftn argumentN ... argument0 ... -> result ...
            Calli = 0x1C, "CALLI", 1, NONE,
            /// SYSCALL adjustment, id ; arguments ... -> results ... (yields to the host)
            Syscall = 0x1D, "SYSCALL", 4, NONE,
            // =========================
            // Branches (target = end of instruction + offset)
            // =========================
            /// BR_S offset8 ; ... -> ...
            BrS = 0x20, "BR_S", 2, NONE,
            /// BRFALSE_S offset8 ; value ... -> ...
            BrfalseS = 0x21, "BRFALSE_S", 2, NONE,
            /// BRTRUE_S offset8 ; value ... -> ...
            BrtrueS = 0x22, "BRTRUE_S", 2, NONE,
            /// BR offset16 ; ... -> ...
            Br = 0x23, "BR", 3, NONE,
            /// BRFALSE offset16 ; value ... -> ...
            Brfalse = 0x24, "BRFALSE", 3, NONE,
            /// BRTRUE offset16 ; value ... -> ...
            Brtrue = 0x25, "BRTRUE", 3, NONE,
            // =========================
            // Constants
            // =========================
            /// LDC_I32_M1 ; ... -> -1 ...
            LdcI32M1 = 0x28, "LDC_I32_M1", 1, NONE,
            /// LDC_I32_0 ; ... -> 0 ...
            LdcI32_0 = 0x29, "LDC_I32_0", 1, NONE,
            /// LDC_I32_1 ; ... -> 1 ...
            LdcI32_1 = 0x2A, "LDC_I32_1", 1, NONE,
            /// LDC_I32_2 ; ... -> 2 ...
            LdcI32_2 = 0x2B, "LDC_I32_2", 1, NONE,
            /// LDC_I32_3 ; ... -> 3 ...
            LdcI32_3 = 0x2C, "LDC_I32_3", 1, NONE,
            /// LDC_I32_4 ; ... -> 4 ...
            LdcI32_4 = 0x2D, "LDC_I32_4", 1, NONE,
            /// LDC_I32_5 ; ... -> 5 ...
            LdcI32_5 = 0x2E, "LDC_I32_5", 1, NONE,
            /// LDC_I32_6 ; ... -> 6 ...
            LdcI32_6 = 0x2F, "LDC_I32_6", 1, NONE,
            /// LDC_I32_7 ; ... -> 7 ...
            LdcI32_7 = 0x30, "LDC_I32_7", 1, NONE,
            /// LDC_I32_8 ; ... -> 8 ...
            LdcI32_8 = 0x31, "LDC_I32_8", 1, NONE,
            /// LDC_I32_S imm8 ; ... -> value ...
            LdcI32S = 0x32, "LDC_I32_S", 2, NONE,
            /// LDC_X32 imm32 ; ... -> value ...
            LdcX32 = 0x33, "LDC_X32", 5, NONE,
            /// LDC_X64 imm64 ; ... -> value ...
            LdcX64 = 0x34, "LDC_X64", 9, NONE,
            /// LDFTN slot, offset ; ... -> ftn ...
            Ldftn = 0x35, "LDFTN", 4, NONE,
            // =========================
            // i32 arithmetic
            // =========================
            /// ADD_I32 ; value2 value1 ... -> result ... (faults on overflow)
            AddI32 = 0x40, "ADD_I32", 1, NONE,
            /// SUB_I32 ; value2 value1 ... -> result ... (faults on overflow)
            SubI32 = 0x41, "SUB_I32", 1, NONE,
            /// MUL_I32 ; value2 value1 ... -> result ... (faults on overflow)
            MulI32 = 0x42, "MUL_I32", 1, NONE,
            /// DIV_I32 ; value2 value1 ... -> result ...
            DivI32 = 0x43, "DIV_I32", 1, NONE,
            /// DIV_I32_UN ; value2 value1 ... -> result ...
            DivI32Un = 0x44, "DIV_I32_UN", 1, NONE,
            /// REM_I32 ; value2 value1 ... -> result ...
            RemI32 = 0x45, "REM_I32", 1, NONE,
            /// REM_I32_UN ; value2 value1 ... -> result ...
            RemI32Un = 0x46, "REM_I32_UN", 1, NONE,
            /// NEG_I32 ; value ... -> result ...
            NegI32 = 0x47, "NEG_I32", 1, NONE,
            // =========================
            // i32 bitwise
            // =========================
            /// SHL_I32 ; amount value ... -> result ...
            ShlI32 = 0x48, "SHL_I32", 1, NONE,
            /// SHR_I32 ; amount value ... -> result ... (arithmetic)
            ShrI32 = 0x49, "SHR_I32", 1, NONE,
            /// SHR_I32_UN ; amount value ... -> result ... (logical)
            ShrI32Un = 0x4A, "SHR_I32_UN", 1, NONE,
            /// AND_I32 ; value2 value1 ... -> result ...
            AndI32 = 0x4B, "AND_I32", 1, NONE,
            /// OR_I32 ; value2 value1 ... -> result ...
            OrI32 = 0x4C, "OR_I32", 1, NONE,
            /// XOR_I32 ; value2 value1 ... -> result ...
            XorI32 = 0x4D, "XOR_I32", 1, NONE,
            /// NOT_I32 ; value ... -> result ...
            NotI32 = 0x4E, "NOT_I32", 1, NONE,
            // =========================
            // i32 comparison
            // =========================
            /// CEQ_I32 ; value2 value1 ... -> result ...
            CeqI32 = 0x4F, "CEQ_I32", 1, NONE,
            /// CNE_I32 ; value2 value1 ... -> result ...
            CneI32 = 0x50, "CNE_I32", 1, NONE,
            /// CGT_I32 ; value2 value1 ... -> result ...
            CgtI32 = 0x51, "CGT_I32", 1, NONE,
            /// CGT_I32_UN ; value2 value1 ... -> result ...
            CgtI32Un = 0x52, "CGT_I32_UN", 1, NONE,
            /// CGE_I32 ; value2 value1 ... -> result ...
            CgeI32 = 0x53, "CGE_I32", 1, NONE,
            /// CGE_I32_UN ; value2 value1 ... -> result ...
            CgeI32Un = 0x54, "CGE_I32_UN", 1, NONE,
            /// CLT_I32 ; value2 value1 ... -> result ...
            CltI32 = 0x55, "CLT_I32", 1, NONE,
            /// CLT_I32_UN ; value2 value1 ... -> result ...
            CltI32Un = 0x56, "CLT_I32_UN", 1, NONE,
            /// CLE_I32 ; value2 value1 ... -> result ...
            CleI32 = 0x57, "CLE_I32", 1, NONE,
            /// CLE_I32_UN ; value2 value1 ... -> result ...
            CleI32Un = 0x58, "CLE_I32_UN", 1, NONE,
            // =========================
            // i32 conversion (CONV_<target>_<source>)
            // =========================
            /// CONV_I8_I32 ; value ... -> result ...
            ConvI8I32 = 0x59, "CONV_I8_I32", 1, NONE,
            /// CONV_U8_I32 ; value ... -> result ...
            ConvU8I32 = 0x5A, "CONV_U8_I32", 1, NONE,
            /// CONV_I16_I32 ; value ... -> result ...
            ConvI16I32 = 0x5B, "CONV_I16_I32", 1, NONE,
            /// CONV_U16_I32 ; value ... -> result ...
            ConvU16I32 = 0x5C, "CONV_U16_I32", 1, NONE,
            // =========================
            // Object model
            // =========================
            /// NEWOBJ size ; ... -> address ...
            Newobj = 0x60, "NEWOBJ", 3, REFS,
            /// NEWARR elem_size ; length ... -> array length ...
            Newarr = 0x61, "NEWARR", 3, REFS,
            /// SLICE1 ; start array length ... -> array length ...
            Slice1 = 0x62, "SLICE1", 1, REFS,
            /// SLICE2 ; length' start array length ... -> array length' ...
            Slice2 = 0x63, "SLICE2", 1, REFS,
            /// LDFLD_I8 offset ; address ... -> value ...
            LdfldI8 = 0x68, "LDFLD_I8", 3, REFS,
            /// LDFLD_U8 offset ; address ... -> value ...
            LdfldU8 = 0x69, "LDFLD_U8", 3, REFS,
            /// LDFLD_I16 offset ; address ... -> value ...
            LdfldI16 = 0x6A, "LDFLD_I16", 3, REFS,
            /// LDFLD_U16 offset ; address ... -> value ...
            LdfldU16 = 0x6B, "LDFLD_U16", 3, REFS,
            /// LDFLD_X32 offset ; address ... -> value ...
            LdfldX32 = 0x6C, "LDFLD_X32", 3, REFS,
            /// LDFLD_X64 offset ; address ... -> value ...
            LdfldX64 = 0x6D, "LDFLD_X64", 3, REFS,
            /// LDFLDA offset ; address ... -> address ...
            Ldflda = 0x6E, "LDFLDA", 3, REFS,
            /// STFLD_X8 offset ; value address ... -> ...
            StfldX8 = 0x6F, "STFLD_X8", 3, REFS,
            /// STFLD_X16 offset ; value address ... -> ...
            StfldX16 = 0x70, "STFLD_X16", 3, REFS,
            /// STFLD_X32 offset ; value address ... -> ...
            StfldX32 = 0x71, "STFLD_X32", 3, REFS,
            /// STFLD_X64 offset ; value address ... -> ...
            StfldX64 = 0x72, "STFLD_X64", 3, REFS,
            /// LDELEM_I8 ; index array length ... -> value ...
            LdelemI8 = 0x7E, "LDELEM_I8", 1, REFS,
            /// LDELEM_U8 ; index array length ... -> value ...
            LdelemU8 = 0x7F, "LDELEM_U8", 1, REFS,
            /// LDELEM_I16 ; index array length ... -> value ...
            LdelemI16 = 0x80, "LDELEM_I16", 1, REFS,
            /// LDELEM_U16 ; index array length ... -> value ...
            LdelemU16 = 0x81, "LDELEM_U16", 1, REFS,
            /// LDELEM_X32 ; index array length ... -> value ...
            LdelemX32 = 0x82, "LDELEM_X32", 1, REFS,
            /// LDELEM_X64 ; index array length ... -> value ...
            LdelemX64 = 0x83, "LDELEM_X64", 1, REFS,
            /// LDELEMA elem_size ; index array length ... -> address ...
            Ldelema = 0x84, "LDELEMA", 3, REFS,
            /// STELEM_X8 ; value index array length ... -> ...
            StelemX8 = 0x85, "STELEM_X8", 1, REFS,
            /// STELEM_X16 ; value index array length ... -> ...
            StelemX16 = 0x86, "STELEM_X16", 1, REFS,
            /// STELEM_X32 ; value index array length ... -> ...
            StelemX32 = 0x87, "STELEM_X32", 1, REFS,
            /// STELEM_X64 ; value index array length ... -> ...
            StelemX64 = 0x88, "STELEM_X64", 1, REFS,
            // =========================
            // i64 arithmetic
            // =========================
            /// ADD_I64 ; value2 value1 ... -> result ... (faults on overflow)
            AddI64 = 0x90, "ADD_I64", 1, I64,
            /// SUB_I64 ; value2 value1 ... -> result ... (faults on overflow)
            SubI64 = 0x91, "SUB_I64", 1, I64,
            /// MUL_I64 ; value2 value1 ... -> result ... (faults on overflow)
            MulI64 = 0x92, "MUL_I64", 1, I64,
            /// DIV_I64 ; value2 value1 ... -> result ...
            DivI64 = 0x93, "DIV_I64", 1, I64,
            /// DIV_I64_UN ; value2 value1 ... -> result ...
            DivI64Un = 0x94, "DIV_I64_UN", 1, I64,
            /// REM_I64 ; value2 value1 ... -> result ...
            RemI64 = 0x95, "REM_I64", 1, I64,
            /// REM_I64_UN ; value2 value1 ... -> result ...
            RemI64Un = 0x96, "REM_I64_UN", 1, I64,
            /// NEG_I64 ; value ... -> result ...
            NegI64 = 0x97, "NEG_I64", 1, I64,
            // =========================
            // i64 bitwise
            // =========================
            /// SHL_I64 ; amount value ... -> result ...
            ShlI64 = 0x98, "SHL_I64", 1, I64,
            /// SHR_I64 ; amount value ... -> result ...
            ShrI64 = 0x99, "SHR_I64", 1, I64,
            /// SHR_I64_UN ; amount value ... -> result ...
            ShrI64Un = 0x9A, "SHR_I64_UN", 1, I64,
            /// AND_I64 ; value2 value1 ... -> result ...
            AndI64 = 0x9B, "AND_I64", 1, I64,
            /// OR_I64 ; value2 value1 ... -> result ...
            OrI64 = 0x9C, "OR_I64", 1, I64,
            /// XOR_I64 ; value2 value1 ... -> result ...
            XorI64 = 0x9D, "XOR_I64", 1, I64,
            /// NOT_I64 ; value ... -> result ...
            NotI64 = 0x9E, "NOT_I64", 1, I64,
            // =========================
            // i64 comparison
            // =========================
            /// CEQ_I64 ; value2 value1 ... -> result ...
            CeqI64 = 0x9F, "CEQ_I64", 1, I64,
            /// CNE_I64 ; value2 value1 ... -> result ...
            CneI64 = 0xA0, "CNE_I64", 1, I64,
            /// CGT_I64 ; value2 value1 ... -> result ...
            CgtI64 = 0xA1, "CGT_I64", 1, I64,
            /// CGT_I64_UN ; value2 value1 ... -> result ...
            CgtI64Un = 0xA2, "CGT_I64_UN", 1, I64,
            /// CGE_I64 ; value2 value1 ... -> result ...
            CgeI64 = 0xA3, "CGE_I64", 1, I64,
            /// CGE_I64_UN ; value2 value1 ... -> result ...
            CgeI64Un = 0xA4, "CGE_I64_UN", 1, I64,
            /// CLT_I64 ; value2 value1 ... -> result ...
            CltI64 = 0xA5, "CLT_I64", 1, I64,
            /// CLT_I64_UN ; value2 value1 ... -> result ...
            CltI64Un = 0xA6, "CLT_I64_UN", 1, I64,
            /// CLE_I64 ; value2 value1 ... -> result ...
            CleI64 = 0xA7, "CLE_I64", 1, I64,
            /// CLE_I64_UN ; value2 value1 ... -> result ...
            CleI64Un = 0xA8, "CLE_I64_UN", 1, I64,
            // =========================
            // i64 conversion
            // =========================
            /// CONV_I8_I64 ; value ... -> result ...
            ConvI8I64 = 0xA9, "CONV_I8_I64", 1, I64,
            /// CONV_U8_I64 ; value ... -> result ...
            ConvU8I64 = 0xAA, "CONV_U8_I64", 1, I64,
            /// CONV_I16_I64 ; value ... -> result ...
            ConvI16I64 = 0xAB, "CONV_I16_I64", 1, I64,
            /// CONV_U16_I64 ; value ... -> result ...
            ConvU16I64 = 0xAC, "CONV_U16_I64", 1, I64,
            /// CONV_I32_I64 ; value ... -> result ...
            ConvI32I64 = 0xAD, "CONV_I32_I64", 1, I64,
            /// CONV_U32_I64 ; value ... -> result ...
            ConvU32I64 = 0xAE, "CONV_U32_I64", 1, I64,
            /// CONV_I64_I32 ; value ... -> result ...
            ConvI64I32 = 0xAF, "CONV_I64_I32", 1, I64,
            /// CONV_U64_I32 ; value ... -> result ...
            ConvU64I32 = 0xB0, "CONV_U64_I32", 1, I64,
            /// CONV_I64_F32 ; value ... -> result ...
            ConvI64F32 = 0xB1, "CONV_I64_F32", 1, I64.union(F32),
            /// CONV_U64_F32 ; value ... -> result ...
            ConvU64F32 = 0xB2, "CONV_U64_F32", 1, I64.union(F32),
            /// CONV_I64_F64 ; value ... -> result ...
            ConvI64F64 = 0xB3, "CONV_I64_F64", 1, I64.union(F64),
            /// CONV_U64_F64 ; value ... -> result ...
            ConvU64F64 = 0xB4, "CONV_U64_F64", 1, I64.union(F64),
            // =========================
            // f32 arithmetic
            // =========================
            /// ADD_F32 ; value2 value1 ... -> result ...
            AddF32 = 0xC0, "ADD_F32", 1, F32,
            /// SUB_F32 ; value2 value1 ... -> result ...
            SubF32 = 0xC1, "SUB_F32", 1, F32,
            /// MUL_F32 ; value2 value1 ... -> result ...
            MulF32 = 0xC2, "MUL_F32", 1, F32,
            /// DIV_F32 ; value2 value1 ... -> result ...
            DivF32 = 0xC3, "DIV_F32", 1, F32,
            /// REM_F32 ; value2 value1 ... -> result ...
            RemF32 = 0xC4, "REM_F32", 1, F32,
            /// NEG_F32 ; value ... -> result ...
            NegF32 = 0xC5, "NEG_F32", 1, F32,
            // =========================
            // f32 comparison (_UN: true when unordered)
            // =========================
            /// CEQ_F32 ; value2 value1 ... -> result ...
            CeqF32 = 0xC6, "CEQ_F32", 1, F32,
            /// CEQ_F32_UN ; value2 value1 ... -> result ...
            CeqF32Un = 0xC7, "CEQ_F32_UN", 1, F32,
            /// CNE_F32 ; value2 value1 ... -> result ...
            CneF32 = 0xC8, "CNE_F32", 1, F32,
            /// CNE_F32_UN ; value2 value1 ... -> result ...
            CneF32Un = 0xC9, "CNE_F32_UN", 1, F32,
            /// CGT_F32 ; value2 value1 ... -> result ...
            CgtF32 = 0xCA, "CGT_F32", 1, F32,
            /// CGT_F32_UN ; value2 value1 ... -> result ...
            CgtF32Un = 0xCB, "CGT_F32_UN", 1, F32,
            /// CGE_F32 ; value2 value1 ... -> result ...
            CgeF32 = 0xCC, "CGE_F32", 1, F32,
            /// CGE_F32_UN ; value2 value1 ... -> result ...
            CgeF32Un = 0xCD, "CGE_F32_UN", 1, F32,
            /// CLT_F32 ; value2 value1 ... -> result ...
            CltF32 = 0xCE, "CLT_F32", 1, F32,
            /// CLT_F32_UN ; value2 value1 ... -> result ...
            CltF32Un = 0xCF, "CLT_F32_UN", 1, F32,
            /// CLE_F32 ; value2 value1 ... -> result ...
            CleF32 = 0xD0, "CLE_F32", 1, F32,
            /// CLE_F32_UN ; value2 value1 ... -> result ...
            CleF32Un = 0xD1, "CLE_F32_UN", 1, F32,
            // =========================
            // f32 conversion
            // =========================
            /// CONV_I8_F32 ; value ... -> result ...
            ConvI8F32 = 0xD2, "CONV_I8_F32", 1, F32,
            /// CONV_U8_F32 ; value ... -> result ...
            ConvU8F32 = 0xD3, "CONV_U8_F32", 1, F32,
            /// CONV_I16_F32 ; value ... -> result ...
            ConvI16F32 = 0xD4, "CONV_I16_F32", 1, F32,
            /// CONV_U16_F32 ; value ... -> result ...
            ConvU16F32 = 0xD5, "CONV_U16_F32", 1, F32,
            /// CONV_I32_F32 ; value ... -> result ...
            ConvI32F32 = 0xD6, "CONV_I32_F32", 1, F32,
            /// CONV_U32_F32 ; value ... -> result ...
            ConvU32F32 = 0xD7, "CONV_U32_F32", 1, F32,
            /// CONV_F32_I32 ; value ... -> result ...
            ConvF32I32 = 0xD8, "CONV_F32_I32", 1, F32,
            /// CONV_F32_I32_UN ; value ... -> result ...
            ConvF32I32Un = 0xD9, "CONV_F32_I32_UN", 1, F32,
            /// CONV_F32_I64 ; value ... -> result ...
            ConvF32I64 = 0xDA, "CONV_F32_I64", 1, F32.union(I64),
            /// CONV_F32_I64_UN ; value ... -> result ...
            ConvF32I64Un = 0xDB, "CONV_F32_I64_UN", 1, F32.union(I64),
            /// CONV_F32_F64 ; value ... -> result ...
            ConvF32F64 = 0xDC, "CONV_F32_F64", 1, F32.union(F64),
            // =========================
            // f64 arithmetic
            // =========================
            /// ADD_F64 ; value2 value1 ... -> result ...
            AddF64 = 0xE0, "ADD_F64", 1, F64,
            /// SUB_F64 ; value2 value1 ... -> result ...
            SubF64 = 0xE1, "SUB_F64", 1, F64,
            /// MUL_F64 ; value2 value1 ... -> result ...
            MulF64 = 0xE2, "MUL_F64", 1, F64,
            /// DIV_F64 ; value2 value1 ... -> result ...
            DivF64 = 0xE3, "DIV_F64", 1, F64,
            /// REM_F64 ; value2 value1 ... -> result ...
            RemF64 = 0xE4, "REM_F64", 1, F64,
            /// NEG_F64 ; value ... -> result ...
            NegF64 = 0xE5, "NEG_F64", 1, F64,
            // =========================
            // f64 comparison
            // =========================
            /// CEQ_F64 ; value2 value1 ... -> result ...
            CeqF64 = 0xE6, "CEQ_F64", 1, F64,
            /// CEQ_F64_UN ; value2 value1 ... -> result ...
            CeqF64Un = 0xE7, "CEQ_F64_UN", 1, F64,
            /// CNE_F64 ; value2 value1 ... -> result ...
            CneF64 = 0xE8, "CNE_F64", 1, F64,
            /// CNE_F64_UN ; value2 value1 ... -> result ...
            CneF64Un = 0xE9, "CNE_F64_UN", 1, F64,
            /// CGT_F64 ; value2 value1 ... -> result ...
            CgtF64 = 0xEA, "CGT_F64", 1, F64,
            /// CGT_F64_UN ; value2 value1 ... -> result ...
            CgtF64Un = 0xEB, "CGT_F64_UN", 1, F64,
            /// CGE_F64 ; value2 value1 ... -> result ...
            CgeF64 = 0xEC, "CGE_F64", 1, F64,
            /// CGE_F64_UN ; value2 value1 ... -> result ...
            CgeF64Un = 0xED, "CGE_F64_UN", 1, F64,
            /// CLT_F64 ; value2 value1 ... -> result ...
            CltF64 = 0xEE, "CLT_F64", 1, F64,
            /// CLT_F64_UN ; value2 value1 ... -> result ...
            CltF64Un = 0xEF, "CLT_F64_UN", 1, F64,
            /// CLE_F64 ; value2 value1 ... -> result ...
            CleF64 = 0xF0, "CLE_F64", 1, F64,
            /// CLE_F64_UN ; value2 value1 ... -> result ...
            CleF64Un = 0xF1, "CLE_F64_UN", 1, F64,
            // =========================
            // f64 conversion
            // =========================
            /// CONV_I8_F64 ; value ... -> result ...
            ConvI8F64 = 0xF2, "CONV_I8_F64", 1, F64,
            /// CONV_U8_F64 ; value ... -> result ...
            ConvU8F64 = 0xF3, "CONV_U8_F64", 1, F64,
            /// CONV_I16_F64 ; value ... -> result ...
            ConvI16F64 = 0xF4, "CONV_I16_F64", 1, F64,
            /// CONV_U16_F64 ; value ... -> result ...
            ConvU16F64 = 0xF5, "CONV_U16_F64", 1, F64,
            /// CONV_I32_F64 ; value ... -> result ...
            ConvI32F64 = 0xF6, "CONV_I32_F64", 1, F64,
            /// CONV_U32_F64 ; value ... -> result ...
            ConvU32F64 = 0xF7, "CONV_U32_F64", 1, F64,
            /// CONV_F64_I32 ; value ... -> result ...
            ConvF64I32 = 0xF8, "CONV_F64_I32", 1, F64,
            /// CONV_F64_I32_UN ; value ... -> result ...
            ConvF64I32Un = 0xF9, "CONV_F64_I32_UN", 1, F64,
            /// CONV_F64_I64 ; value ... -> result ...
            ConvF64I64 = 0xFA, "CONV_F64_I64", 1, F64.union(I64),
            /// CONV_F64_I64_UN ; value ... -> result ...
            ConvF64I64Un = 0xFB, "CONV_F64_I64_UN", 1, F64.union(I64),
            /// CONV_F64_F32 ; value ... -> result ...
            ConvF64F32 = 0xFC, "CONV_F64_F32", 1, F64.union(F32),
        }
    };
}

macro_rules! define_opcodes {
    (
        $(
            $(#[$doc:meta])*
            $name:ident = $byte:expr, $mnemonic:literal, $size:expr, $features:expr
        ),* $(,)?
    ) => {
        /// Every assigned opcode. Bytes not listed here decode to `None`.
        #[repr(u8)]
        #[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
        pub enum Opcode {
            $(
                $(#[$doc])*
                $name = $byte,
            )*
        }

        impl Opcode {
            /// All opcodes in table order.
            pub const ALL: &'static [Opcode] = &[ $( Opcode::$name, )* ];

            /// Decodes an opcode byte.
            pub const fn from_u8(value: u8) -> Option<Opcode> {
                match value {
                    $( $byte => Some(Opcode::$name), )*
                    _ => None,
                }
            }

            /// Returns the assembly mnemonic for this opcode.
            pub const fn mnemonic(&self) -> &'static str {
                match self {
                    $( Opcode::$name => $mnemonic, )*
                }
            }

            /// Returns the encoded length in bytes, opcode included.
            pub const fn size(&self) -> u16 {
                match self {
                    $( Opcode::$name => $size, )*
                }
            }

            /// Returns the features a build must provide to execute this opcode.
            pub const fn features(&self) -> Features {
                match self {
                    $( Opcode::$name => $features, )*
                }
            }
        }
    };
}

for_each_opcode!(define_opcodes);

impl Opcode {
    /// Looks up an opcode by its mnemonic.
    pub fn from_mnemonic(name: &str) -> Option<Opcode> {
        Opcode::ALL
            .iter()
            .copied()
            .find(|op| op.mnemonic().eq_ignore_ascii_case(name))
    }

    /// Returns true if this build can execute the opcode.
    pub const fn is_supported(&self) -> bool {
        self.features().is_subset_of(Features::compiled())
    }
}
