use thiserror::Error;

/// Errors returned by the host API and faults raised by the interpreter.
///
/// Host-API errors (argument, state and image validation) are synchronous and
/// leave the VM untouched. Interpreter faults abort the current `execute` call;
/// the arena stays structurally intact and the cursors are written back.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VmError {
    /// A required input was empty.
    #[error("argument null: {what}")]
    ArgumentNull { what: &'static str },
    /// An argument is out of range, misaligned or otherwise malformed.
    #[error("invalid argument: {reason}")]
    ArgumentInvalid { reason: &'static str },
    /// The call is not valid in the current VM state.
    #[error("invalid operation: {reason}")]
    InvalidOperation { reason: &'static str },
    /// The arena has no room left for the request.
    #[error("out of memory: requested {requested} bytes, {available} available")]
    OutOfMemory { requested: u64, available: u32 },
    /// The module image is malformed.
    #[error("bad image format: {reason}")]
    BadImageFormat { reason: &'static str },
    /// The image requires features this build does not provide.
    #[error("not supported: image requires features {required:#06x}, build provides {available:#06x}")]
    NotSupported { required: u16, available: u16 },
    /// Images must be imported with the skip-verification flag.
    #[error("verification required: bytecode verification is not available")]
    VerificationRequired,
    /// Not enough room between the return and operand cursors.
    #[error("stack overflow: needed {needed} cells, {available} available")]
    StackOverflow { needed: u32, available: u32 },
    /// The operand cursor is not where it must be.
    #[error("stack imbalance: expected cursor {expected}, found {actual}")]
    StackImbalance { expected: u16, actual: u16 },
    /// A sandboxed frame tried to enter a security-critical function.
    #[error("security violation in module {module} at {ip:#06x}")]
    SecurityViolation { module: u8, ip: u16 },
    /// The bytecode cannot be executed.
    #[error("invalid program in module {module} at {ip:#06x}: {reason}")]
    InvalidProgram {
        module: u8,
        ip: u16,
        reason: &'static str,
    },
    /// Integer division or remainder by zero.
    #[error("divide by zero")]
    DivideByZero,
    /// Signed integer arithmetic overflowed.
    #[error("arithmetic overflow")]
    Overflow,
    /// Dereference of a null reference.
    #[error("null reference")]
    NullReference,
    /// Array index outside `[0, length)`.
    #[error("index {index} out of range for length {length}")]
    IndexOutOfRange { index: i32, length: i32 },
    /// A BREAK opcode was executed.
    #[error("breakpoint")]
    Breakpoint,
}

impl VmError {
    /// Returns the stable numeric result code for this error.
    ///
    /// Success is 0 and a syscall yield is 1; every fault is negative.
    pub const fn code(&self) -> i32 {
        match self {
            VmError::ArgumentNull { .. } => -1,
            VmError::ArgumentInvalid { .. } => -2,
            VmError::InvalidOperation { .. } => -3,
            VmError::OutOfMemory { .. } => -4,
            VmError::BadImageFormat { .. } => -5,
            VmError::NotSupported { .. } => -6,
            VmError::VerificationRequired => -7,
            VmError::StackOverflow { .. } => -8,
            VmError::StackImbalance { .. } => -9,
            VmError::SecurityViolation { .. } => -10,
            VmError::InvalidProgram { .. } => -11,
            VmError::DivideByZero => -12,
            VmError::NullReference => -13,
            VmError::IndexOutOfRange { .. } => -14,
            VmError::Breakpoint => -15,
            VmError::Overflow => -16,
        }
    }
}

/// Errors raised while assembling module source text.
///
/// Line and column are 1-based and point at the offending token.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AsmError {
    #[error("unknown mnemonic `{name}`")]
    UnknownMnemonic {
        line: usize,
        column: usize,
        name: String,
    },
    #[error("unknown directive `{name}`")]
    UnknownDirective {
        line: usize,
        column: usize,
        name: String,
    },
    #[error("{mnemonic} expects {expected} operand(s), found {actual}")]
    ArityMismatch {
        line: usize,
        column: usize,
        mnemonic: String,
        expected: usize,
        actual: usize,
    },
    #[error("invalid operand `{token}`: {reason}")]
    InvalidOperand {
        line: usize,
        column: usize,
        token: String,
        reason: &'static str,
    },
    #[error("duplicate label `{label}`")]
    DuplicateLabel {
        line: usize,
        column: usize,
        label: String,
    },
    #[error("undefined label `{label}`")]
    UndefinedLabel {
        line: usize,
        column: usize,
        label: String,
    },
    #[error("duplicate function `{name}`")]
    DuplicateFunction {
        line: usize,
        column: usize,
        name: String,
    },
    #[error("undefined function `{name}`")]
    UndefinedFunction {
        line: usize,
        column: usize,
        name: String,
    },
    #[error("module `{name}` is not imported here")]
    UnknownModule {
        line: usize,
        column: usize,
        name: String,
    },
    #[error("{message}")]
    Syntax {
        line: usize,
        column: usize,
        message: &'static str,
    },
    #[error("duplicate module `{name}`")]
    DuplicateModule { name: String },
    #[error("image of module `{name}` is {size} bytes, the limit is 65535")]
    ImageTooLarge { name: String, size: usize },
    #[error("cannot read {path}: {reason}")]
    Io { path: String, reason: String },
}

impl AsmError {
    /// Returns the (line, column) the error points at, if any.
    pub fn location(&self) -> Option<(usize, usize)> {
        match self {
            AsmError::UnknownMnemonic { line, column, .. }
            | AsmError::UnknownDirective { line, column, .. }
            | AsmError::ArityMismatch { line, column, .. }
            | AsmError::InvalidOperand { line, column, .. }
            | AsmError::DuplicateLabel { line, column, .. }
            | AsmError::UndefinedLabel { line, column, .. }
            | AsmError::DuplicateFunction { line, column, .. }
            | AsmError::UndefinedFunction { line, column, .. }
            | AsmError::UnknownModule { line, column, .. }
            | AsmError::Syntax { line, column, .. } => Some((*line, *column)),
            AsmError::DuplicateModule { .. }
            | AsmError::ImageTooLarge { .. }
            | AsmError::Io { .. } => None,
        }
    }
}
