//! Text assembler producing module images.
//!
//! # Syntax
//!
//! ```text
//! .module app            # module name, 1 to 12 bytes
//! .executable            # startup module: the image ends with the app info record
//! .stack 64              # stack capacity in cells (default 64)
//! .modules 3             # modules the application declares
//! .import util           # import slots are numbered in declaration order
//! .static 16             # bytes of zeroed static data
//! .init setup            # initializer, run once before main
//! .main main             # entry point of an executable module
//! .features f64          # extra feature bits: i64, f32, f64, refs
//!
//! .func main args=0 locals=1 stack=4 safe
//!     LDC_I32_3
//! again:
//!     LDC_I32_1, SUB_I32
//!     DUP_X32
//!     BRTRUE_S again
//!     POP_X32
//!     CALL util.helper
//!     RET
//! ```
//!
//! - Mnemonics are case-insensitive; commas between operands are optional
//! - `#` starts a comment
//! - Function options are `args=`, `locals=`, `stack=` (cells of operand
//!   headroom, default 8) and the flags `naked`, `critical`, `safe`
//! - Branches take a label of the enclosing function or a raw offset
//! - `CALL` and `LDFTN` take `name` for a function of the same module or
//!   `module.name` for a function of an imported module
//! - `LDC_X32` and `LDC_X64` accept integers or floats (`1.5`, `-0.25`, `inf`)
//! - Feature bits required by the opcodes used are added automatically
//!
//! [`assemble_program`] assembles all modules of an application together so
//! calls across modules, including cyclic imports, resolve to descriptor
//! offsets.

use crate::virtual_machine::VERSION_MAJOR;
use crate::virtual_machine::errors::AsmError;
use crate::virtual_machine::image::{
    APP_INFO_SIZE, FUNC_DEF_SIZE, IMAGE_MAGIC, MAX_IMAGE_SIZE, MODULE_DEF_SIZE, ModuleName,
    NAME_SIZE, attributes, func_flags,
};
use crate::virtual_machine::isa::{Features, Opcode};
use crate::virtual_machine::vm::{MAX_MODULES, SELF_SLOT};
use std::collections::{HashMap, HashSet};
use std::fmt::Write;
use std::fs;
use std::path::Path;

const COMMENT_CHAR: char = '#';
const LABEL_SUFFIX: char = ':';
const DIRECTIVE_PREFIX: char = '.';
const DEFAULT_STACK_CELLS: u16 = 64;
const DEFAULT_MAX_STACK: u8 = 8;

/// One assembled module.
#[derive(Debug, Clone)]
pub struct Assembled {
    pub name: ModuleName,
    pub image: Vec<u8>,
    /// Descriptor offset of every function, by name.
    pub functions: HashMap<String, u16>,
}

#[derive(Debug, Clone, Copy)]
struct Token<'s> {
    text: &'s str,
    line: usize,
    /// 1-based column offset in the line.
    column: usize,
}

impl<'s> Token<'s> {
    fn invalid(&self, reason: &'static str) -> AsmError {
        AsmError::InvalidOperand {
            line: self.line,
            column: self.column,
            token: self.text.to_string(),
            reason,
        }
    }

    fn syntax(&self, message: &'static str) -> AsmError {
        AsmError::Syntax {
            line: self.line,
            column: self.column,
            message,
        }
    }

    fn arity(&self, expected: usize, actual: usize) -> AsmError {
        AsmError::ArityMismatch {
            line: self.line,
            column: self.column,
            mnemonic: self.text.to_string(),
            expected,
            actual,
        }
    }
}

/// Splits one line on whitespace and commas, dropping the comment.
fn tokenize(line_no: usize, line: &str) -> Vec<Token<'_>> {
    let code = line.split(COMMENT_CHAR).next().unwrap_or("");
    let mut out = Vec::with_capacity(4);
    let mut start: Option<usize> = None;

    for (i, c) in code.char_indices() {
        let separator = c.is_whitespace() || c == ',';
        match (separator, start) {
            (true, Some(s)) => {
                out.push(Token {
                    text: &code[s..i],
                    line: line_no,
                    column: s + 1,
                });
                start = None;
            }
            (false, None) => start = Some(i),
            _ => {}
        }
    }
    if let Some(s) = start {
        out.push(Token {
            text: &code[s..],
            line: line_no,
            column: s + 1,
        });
    }
    out
}

/// Parses a decimal or `0x` hexadecimal integer with an optional sign.
fn parse_int(text: &str) -> Option<i128> {
    let (negative, body) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text),
    };
    let value = match body.strip_prefix("0x").or_else(|| body.strip_prefix("0X")) {
        Some(hex) => i128::from_str_radix(hex, 16).ok()?,
        None if body.starts_with(|c: char| c.is_ascii_digit()) => body.parse::<i128>().ok()?,
        None => return None,
    };
    Some(if negative { -value } else { value })
}

fn number<T: TryFrom<i128>>(tok: &Token, reason: &'static str) -> Result<T, AsmError> {
    parse_int(tok.text)
        .and_then(|v| T::try_from(v).ok())
        .ok_or_else(|| tok.invalid(reason))
}

fn module_name(tok: &Token) -> Result<ModuleName, AsmError> {
    ModuleName::new(tok.text).map_err(|_| tok.invalid("module names are 1 to 12 bytes"))
}

fn is_label_def(tok: &str) -> bool {
    tok.ends_with(LABEL_SUFFIX) && tok.len() > 1
}

// =========================
// Parsed source
// =========================

enum Item<'s> {
    Label(Token<'s>),
    Instr {
        op: Opcode,
        mnemonic: Token<'s>,
        operands: Vec<Token<'s>>,
    },
}

struct Function<'s> {
    name: Token<'s>,
    flags: u8,
    max_stack: u8,
    args: u8,
    locals: u8,
    body: Vec<Item<'s>>,
}

struct Unit<'s> {
    name: ModuleName,
    name_text: &'s str,
    executable: bool,
    stack: u16,
    modules: Option<u8>,
    imports: Vec<(ModuleName, &'s str)>,
    static_size: u16,
    init: Option<Token<'s>>,
    main: Option<Token<'s>>,
    features: Features,
    functions: Vec<Function<'s>>,
}

#[derive(Default)]
struct Header<'s> {
    name: Option<(ModuleName, &'s str)>,
    executable: bool,
    stack: Option<u16>,
    modules: Option<u8>,
    imports: Vec<(ModuleName, &'s str)>,
    static_size: u16,
    init: Option<Token<'s>>,
    main: Option<Token<'s>>,
    features: Features,
}

fn expect_args(directive: &Token, args: &[Token], count: usize) -> Result<(), AsmError> {
    if args.len() != count {
        return Err(directive.arity(count, args.len()));
    }
    Ok(())
}

fn parse_feature(tok: &Token) -> Result<Features, AsmError> {
    match tok.text.to_ascii_lowercase().as_str() {
        "i64" => Ok(Features::I64),
        "f32" => Ok(Features::F32),
        "f64" => Ok(Features::F64),
        "refs" => Ok(Features::REFS),
        _ => Err(tok.invalid("unknown feature")),
    }
}

fn parse_function<'s>(directive: &Token<'s>, args: &[Token<'s>]) -> Result<Function<'s>, AsmError> {
    let (name, options) = args
        .split_first()
        .ok_or_else(|| directive.arity(1, 0))?;
    let mut function = Function {
        name: *name,
        flags: 0,
        max_stack: DEFAULT_MAX_STACK,
        args: 0,
        locals: 0,
        body: Vec::new(),
    };
    for option in options {
        match option.text.split_once('=') {
            Some((key @ ("args" | "locals" | "stack"), value)) => {
                let value = Token {
                    text: value,
                    column: option.column + key.len() + 1,
                    ..*option
                };
                let cells = number::<u8>(&value, "expected a cell count from 0 to 255")?;
                match key {
                    "args" => function.args = cells,
                    "locals" => function.locals = cells,
                    _ => function.max_stack = cells,
                }
            }
            None if option.text == "naked" => function.flags |= func_flags::NAKED,
            None if option.text == "critical" => function.flags |= func_flags::SECURITY_CRITICAL,
            None if option.text == "safe" => function.flags |= func_flags::SECURITY_SAFE_CRITICAL,
            _ => return Err(option.invalid("unknown function option")),
        }
    }
    Ok(function)
}

fn directive<'s>(
    header: &mut Header<'s>,
    functions: &mut Vec<Function<'s>>,
    tok: &Token<'s>,
    args: &[Token<'s>],
) -> Result<(), AsmError> {
    match &tok.text[1..] {
        "module" => {
            expect_args(tok, args, 1)?;
            if header.name.is_some() {
                return Err(tok.syntax("module name declared twice"));
            }
            header.name = Some((module_name(&args[0])?, args[0].text));
        }
        "executable" => {
            expect_args(tok, args, 0)?;
            header.executable = true;
        }
        "stack" => {
            expect_args(tok, args, 1)?;
            header.stack = Some(number(&args[0], "expected a cell count from 0 to 65535")?);
        }
        "modules" => {
            expect_args(tok, args, 1)?;
            let count: u8 = number(&args[0], "expected a module count from 1 to 255")?;
            if count == 0 {
                return Err(args[0].invalid("expected a module count from 1 to 255"));
            }
            header.modules = Some(count);
        }
        "import" => {
            expect_args(tok, args, 1)?;
            if header.imports.len() >= MAX_MODULES - 1 {
                return Err(tok.syntax("too many imports"));
            }
            header.imports.push((module_name(&args[0])?, args[0].text));
        }
        "static" => {
            expect_args(tok, args, 1)?;
            header.static_size = number(&args[0], "expected a size from 0 to 65535")?;
        }
        "init" => {
            expect_args(tok, args, 1)?;
            header.init = Some(args[0]);
        }
        "main" => {
            expect_args(tok, args, 1)?;
            header.main = Some(args[0]);
        }
        "features" => {
            for arg in args {
                header.features = header.features.union(parse_feature(arg)?);
            }
        }
        "func" => functions.push(parse_function(tok, args)?),
        _ => {
            return Err(AsmError::UnknownDirective {
                line: tok.line,
                column: tok.column,
                name: tok.text.to_string(),
            });
        }
    }
    Ok(())
}

fn parse(source: &str) -> Result<Unit<'_>, AsmError> {
    let mut header = Header::default();
    let mut functions: Vec<Function> = Vec::new();

    for (line_no, line) in source.lines().enumerate() {
        let tokens = tokenize(line_no + 1, line);
        let Some(first) = tokens.first() else {
            continue;
        };
        if first.text.starts_with(DIRECTIVE_PREFIX) {
            directive(&mut header, &mut functions, first, &tokens[1..])?;
            continue;
        }

        let function = functions
            .last_mut()
            .ok_or_else(|| first.syntax("code outside a .func block"))?;
        let mut rest = &tokens[..];
        if is_label_def(first.text) {
            function.body.push(Item::Label(*first));
            rest = &tokens[1..];
        }
        let Some((mnemonic, operands)) = rest.split_first() else {
            continue;
        };
        let op = Opcode::from_mnemonic(mnemonic.text).ok_or_else(|| AsmError::UnknownMnemonic {
            line: mnemonic.line,
            column: mnemonic.column,
            name: mnemonic.text.to_string(),
        })?;
        function.body.push(Item::Instr {
            op,
            mnemonic: *mnemonic,
            operands: operands.to_vec(),
        });
    }

    let (name, name_text) = header.name.ok_or(AsmError::Syntax {
        line: 1,
        column: 1,
        message: "missing .module directive",
    })?;
    if let Some(main) = header.main
        && !header.executable
    {
        return Err(main.syntax(".main requires an .executable module"));
    }

    Ok(Unit {
        name,
        name_text,
        executable: header.executable,
        stack: header.stack.unwrap_or(DEFAULT_STACK_CELLS),
        modules: header.modules,
        imports: header.imports,
        static_size: header.static_size,
        init: header.init,
        main: header.main,
        features: header.features,
        functions,
    })
}

// =========================
// Layout
// =========================

/// Descriptor and label offsets of one module.
struct Layout<'s> {
    functions: HashMap<String, u16>,
    labels: Vec<HashMap<&'s str, u16>>,
    size: usize,
}

fn layout<'s>(unit: &Unit<'s>) -> Result<Layout<'s>, AsmError> {
    let mut functions = HashMap::new();
    let mut labels = Vec::with_capacity(unit.functions.len());
    let mut at = MODULE_DEF_SIZE + NAME_SIZE * unit.imports.len();

    for function in &unit.functions {
        let name = function.name;
        if functions.insert(name.text.to_string(), at as u16).is_some() {
            return Err(AsmError::DuplicateFunction {
                line: name.line,
                column: name.column,
                name: name.text.to_string(),
            });
        }
        at += FUNC_DEF_SIZE as usize;

        let mut scope = HashMap::new();
        for item in &function.body {
            match item {
                Item::Label(tok) => {
                    let label = &tok.text[..tok.text.len() - 1];
                    if scope.insert(label, at as u16).is_some() {
                        return Err(AsmError::DuplicateLabel {
                            line: tok.line,
                            column: tok.column,
                            label: label.to_string(),
                        });
                    }
                }
                Item::Instr { op, .. } => at += op.size() as usize,
            }
        }
        labels.push(scope);
    }

    if unit.executable {
        at += APP_INFO_SIZE;
    }
    if at > MAX_IMAGE_SIZE {
        return Err(AsmError::ImageTooLarge {
            name: unit.name_text.to_string(),
            size: at,
        });
    }
    Ok(Layout {
        functions,
        labels,
        size: at,
    })
}

// =========================
// Emission
// =========================

/// Symbols visible while encoding one function.
struct Scope<'u, 's> {
    unit: &'u Unit<'s>,
    functions: &'u HashMap<String, u16>,
    labels: &'u HashMap<&'s str, u16>,
    program: &'u HashMap<ModuleName, &'u HashMap<String, u16>>,
}

impl<'u, 's> Scope<'u, 's> {
    fn local_function(&self, tok: &Token) -> Result<u16, AsmError> {
        self.functions
            .get(tok.text)
            .copied()
            .ok_or_else(|| AsmError::UndefinedFunction {
                line: tok.line,
                column: tok.column,
                name: tok.text.to_string(),
            })
    }

    /// Resolves `name` or `module.name` to an import slot and descriptor offset.
    fn function(&self, tok: &Token) -> Result<(u8, u16), AsmError> {
        let Some((module, name)) = tok.text.split_once('.') else {
            return Ok((SELF_SLOT, self.local_function(tok)?));
        };
        let undefined = || AsmError::UndefinedFunction {
            line: tok.line,
            column: tok.column,
            name: tok.text.to_string(),
        };
        if module == self.unit.name_text {
            let offset = self.functions.get(name).copied().ok_or_else(undefined)?;
            return Ok((SELF_SLOT, offset));
        }

        let (slot, (target, _)) = self
            .unit
            .imports
            .iter()
            .enumerate()
            .find(|(_, (_, text))| *text == module)
            .ok_or_else(|| AsmError::UnknownModule {
                line: tok.line,
                column: tok.column,
                name: module.to_string(),
            })?;
        let offset = self
            .program
            .get(target)
            .and_then(|functions| functions.get(name))
            .copied()
            .ok_or_else(undefined)?;
        Ok((slot as u8, offset))
    }

    /// Offset from the end of the branch at `ip` to its target.
    fn branch(&self, tok: &Token, ip: u16, op: Opcode) -> Result<i64, AsmError> {
        if let Some(raw) = parse_int(tok.text) {
            return i64::try_from(raw).map_err(|_| tok.invalid("branch offset out of range"));
        }
        let target = self
            .labels
            .get(tok.text)
            .copied()
            .ok_or_else(|| AsmError::UndefinedLabel {
                line: tok.line,
                column: tok.column,
                label: tok.text.to_string(),
            })?;
        Ok(target as i64 - (ip as i64 + op.size() as i64))
    }
}

/// Number of operand tokens an opcode takes.
fn operand_count(op: Opcode) -> usize {
    match op {
        Opcode::Syscall => 2,
        _ if op.size() > 1 => 1,
        _ => 0,
    }
}

fn encode(
    op: Opcode,
    operands: &[Token],
    ip: u16,
    scope: &Scope,
    out: &mut Vec<u8>,
) -> Result<(), AsmError> {
    match op {
        Opcode::LdlocX32 | Opcode::LdlocX64 | Opcode::Ldloca | Opcode::StlocX32 | Opcode::StlocX64 => {
            out.push(number::<u8>(&operands[0], "expected a local index from 0 to 255")?);
        }
        Opcode::LdcI32S => {
            out.push(number::<i8>(&operands[0], "expected a value from -128 to 127")? as u8);
        }
        Opcode::BrS | Opcode::BrfalseS | Opcode::BrtrueS => {
            let offset = scope.branch(&operands[0], ip, op)?;
            let offset = i8::try_from(offset)
                .map_err(|_| operands[0].invalid("target out of short branch range"))?;
            out.push(offset as u8);
        }
        Opcode::Br | Opcode::Brfalse | Opcode::Brtrue => {
            let offset = scope.branch(&operands[0], ip, op)?;
            let offset = i16::try_from(offset)
                .map_err(|_| operands[0].invalid("target out of branch range"))?;
            out.extend_from_slice(&offset.to_le_bytes());
        }
        Opcode::Call | Opcode::Ldftn => {
            let (slot, offset) = scope.function(&operands[0])?;
            out.push(slot);
            out.extend_from_slice(&offset.to_le_bytes());
        }
        Opcode::Syscall => {
            out.push(number::<i8>(&operands[0], "expected a cursor adjustment from -128 to 127")? as u8);
            let id: u16 = number(&operands[1], "expected a syscall id from 0 to 65535")?;
            out.extend_from_slice(&id.to_le_bytes());
        }
        Opcode::LdcX32 => {
            let tok = &operands[0];
            let bits = match parse_int(tok.text) {
                Some(v) if (i32::MIN as i128..=u32::MAX as i128).contains(&v) => v as u32,
                Some(_) => return Err(tok.invalid("value does not fit in 32 bits")),
                None => tok
                    .text
                    .parse::<f32>()
                    .map_err(|_| tok.invalid("expected an integer or a float"))?
                    .to_bits(),
            };
            out.extend_from_slice(&bits.to_le_bytes());
        }
        Opcode::LdcX64 => {
            let tok = &operands[0];
            let bits = match parse_int(tok.text) {
                Some(v) if (i64::MIN as i128..=u64::MAX as i128).contains(&v) => v as u64,
                Some(_) => return Err(tok.invalid("value does not fit in 64 bits")),
                None => tok
                    .text
                    .parse::<f64>()
                    .map_err(|_| tok.invalid("expected an integer or a float"))?
                    .to_bits(),
            };
            out.extend_from_slice(&bits.to_le_bytes());
        }
        _ if op.size() == 3 => {
            let value: u16 = number(&operands[0], "expected a value from 0 to 65535")?;
            out.extend_from_slice(&value.to_le_bytes());
        }
        _ => {}
    }
    Ok(())
}

fn emit(
    unit: &Unit,
    layout: &Layout,
    program: &HashMap<ModuleName, &HashMap<String, u16>>,
    module_count: u8,
) -> Result<Assembled, AsmError> {
    let mut image = Vec::with_capacity(layout.size);
    let mut features = unit.features;

    let resolve = |tok: &Option<Token>| -> Result<u16, AsmError> {
        match tok {
            None => Ok(0),
            Some(tok) => layout
                .functions
                .get(tok.text)
                .copied()
                .ok_or_else(|| AsmError::UndefinedFunction {
                    line: tok.line,
                    column: tok.column,
                    name: tok.text.to_string(),
                }),
        }
    };
    let init = resolve(&unit.init)?;
    let main = resolve(&unit.main)?;

    let attributes = if unit.executable {
        attributes::EXECUTABLE
    } else {
        0
    };
    image.extend_from_slice(&[IMAGE_MAGIC, VERSION_MAJOR, attributes, unit.imports.len() as u8]);
    image.extend_from_slice(&unit.static_size.to_le_bytes());
    image.extend_from_slice(&init.to_le_bytes());
    for (name, _) in &unit.imports {
        image.extend_from_slice(name.as_bytes());
    }

    for (function, labels) in unit.functions.iter().zip(&layout.labels) {
        image.extend_from_slice(&[function.flags, function.max_stack, function.args, function.locals]);
        let scope = Scope {
            unit,
            functions: &layout.functions,
            labels,
            program,
        };
        for item in &function.body {
            let Item::Instr {
                op,
                mnemonic,
                operands,
            } = item
            else {
                continue;
            };
            let expected = operand_count(*op);
            if operands.len() != expected {
                return Err(mnemonic.arity(expected, operands.len()));
            }
            features = features.union(op.features());
            let ip = image.len() as u16;
            image.push(*op as u8);
            encode(*op, operands, ip, &scope, &mut image)?;
        }
    }

    if unit.executable {
        image.extend_from_slice(&features.0.to_le_bytes());
        image.extend_from_slice(&unit.stack.to_le_bytes());
        image.push(unit.modules.unwrap_or(module_count));
        image.extend_from_slice(&main.to_le_bytes());
        image.push(Opcode::Halt as u8);
    }
    debug_assert_eq!(image.len(), layout.size);

    Ok(Assembled {
        name: unit.name,
        image,
        functions: layout.functions.clone(),
    })
}

/// Assembles `units` together. Errors carry the index of the unit at fault.
fn build(
    units: &[Unit],
    default_modules: impl Fn(&Unit) -> u8,
) -> Result<Vec<Assembled>, (Option<usize>, AsmError)> {
    let mut seen = HashSet::new();
    for unit in units {
        if !seen.insert(unit.name) {
            return Err((
                None,
                AsmError::DuplicateModule {
                    name: unit.name_text.to_string(),
                },
            ));
        }
    }

    let layouts = units
        .iter()
        .enumerate()
        .map(|(index, unit)| layout(unit).map_err(|e| (Some(index), e)))
        .collect::<Result<Vec<_>, _>>()?;
    let program: HashMap<ModuleName, &HashMap<String, u16>> = units
        .iter()
        .zip(&layouts)
        .map(|(unit, layout)| (unit.name, &layout.functions))
        .collect();

    units
        .iter()
        .zip(&layouts)
        .enumerate()
        .map(|(index, (unit, layout))| {
            emit(unit, layout, &program, default_modules(unit)).map_err(|e| (Some(index), e))
        })
        .collect()
}

fn parse_all<'s>(sources: &[&'s str]) -> Result<Vec<Unit<'s>>, (Option<usize>, AsmError)> {
    sources
        .iter()
        .enumerate()
        .map(|(index, &source)| parse(source).map_err(|e| (Some(index), e)))
        .collect()
}

fn clamp_modules(count: usize) -> u8 {
    count.min(MAX_MODULES) as u8
}

/// Assembles a single module.
///
/// Calls into imported modules cannot be resolved here; use
/// [`assemble_program`] for those. The declared module count defaults to
/// the module itself plus its imports.
pub fn assemble(source: &str) -> Result<Assembled, AsmError> {
    let unit = parse(source)?;
    let mut modules = build(std::slice::from_ref(&unit), |unit| {
        clamp_modules(1 + unit.imports.len())
    })
    .map_err(|(_, e)| e)?;
    Ok(modules.remove(0))
}

fn assemble_indexed(sources: &[&str]) -> Result<Vec<Assembled>, (Option<usize>, AsmError)> {
    let units = parse_all(sources)?;
    let count = clamp_modules(units.len());
    build(&units, |_| count)
}

/// Assembles every module of an application, resolving calls across modules.
///
/// The declared module count of an executable defaults to the number of
/// sources.
pub fn assemble_program(sources: &[&str]) -> Result<Vec<Assembled>, AsmError> {
    assemble_indexed(sources).map_err(|(_, e)| e)
}

/// Formats a compiler-style diagnostic for an assembly failure.
pub fn render_diagnostic(file: &str, source: &str, err: &AsmError) -> String {
    let mut diag = String::new();
    let _ = writeln!(diag, "error: {err}");
    let Some((line, column)) = err.location() else {
        return diag;
    };
    let _ = writeln!(diag, " --> {file}:{line}:{column}");

    if let Some(raw_line) = source.lines().nth(line.saturating_sub(1)) {
        let line_text = raw_line.trim_end_matches('\r');
        let underline = " ".repeat(column.saturating_sub(1));
        let _ = writeln!(diag, "  |");
        let _ = writeln!(diag, "{:>4} | {}", line, line_text);
        let _ = writeln!(diag, "  | {}^", underline);
    }
    diag
}

/// Assembles the modules stored in `paths` as one program.
///
/// On failure the diagnostic for the offending file is written to stderr.
pub fn assemble_files<P: AsRef<Path>>(paths: &[P]) -> Result<Vec<Assembled>, AsmError> {
    let sources = paths
        .iter()
        .map(|path| {
            let path = path.as_ref();
            fs::read_to_string(path).map_err(|e| AsmError::Io {
                path: path.display().to_string(),
                reason: e.to_string(),
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    let borrowed: Vec<&str> = sources.iter().map(String::as_str).collect();

    assemble_indexed(&borrowed).map_err(|(index, err)| {
        match index {
            Some(index) => {
                let file = paths[index].as_ref().display().to_string();
                eprint!("{}", render_diagnostic(&file, &sources[index], &err));
            }
            None => eprint!("{}", render_diagnostic("<program>", "", &err)),
        }
        err
    })
}
