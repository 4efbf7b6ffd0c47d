//! Mango VM runner.
//!
//! Loads an executable module image, imports every module it depends on from
//! a module directory and runs the application, servicing its syscalls.
//!
//! # Usage
//! ```text
//! mango <app.mgo> [OPTIONS]
//! mango --demo
//! ```
//!
//! # Options
//! - `--modules <dir>`: Directory holding imported modules as `<name>.mgo`
//!   (defaults to the directory of the startup image)
//! - `--arena <bytes>`: Size of the VM memory block (defaults to 65536)
//! - `--trusted <name>`: Import the module as trusted; may be repeated
//! - `--trust-all`: Import every module as trusted
//! - `--demo`: Run a built-in two-module program
//!
//! # Syscalls
//! | id | arguments (top first) | effect                      |
//! |----|-----------------------|-----------------------------|
//! | 1  | i32                   | print the value             |
//! | 2  | i64                   | print the value             |
//! | 3  | f64                   | print the value             |
//! | 4  | ref, length           | write the bytes to stdout   |
//!
//! The log level is read from `MANGO_LOG` (`trace` to `error`).

use mango::utils::aligned::AlignedBuffer;
use mango::utils::log;
use mango::virtual_machine::assembler::assemble_program;
use mango::virtual_machine::errors::VmError;
use mango::virtual_machine::image::{ModuleDef, ModuleName};
use mango::virtual_machine::vm::{ImportFlags, Outcome, Suspended, Vm};
use mango::virtual_machine::version_string;
use mango::{error, info, warn};
use std::collections::{HashMap, VecDeque};
use std::env;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process;

const DEFAULT_ARENA: usize = 64 * 1024;
const IMAGE_EXTENSION: &str = "mgo";

mod syscall {
    pub const PRINT_I32: u16 = 1;
    pub const PRINT_I64: u16 = 2;
    pub const PRINT_F64: u16 = 3;
    pub const WRITE: u16 = 4;
}

const DEMO_APP: &str = "
.module demo
.executable
.stack 128
.import math
.main main

.func main safe
    LDC_I32_S 10
    CALL math.fib
    SYSCALL 1 1         # print fib(10)
    LDC_X64 2.5
    LDC_X64 4.0
    MUL_F64
    SYSCALL 2 3         # print 10
    LDC_I32_3
    NEWARR 1
    DUP_X64
    LDC_I32_0
    LDC_I32_S 79
    STELEM_X8
    DUP_X64
    LDC_I32_1
    LDC_I32_S 75
    STELEM_X8
    DUP_X64
    LDC_I32_2
    LDC_I32_S 10
    STELEM_X8
    SYSCALL 2 4         # write \"OK\\n\"
    RET
";

const DEMO_MATH: &str = "
.module math
.init setup

.func setup safe
    LDC_I32_S 42
    SYSCALL 1 1
    RET

# fib(n) with a = index 0, b = index 1, n = index 2 on an empty operand stack
.func fib args=1 locals=2 stack=4
    LDC_I32_0
    STLOC_X32 1
    LDC_I32_1
    STLOC_X32 2
loop:
    LDLOC_X32 2
    BRFALSE_S done
    LDLOC_X32 0
    LDLOC_X32 2
    ADD_I32
    LDLOC_X32 2
    STLOC_X32 2
    STLOC_X32 2
    LDLOC_X32 2
    LDC_I32_1
    SUB_I32
    STLOC_X32 3
    BR_S loop
done:
    LDLOC_X32 0
    RET_X32
";

struct Options {
    image: Option<String>,
    modules: Option<PathBuf>,
    arena: usize,
    trusted: Vec<String>,
    trust_all: bool,
    demo: bool,
}

/// Module images of one application, keyed by module name.
struct Program {
    startup: ModuleName,
    images: HashMap<ModuleName, Vec<u8>>,
}

fn main() {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 || args[1] == "--help" || args[1] == "-h" {
        print_usage(&args[0]);
        process::exit(if args.len() < 2 { 1 } else { 0 });
    }

    if let Err(e) = log::init_from_env() {
        eprintln!("{}: {e}", log::LOG_ENV);
        process::exit(1);
    }

    let options = parse_args(&args).unwrap_or_else(|e| {
        error!("{e}\n");
        print_usage(&args[0]);
        process::exit(1);
    });

    let program = if options.demo {
        demo_program()
    } else {
        match &options.image {
            Some(path) => load_program(Path::new(path), options.modules.as_deref()),
            None => Err("no startup image given".to_string()),
        }
    };

    let program = program.unwrap_or_else(|e| {
        error!("{e}");
        process::exit(1);
    });

    if let Err(e) = run(&program, &options) {
        error!("{e}");
        process::exit(1);
    }
}

fn parse_args(args: &[String]) -> Result<Options, String> {
    let mut options = Options {
        image: None,
        modules: None,
        arena: DEFAULT_ARENA,
        trusted: Vec::new(),
        trust_all: false,
        demo: false,
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            k @ ("--modules" | "--arena" | "--trusted") => {
                i += 1;
                let value = args
                    .get(i)
                    .ok_or_else(|| format!("{k} requires an argument"))?;
                match k {
                    "--modules" => options.modules = Some(PathBuf::from(value)),
                    "--arena" => {
                        options.arena = value
                            .parse()
                            .map_err(|_| format!("Invalid arena size: '{value}'"))?;
                    }
                    _ => options.trusted.push(value.clone()),
                }
            }
            "--trust-all" => options.trust_all = true,
            "--demo" => options.demo = true,
            other if other.starts_with('-') => {
                return Err(format!("Unexpected argument: {other}"));
            }
            path if options.image.is_none() => options.image = Some(path.to_string()),
            other => return Err(format!("Unexpected argument: {other}")),
        }
        i += 1;
    }

    if options.demo && options.image.is_some() {
        return Err("--demo takes no image".to_string());
    }
    Ok(options)
}

fn module_name(text: &str) -> Result<ModuleName, String> {
    ModuleName::new(text).map_err(|e| format!("module name '{text}': {e}"))
}

/// Reads the startup image and, transitively, every image it imports.
fn load_program(path: &Path, modules: Option<&Path>) -> Result<Program, String> {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .ok_or_else(|| format!("not a module image: {}", path.display()))?;
    let startup = module_name(&stem)?;
    let dir = modules
        .map(Path::to_path_buf)
        .or_else(|| path.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."));

    let read = |file: &Path| {
        fs::read(file).map_err(|e| format!("Failed to read {}: {e}", file.display()))
    };

    let mut images = HashMap::new();
    images.insert(startup, read(path)?);
    let mut pending = VecDeque::from([startup]);

    while let Some(name) = pending.pop_front() {
        let def = images
            .get(&name)
            .and_then(|image| ModuleDef::new(image))
            .ok_or_else(|| format!("module {name} is too short to be an image"))?;
        let imports: Vec<ModuleName> = (0..def.import_count())
            .map(|slot| def.import_name(slot))
            .collect::<Option<_>>()
            .ok_or_else(|| format!("module {name} has truncated import names"))?;

        for import in imports {
            if images.contains_key(&import) {
                continue;
            }
            let file = dir.join(format!("{import}.{IMAGE_EXTENSION}"));
            images.insert(import, read(&file)?);
            pending.push_back(import);
        }
    }

    Ok(Program { startup, images })
}

fn demo_program() -> Result<Program, String> {
    let modules =
        assemble_program(&[DEMO_APP, DEMO_MATH]).map_err(|e| format!("demo assembly: {e}"))?;
    let startup = modules[0].name;
    let images = modules
        .into_iter()
        .map(|module| (module.name, module.image))
        .collect();
    Ok(Program { startup, images })
}

fn vm_error(e: VmError) -> String {
    format!("{e} (code {})", e.code())
}

fn run(program: &Program, options: &Options) -> Result<(), String> {
    let trust = |name: &ModuleName| {
        let trusted = options.trust_all
            || options.demo
            || options.trusted.iter().any(|t| t.as_bytes() == name.trimmed());
        if trusted {
            ImportFlags::SKIP_VERIFICATION | ImportFlags::TRUSTED_MODULE
        } else {
            ImportFlags::SKIP_VERIFICATION
        }
    };

    let mut arena = AlignedBuffer::new(options.arena);
    let mut vm = Vm::initialize(&mut arena, 0, 0).map_err(vm_error)?;
    info!("mango {} running {}", version_string(), program.startup);

    let startup = program
        .images
        .get(&program.startup)
        .ok_or_else(|| format!("module {} was not loaded", program.startup))?;
    vm.module_import(&program.startup, startup, 0, trust(&program.startup))
        .map_err(vm_error)?;

    let mut context = 1;
    while let Some(name) = vm.module_missing() {
        let image = program
            .images
            .get(&name)
            .ok_or_else(|| format!("module {name} was not loaded"))?;
        vm.module_import(&name, image, context, trust(&name))
            .map_err(vm_error)?;
        context += 1;
    }

    loop {
        match vm.execute().map_err(vm_error)? {
            Outcome::Completed => break,
            Outcome::Syscall(call) => service(&mut vm, call)?,
        }
    }

    info!(
        "{} completed, {} of {} arena bytes free",
        program.startup,
        vm.heap_available(),
        vm.heap_size()
    );
    Ok(())
}

fn service(vm: &mut Vm<'_>, call: Suspended) -> Result<(), String> {
    let mut out = io::stdout().lock();
    let written = match call.syscall {
        syscall::PRINT_I32 => writeln!(out, "{}", vm.pop_i32().map_err(vm_error)?),
        syscall::PRINT_I64 => writeln!(out, "{}", vm.pop_i64().map_err(vm_error)?),
        syscall::PRINT_F64 => writeln!(out, "{}", vm.pop_f64().map_err(vm_error)?),
        syscall::WRITE => {
            let data = vm.pop_ref().map_err(vm_error)?;
            let len = vm.pop_i32().map_err(vm_error)?;
            if len <= 0 {
                Ok(())
            } else {
                out.write_all(vm.resolve(data, len as u32).map_err(vm_error)?)
            }
        }
        other => return Err(format!("unknown syscall {other}")),
    };
    written.map_err(|e| format!("Failed to write output: {e}"))?;

    if vm.stack_pointer() != call.sp_expected {
        warn!(
            "syscall {} left the operand cursor at {}, expected {}",
            call.syscall,
            vm.stack_pointer(),
            call.sp_expected
        );
    }
    Ok(())
}

const USAGE: &str = "\
Mango VM runner

USAGE:
    {program} <app.mgo> [OPTIONS]
    {program} --demo

ARGS:
    <app.mgo>    Executable module image to run

OPTIONS:
    --modules <dir>     Directory of imported <name>.mgo images (defaults to the image's directory)
    --arena <bytes>     VM memory block size (defaults to 65536)
    --trusted <name>    Import module <name> as trusted (repeatable)
    --trust-all         Import every module as trusted
    --demo              Run the built-in demo program
    -h, --help          Print this help message

ENVIRONMENT:
    MANGO_LOG           Log level: trace, debug, info, warn, error

EXAMPLES:
    # Run an application whose modules sit next to it
    {program} build/app.mgo --trusted app

    # Assemble then run
    mango-asm app.masm util.masm -o build && {program} build/app.mgo --trusted app
";

fn print_usage(program: &str) {
    info!("{}", USAGE.replace("{program}", program));
}
