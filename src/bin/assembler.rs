//! Mango assembler CLI.
//!
//! Assembles the modules of one application together and writes one image
//! per module, named after the module.
//!
//! # Usage
//! ```text
//! mango-asm <input.masm>... [OPTIONS]
//! ```
//!
//! # Arguments
//! - `input.masm`: Assembly source files, one module each
//!
//! # Options
//! - `-o, --output <dir>`: Output directory (defaults to the current directory)
//!
//! # Examples
//! ```text
//! mango-asm app.masm
//! mango-asm app.masm util.masm -o build
//! ```

use mango::utils::log;
use mango::virtual_machine::assembler::assemble_files;
use mango::{error, info};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::process;

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

    let mut inputs: Vec<String> = Vec::new();
    let mut output_dir = PathBuf::from(".");

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            k @ ("--output" | "-o") => {
                i += 1;
                if i >= args.len() {
                    error!("{k} requires an argument");
                    process::exit(1);
                }
                output_dir = PathBuf::from(&args[i]);
            }
            other if other.starts_with('-') => {
                error!("Unexpected argument: {}\n", other);
                print_usage(&args[0]);
                process::exit(1);
            }
            input => inputs.push(input.to_string()),
        }
        i += 1;
    }

    if inputs.is_empty() {
        error!("No input files\n");
        print_usage(&args[0]);
        process::exit(1);
    }

    for input in &inputs {
        if !Path::new(input).exists() {
            error!("Input file does not exist: {}", input);
            process::exit(1);
        }
    }

    if !output_dir.is_dir() {
        error!("Output directory does not exist: {}", output_dir.display());
        process::exit(1);
    }

    // Diagnostics for source errors are already on stderr.
    let modules = match assemble_files(&inputs) {
        Ok(modules) => modules,
        Err(e) => {
            error!("Assembly failed: {}", e);
            process::exit(1);
        }
    };

    for (input, module) in inputs.iter().zip(&modules) {
        let output_path = output_dir.join(format!("{}.mgo", module.name));
        if let Err(e) = fs::write(&output_path, &module.image) {
            error!("Failed to write {}: {}", output_path.display(), e);
            process::exit(1);
        }
        info!(
            "Compiled {} -> {} ({} bytes, {} functions)",
            input,
            output_path.display(),
            module.image.len(),
            module.functions.len()
        );
    }
}

const USAGE: &str = "\
Mango Assembler

USAGE:
    {program} <input.masm>... [OPTIONS]

ARGS:
    <input.masm>    Assembly source files; all modules of an application are
                    assembled together so calls between them resolve

OPTIONS:
    -o, --output <dir>      Output directory for <module>.mgo images (defaults to .)
    -h, --help              Print this help message

ENVIRONMENT:
    MANGO_LOG               Log level: trace, debug, info, warn, error

EXAMPLES:
    # Assemble a single-module application
    {program} app.masm

    # Assemble an application and its library into build/
    {program} app.masm util.masm -o build
";

fn print_usage(program: &str) {
    info!("{}", USAGE.replace("{program}", program));
}
