//! Embeddable stack-based bytecode virtual machine.
//!
//! The VM runs inside one caller-supplied memory block and never allocates
//! from the OS heap. Bytecode is organized in modules; a startup module
//! declares the stack size and the number of modules, every further module
//! is imported on demand by name.
//!
//! # Architecture
//!
//! - **Arena**: a 64-byte header followed by a bump-allocated heap; every
//!   internal pointer is an offset so the block can be copied and reattached
//! - **Stack**: one cell array shared by return frames (growing up) and
//!   operands (growing down)
//! - **Execution model**: initializers run once in dependency order, then
//!   `main`; syscalls suspend execution and hand control to the host
//! - **Trust**: functions run sandboxed or in full trust, elevation only
//!   through security-safe-critical functions of trusted modules
//!
//! # Modules
//!
//! - [`arena`]: Arena header layout and position-independent references
//! - [`assembler`]: Text assembler producing module images
//! - [`errors`]: Result codes and assembler errors
//! - [`image`]: Module image, app info and function descriptor views
//! - [`isa`]: Opcode table and feature bits
//! - [`vm`]: The virtual machine and its host API

pub mod arena;
pub mod assembler;
pub mod errors;
pub mod image;
pub mod isa;
pub mod vm;

use isa::Features;

/// Major version; images and arenas carry it and must match.
pub const VERSION_MAJOR: u8 = 0;
pub const VERSION_MINOR: u8 = 33;
pub const VERSION_STRING: &str = env!("CARGO_PKG_VERSION");

pub const fn version_major() -> u8 {
    VERSION_MAJOR
}

pub const fn version_minor() -> u8 {
    VERSION_MINOR
}

/// Returns the packed version, major in the high byte.
pub const fn version() -> u16 {
    ((VERSION_MAJOR as u16) << 8) | VERSION_MINOR as u16
}

/// Returns a human-readable version string.
pub const fn version_string() -> &'static str {
    VERSION_STRING
}

/// Returns the features this build can execute.
pub const fn features() -> Features {
    Features::compiled()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_packs_major_and_minor() {
        assert_eq!(version() >> 8, version_major() as u16);
        assert_eq!(version() & 0xFF, version_minor() as u16);
        assert_eq!(version_string(), "0.33.0");
    }

    #[test]
    fn default_build_has_every_feature() {
        let all = Features::I64
            .union(Features::F32)
            .union(Features::F64)
            .union(Features::REFS);
        if cfg!(all(feature = "i64", feature = "f32", feature = "f64", feature = "refs")) {
            assert_eq!(features(), all);
        }
        assert!(features().is_subset_of(all));
    }
}
