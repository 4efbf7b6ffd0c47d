//! Read-only views over module images.
//!
//! # Image layout
//!
//! ```text
//! +0   magic u8 = 0xFF
//! +1   version u8 (major)
//! +2   attributes u8            TINY = 1, EXECUTABLE = 2
//! +3   import_count u8
//! +4   static_size u16          bytes of zero-filled static data
//! +6   initializer u16          function descriptor offset, 0 = none
//! +8   import names             12 bytes each, zero padded
//! ...  function descriptors and code
//! -8   app info (executable images only)
//!        features u16, stack_size u16 (cells), module_count u8,
//!        main u16, halt u8 (HALT sentinel)
//! ```
//!
//! A function descriptor is `{flags u8, max_stack u8, arg_count u8,
//! loc_count u8}` followed directly by its code.

use crate::virtual_machine::errors::VmError;
use crate::virtual_machine::isa::{Features, Opcode};
use std::fmt;

/// First byte of every image.
pub const IMAGE_MAGIC: u8 = 0xFF;
/// Size of the fixed module descriptor, before the import names.
pub const MODULE_DEF_SIZE: usize = 8;
/// Size of the trailing app-info record of an executable image.
pub const APP_INFO_SIZE: usize = 8;
/// Size of a function descriptor, before its code.
pub const FUNC_DEF_SIZE: u16 = 4;
/// Length of a module name.
pub const NAME_SIZE: usize = 12;
/// Largest accepted image.
pub const MAX_IMAGE_SIZE: usize = u16::MAX as usize;

/// Module attribute bits.
pub mod attributes {
    pub const TINY: u8 = 1;
    pub const EXECUTABLE: u8 = 2;
}

/// Function descriptor flag bits.
pub mod func_flags {
    pub const NAKED: u8 = 1;
    pub const SECURITY_CRITICAL: u8 = 2;
    pub const SECURITY_SAFE_CRITICAL: u8 = 4;
}

/// Fixed-width module name, compared byte for byte.
#[derive(Clone, Copy, Default, Eq, PartialEq, Hash)]
pub struct ModuleName(pub [u8; NAME_SIZE]);

impl ModuleName {
    /// Builds a zero-padded name. Fails if `name` is empty or longer than 12 bytes.
    pub fn new(name: &str) -> Result<Self, VmError> {
        let bytes = name.as_bytes();
        if bytes.is_empty() {
            return Err(VmError::ArgumentNull {
                what: "module name",
            });
        }
        if bytes.len() > NAME_SIZE {
            return Err(VmError::ArgumentInvalid {
                reason: "module name longer than 12 bytes",
            });
        }
        let mut raw = [0u8; NAME_SIZE];
        raw[..bytes.len()].copy_from_slice(bytes);
        Ok(Self(raw))
    }

    pub(crate) fn from_slice(bytes: &[u8]) -> Option<Self> {
        let raw: [u8; NAME_SIZE] = bytes.get(..NAME_SIZE)?.try_into().ok()?;
        Some(Self(raw))
    }

    pub fn as_bytes(&self) -> &[u8; NAME_SIZE] {
        &self.0
    }

    /// Returns the name without its zero padding.
    pub fn trimmed(&self) -> &[u8] {
        let end = self.0.iter().position(|b| *b == 0).unwrap_or(NAME_SIZE);
        &self.0[..end]
    }
}

impl fmt::Display for ModuleName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(self.trimmed()))
    }
}

impl fmt::Debug for ModuleName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ModuleName({self})")
    }
}

fn read_u16(image: &[u8], at: usize) -> Option<u16> {
    let bytes = image.get(at..at + 2)?;
    Some(u16::from_le_bytes([bytes[0], bytes[1]]))
}

/// View over the module descriptor at the start of an image.
///
/// Constructed only for images of at least [`MODULE_DEF_SIZE`] bytes.
#[derive(Clone, Copy)]
pub struct ModuleDef<'i> {
    image: &'i [u8],
}

impl<'i> ModuleDef<'i> {
    pub fn new(image: &'i [u8]) -> Option<Self> {
        (image.len() >= MODULE_DEF_SIZE).then_some(Self { image })
    }

    pub fn image(&self) -> &'i [u8] {
        self.image
    }

    pub fn magic(&self) -> u8 {
        self.image[0]
    }

    pub fn version(&self) -> u8 {
        self.image[1]
    }

    pub fn attributes(&self) -> u8 {
        self.image[2]
    }

    pub fn is_executable(&self) -> bool {
        self.attributes() & attributes::EXECUTABLE != 0
    }

    pub fn import_count(&self) -> u8 {
        self.image[3]
    }

    pub fn static_size(&self) -> u16 {
        read_u16(self.image, 4).unwrap_or(0)
    }

    pub fn initializer(&self) -> u16 {
        read_u16(self.image, 6).unwrap_or(0)
    }

    /// End of the import name table.
    pub fn names_end(&self) -> usize {
        MODULE_DEF_SIZE + NAME_SIZE * self.import_count() as usize
    }

    pub fn import_name(&self, index: u8) -> Option<ModuleName> {
        if index >= self.import_count() {
            return None;
        }
        let at = MODULE_DEF_SIZE + NAME_SIZE * index as usize;
        ModuleName::from_slice(self.image.get(at..)?)
    }

    /// Reads the trailing app-info record. `None` if the image is too short
    /// to hold the descriptor, the import names and the record.
    pub fn app_info(&self) -> Option<AppInfo> {
        let len = self.image.len();
        if len < self.names_end() + APP_INFO_SIZE {
            return None;
        }
        let at = len - APP_INFO_SIZE;
        let tail = &self.image[at..];
        Some(AppInfo {
            features: Features(u16::from_le_bytes([tail[0], tail[1]])),
            stack_size: u16::from_le_bytes([tail[2], tail[3]]),
            module_count: tail[4],
            main: u16::from_le_bytes([tail[5], tail[6]]),
            halt: tail[7],
            halt_offset: (len - 1) as u16,
        })
    }
}

/// Trailing record of an executable image.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct AppInfo {
    pub features: Features,
    /// Stack size in cells.
    pub stack_size: u16,
    pub module_count: u8,
    /// Offset of the main function descriptor, 0 = none.
    pub main: u16,
    /// Must equal the HALT opcode.
    pub halt: u8,
    /// Image offset of the `halt` byte.
    pub halt_offset: u16,
}

impl AppInfo {
    /// The trailing byte doubles as the HALT instruction the VM returns to
    /// once its outermost frame is done. Checking it is a heuristic against
    /// truncated images, not a proof of well-formedness.
    pub fn has_halt_sentinel(&self) -> bool {
        self.halt == Opcode::Halt as u8
    }
}

/// Decoded function descriptor.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FuncDef {
    pub flags: u8,
    pub max_stack: u8,
    pub arg_count: u8,
    pub loc_count: u8,
    /// Image offset of the first instruction.
    pub code: u16,
}

impl FuncDef {
    pub fn read(image: &[u8], offset: u16) -> Option<Self> {
        let at = offset as usize;
        let raw = image.get(at..at + FUNC_DEF_SIZE as usize)?;
        Some(Self {
            flags: raw[0],
            max_stack: raw[1],
            arg_count: raw[2],
            loc_count: raw[3],
            code: offset.checked_add(FUNC_DEF_SIZE)?,
        })
    }

    pub fn is_security_critical(&self) -> bool {
        self.flags & func_flags::SECURITY_CRITICAL != 0
    }

    pub fn is_security_safe_critical(&self) -> bool {
        self.flags & func_flags::SECURITY_SAFE_CRITICAL != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_image() -> Vec<u8> {
        let mut image = vec![IMAGE_MAGIC, 0, attributes::EXECUTABLE, 1, 16, 0, 0, 0];
        image.extend_from_slice(ModuleName::new("lib").unwrap().as_bytes());
        // main at offset 20: naked, max_stack 2, no args, no locals, HALT
        image.extend_from_slice(&[func_flags::NAKED, 2, 0, 0, 0x00]);
        image.extend_from_slice(&[0x03, 0x00, 0x40, 0x00, 0x02, 20, 0x00, 0x00]);
        image
    }

    #[test]
    fn module_def_fields() {
        let image = sample_image();
        let def = ModuleDef::new(&image).unwrap();
        assert_eq!(def.magic(), IMAGE_MAGIC);
        assert!(def.is_executable());
        assert_eq!(def.import_count(), 1);
        assert_eq!(def.static_size(), 16);
        assert_eq!(def.initializer(), 0);
        assert_eq!(def.import_name(0), Some(ModuleName::new("lib").unwrap()));
        assert_eq!(def.import_name(1), None);
    }

    #[test]
    fn app_info_reads_the_tail() {
        let image = sample_image();
        let app = ModuleDef::new(&image).unwrap().app_info().unwrap();
        assert_eq!(app.features, Features(3));
        assert_eq!(app.stack_size, 64);
        assert_eq!(app.module_count, 2);
        assert_eq!(app.main, 20);
        assert!(app.has_halt_sentinel());
        assert_eq!(app.halt_offset as usize, image.len() - 1);
    }

    #[test]
    fn short_images_have_no_app_info() {
        let image = [IMAGE_MAGIC, 0, attributes::EXECUTABLE, 0, 0, 0, 0, 0];
        assert!(ModuleDef::new(&image).unwrap().app_info().is_none());
        assert!(ModuleDef::new(&image[..4]).is_none());
    }

    #[test]
    fn func_def_flags() {
        let image = sample_image();
        let f = FuncDef::read(&image, 20).unwrap();
        assert_eq!(f.max_stack, 2);
        assert_eq!(f.code, 24);
        assert!(!f.is_security_critical());
        assert!(FuncDef::read(&image, image.len() as u16 - 2).is_none());
    }

    #[test]
    fn module_names() {
        let name = ModuleName::new("system").unwrap();
        assert_eq!(name.trimmed(), b"system");
        assert_eq!(name.to_string(), "system");
        assert!(ModuleName::new("").is_err());
        assert!(ModuleName::new("a_very_long_name").is_err());
    }
}
