//! Module loader and dependency resolver.
//!
//! Every module gets a 32-byte record in the module table:
//!
//! ```text
//! +0  context u64       +12 init_next u8     +16 imports ref
//! +8  image_size u16    +13 init_prev u8     +20 static_data ref
//! +10 index u8          +14 name_module u8   +24 state u8 (visited)
//! +11 import flags u8   +15 name_index u8
//! ```
//!
//! A module's name is not stored in its record: it is the import name at
//! `name_index` inside the image of module `name_module`. Module 0 is named
//! by the `app_name` header field.
//!
//! Initializer order comes from a queue threaded through `init_next` /
//! `init_prev`. It starts as `[0]` and is processed depth first: an unvisited
//! head gets its unvisited imports spliced in front of it, a visited head is
//! dequeued and its initializer runs.

use super::{AllocFlags, INVALID_MODULE, ImportFlags, MAX_MODULES, Vm};
use crate::virtual_machine::arena::{Ref, header};
use crate::virtual_machine::errors::VmError;
use crate::virtual_machine::image::{
    IMAGE_MAGIC, MAX_IMAGE_SIZE, MODULE_DEF_SIZE, ModuleDef, ModuleName, NAME_SIZE,
};
use crate::virtual_machine::vm::context::Frame;
use crate::virtual_machine::{VERSION_MAJOR, features};
use crate::{debug, info};

const RECORD_SIZE: u32 = 32;

mod record {
    pub const CONTEXT: u32 = 0;
    pub const IMAGE_SIZE: u32 = 8;
    pub const INDEX: u32 = 10;
    pub const FLAGS: u32 = 11;
    pub const INIT_NEXT: u32 = 12;
    pub const INIT_PREV: u32 = 13;
    pub const NAME_MODULE: u32 = 14;
    pub const NAME_INDEX: u32 = 15;
    pub const IMPORTS: u32 = 16;
    pub const STATIC_DATA: u32 = 20;
    pub const STATE: u32 = 24;
}

const VISITED: u8 = 1;

const CORRUPT: VmError = VmError::InvalidOperation {
    reason: "module table lies outside the arena",
};

impl<'a> Vm<'a> {
    fn record(&self, module: u8, field: u32) -> u32 {
        self.arena.hdr_u32(header::MODULES) + module as u32 * RECORD_SIZE + field
    }

    pub(super) fn rec_u8(&self, module: u8, field: u32) -> Result<u8, VmError> {
        self.arena.load_u8(self.record(module, field)).ok_or(CORRUPT)
    }

    fn set_rec_u8(&mut self, module: u8, field: u32, value: u8) -> Result<(), VmError> {
        let at = self.record(module, field);
        self.arena.store_u8(at, value).ok_or(CORRUPT)
    }

    fn rec_u32(&self, module: u8, field: u32) -> Result<u32, VmError> {
        self.arena.load_u32(self.record(module, field)).ok_or(CORRUPT)
    }

    fn set_rec_u32(&mut self, module: u8, field: u32, value: u32) -> Result<(), VmError> {
        let at = self.record(module, field);
        self.arena.store_u32(at, value).ok_or(CORRUPT)
    }

    pub(super) fn module_image_size(&self, module: u8) -> Result<u16, VmError> {
        self.arena
            .load_u16(self.record(module, record::IMAGE_SIZE))
            .ok_or(CORRUPT)
    }

    /// Image bound to `module`. Module indices read back from the arena are
    /// not trusted.
    pub(super) fn image(&self, module: u8) -> Result<&'a [u8], VmError> {
        self.images
            .get(module as usize)
            .copied()
            .ok_or_else(|| self.fault("module index out of range"))
    }

    pub(super) fn module_flags(&self, module: u8) -> Result<ImportFlags, VmError> {
        Ok(ImportFlags(self.rec_u8(module, record::FLAGS)?))
    }

    /// Module index bound to import `slot` of `module`.
    pub(super) fn import_of(&self, module: u8, slot: u8) -> Result<Option<u8>, VmError> {
        let count = ModuleDef::new(self.image(module)?).map_or(0, |def| def.import_count());
        if slot >= count {
            return Ok(None);
        }
        let imports = self.rec_u32(module, record::IMPORTS)?;
        self.arena
            .load_u8(imports + slot as u32)
            .map(Some)
            .ok_or(CORRUPT)
    }

    fn module_name(&self, module: u8) -> Result<ModuleName, VmError> {
        if module == 0 {
            let raw = self
                .arena
                .slice(header::APP_NAME, NAME_SIZE as u32)
                .and_then(ModuleName::from_slice);
            return raw.ok_or(CORRUPT);
        }
        let name_module = self.rec_u8(module, record::NAME_MODULE)?;
        let name_index = self.rec_u8(module, record::NAME_INDEX)?;
        ModuleDef::new(self.image(name_module)?)
            .and_then(|def| def.import_name(name_index))
            .ok_or(CORRUPT)
    }

    /// Returns the module registered under `name`, registering it if new.
    fn get_or_create_module(
        &mut self,
        name: &ModuleName,
        name_module: u8,
        name_index: u8,
    ) -> Result<u8, VmError> {
        let created = self.arena.hdr_u8(header::MODULES_CREATED);
        for index in 0..created {
            if self.module_name(index)? == *name {
                return Ok(index);
            }
        }

        if created >= self.arena.hdr_u8(header::MODULE_CAPACITY) {
            return Err(VmError::BadImageFormat {
                reason: "more modules imported than the application declares",
            });
        }
        self.arena.set_hdr_u8(header::MODULES_CREATED, created + 1);
        self.set_rec_u8(created, record::INDEX, created)?;
        self.set_rec_u8(created, record::NAME_MODULE, name_module)?;
        self.set_rec_u8(created, record::NAME_INDEX, name_index)?;
        self.set_rec_u8(created, record::INIT_NEXT, INVALID_MODULE)?;
        self.set_rec_u8(created, record::INIT_PREV, INVALID_MODULE)?;
        debug!("registered module {created} ({name})");
        Ok(created)
    }

    /// Binds the imports of a freshly imported module and allocates its
    /// static data.
    fn initialize_module(&mut self, module: u8) -> Result<(), VmError> {
        let image = self.image(module)?;
        let def = ModuleDef::new(image).ok_or(CORRUPT)?;

        let count = def.import_count();
        if count != 0 {
            let imports = self.heap_alloc(count as u32, 1, 1, AllocFlags::NONE)?;
            for slot in 0..count {
                let name = def.import_name(slot).ok_or(CORRUPT)?;
                let index = self.get_or_create_module(&name, module, slot)?;
                self.arena
                    .store_u8(imports.offset() + slot as u32, index)
                    .ok_or(CORRUPT)?;
            }
            self.set_rec_u32(module, record::IMPORTS, imports.offset())?;
        }

        let static_size = def.static_size();
        if static_size != 0 {
            let data = self.heap_alloc(1, static_size as u32, 4, AllocFlags::ZERO_MEMORY)?;
            self.set_rec_u32(module, record::STATIC_DATA, data.offset())?;
        }
        Ok(())
    }

    /// Imports a module image.
    ///
    /// The first call imports the startup module; every later call must
    /// supply the module reported by [`Vm::module_missing`].
    pub fn module_import(
        &mut self,
        name: &ModuleName,
        image: &'a [u8],
        context: usize,
        flags: ImportFlags,
    ) -> Result<(), VmError> {
        if image.is_empty() {
            return Err(VmError::ArgumentNull { what: "image" });
        }
        if image.len() < MODULE_DEF_SIZE || image.len() > MAX_IMAGE_SIZE {
            return Err(VmError::ArgumentInvalid {
                reason: "image size outside the supported range",
            });
        }
        if image[0] != IMAGE_MAGIC || image[1] != VERSION_MAJOR {
            return Err(VmError::BadImageFormat {
                reason: "wrong image magic or version",
            });
        }
        if !flags.contains(ImportFlags::SKIP_VERIFICATION) {
            return Err(VmError::VerificationRequired);
        }

        let imported = self.arena.hdr_u8(header::MODULES_IMPORTED);
        if imported == 0 {
            self.import_startup_module(name, image, context, flags)
        } else if imported != self.arena.hdr_u8(header::MODULES_CREATED) {
            self.import_missing_module(name, image, context, flags)
        } else {
            Err(VmError::InvalidOperation {
                reason: "no module is missing",
            })
        }
    }

    fn import_startup_module(
        &mut self,
        name: &ModuleName,
        image: &'a [u8],
        context: usize,
        flags: ImportFlags,
    ) -> Result<(), VmError> {
        let def = ModuleDef::new(image).ok_or(CORRUPT)?;
        if !def.is_executable() {
            return Err(VmError::BadImageFormat {
                reason: "startup image is not executable",
            });
        }
        let app = def.app_info().ok_or(VmError::BadImageFormat {
            reason: "startup image has no app info",
        })?;
        if !app.features.is_subset_of(features()) {
            return Err(VmError::NotSupported {
                required: app.features.0,
                available: features().0,
            });
        }
        if !app.has_halt_sentinel() {
            return Err(VmError::BadImageFormat {
                reason: "startup image does not end with HALT",
            });
        }
        if app.module_count == 0 || app.module_count as usize > MAX_MODULES {
            return Err(VmError::BadImageFormat {
                reason: "module count out of range",
            });
        }

        if self.stack_base().is_null() {
            self.stack_create(app.stack_size as u32 * 4)?;
        }

        let modules = self.heap_alloc(
            app.module_count as u32,
            RECORD_SIZE,
            4,
            AllocFlags::ZERO_MEMORY,
        )?;

        if let Some(slot) = self.arena.slice_mut(header::APP_NAME, NAME_SIZE as u32) {
            slot.copy_from_slice(name.as_bytes());
        }
        self.arena.set_hdr_u32(header::MODULES, modules.offset());
        self.arena.set_hdr_u8(header::MODULE_CAPACITY, app.module_count);
        self.arena.set_hdr_u8(header::MODULES_CREATED, 1);
        self.arena.set_hdr_u8(header::MODULES_IMPORTED, 1);
        self.arena
            .set_hdr_u32(header::FRAME, Frame::new(false, 0, 0, app.halt_offset).0);

        self.images[0] = image;
        self.arena
            .store_u64(self.record(0, record::CONTEXT), context as u64)
            .ok_or(CORRUPT)?;
        self.arena
            .store_u16(self.record(0, record::IMAGE_SIZE), image.len() as u16)
            .ok_or(CORRUPT)?;
        self.set_rec_u8(0, record::INDEX, 0)?;
        self.set_rec_u8(0, record::FLAGS, flags.0)?;
        self.set_rec_u8(0, record::INIT_NEXT, INVALID_MODULE)?;
        self.set_rec_u8(0, record::INIT_PREV, INVALID_MODULE)?;
        self.set_rec_u8(0, record::NAME_MODULE, INVALID_MODULE)?;
        self.set_rec_u8(0, record::NAME_INDEX, INVALID_MODULE)?;
        info!(
            "imported startup module {name} ({} bytes, {} modules declared)",
            image.len(),
            app.module_count
        );

        self.initialize_module(0)
    }

    fn import_missing_module(
        &mut self,
        name: &ModuleName,
        image: &'a [u8],
        context: usize,
        flags: ImportFlags,
    ) -> Result<(), VmError> {
        let index = self.arena.hdr_u8(header::MODULES_IMPORTED);
        if self.module_name(index)? != *name {
            return Err(VmError::InvalidOperation {
                reason: "image name differs from the missing module",
            });
        }
        let def = ModuleDef::new(image).ok_or(CORRUPT)?;
        if def.names_end() > image.len() {
            return Err(VmError::BadImageFormat {
                reason: "import names extend past the image",
            });
        }

        self.arena.set_hdr_u8(header::MODULES_IMPORTED, index + 1);
        *self.images.get_mut(index as usize).ok_or(CORRUPT)? = image;
        self.arena
            .store_u64(self.record(index, record::CONTEXT), context as u64)
            .ok_or(CORRUPT)?;
        self.arena
            .store_u16(self.record(index, record::IMAGE_SIZE), image.len() as u16)
            .ok_or(CORRUPT)?;
        self.set_rec_u8(index, record::FLAGS, flags.0)?;
        self.set_rec_u8(index, record::INIT_NEXT, INVALID_MODULE)?;
        self.set_rec_u8(index, record::INIT_PREV, INVALID_MODULE)?;
        info!("imported module {index} {name} ({} bytes)", image.len());

        self.initialize_module(index)
    }

    /// Name of the next module to import, `None` once all are present.
    pub fn module_missing(&self) -> Option<ModuleName> {
        let imported = self.arena.hdr_u8(header::MODULES_IMPORTED);
        if imported == self.arena.hdr_u8(header::MODULES_CREATED) {
            return None;
        }
        self.module_name(imported).ok()
    }

    /// Context of the module owning the current frame.
    ///
    /// `None` until every module has been imported.
    pub fn module_context(&self) -> Option<usize> {
        let imported = self.arena.hdr_u8(header::MODULES_IMPORTED);
        if imported == 0 || imported != self.arena.hdr_u8(header::MODULES_CREATED) {
            return None;
        }
        let module = Frame(self.arena.hdr_u32(header::FRAME)).module();
        self.arena
            .load_u64(self.record(module, record::CONTEXT))
            .map(|context| context as usize)
    }

    /// Static data block of an imported module and its length in bytes.
    pub fn module_static_data(&self, module: u8) -> Option<(Ref, u32)> {
        if module >= self.arena.hdr_u8(header::MODULES_IMPORTED) {
            return None;
        }
        let size = ModuleDef::new(self.image(module).ok()?)?.static_size();
        let data = self.rec_u32(module, record::STATIC_DATA).ok()?;
        (size != 0).then_some((Ref(data), size as u32))
    }

    /// Advances the initializer queue until a module whose initializer must
    /// run is dequeued. Returns `(module, initializer offset)`.
    pub(super) fn next_initializer(&mut self) -> Result<Option<(u8, u16)>, VmError> {
        loop {
            let head = self.arena.hdr_u8(header::MODULE_INIT_HEAD);
            if head == INVALID_MODULE {
                return Ok(None);
            }
            let def = ModuleDef::new(self.image(head)?).ok_or(CORRUPT)?;

            let state = self.rec_u8(head, record::STATE)?;
            if state & VISITED == 0 {
                self.set_rec_u8(head, record::STATE, state | VISITED)?;
                let mut first = head;
                for slot in 0..def.import_count() {
                    let Some(import) = self.import_of(head, slot)? else {
                        break;
                    };
                    if self.rec_u8(import, record::STATE)? & VISITED != 0 || import == first {
                        continue;
                    }
                    self.unlink(import)?;
                    self.set_rec_u8(first, record::INIT_PREV, import)?;
                    self.set_rec_u8(import, record::INIT_NEXT, first)?;
                    self.set_rec_u8(import, record::INIT_PREV, INVALID_MODULE)?;
                    first = import;
                }
                self.arena.set_hdr_u8(header::MODULE_INIT_HEAD, first);
            } else {
                let next = self.rec_u8(head, record::INIT_NEXT)?;
                self.arena.set_hdr_u8(header::MODULE_INIT_HEAD, next);
                self.set_rec_u8(head, record::INIT_NEXT, INVALID_MODULE)?;
                self.set_rec_u8(head, record::INIT_PREV, INVALID_MODULE)?;
                if next != INVALID_MODULE {
                    self.set_rec_u8(next, record::INIT_PREV, INVALID_MODULE)?;
                }
                if def.initializer() != 0 {
                    return Ok(Some((head, def.initializer())));
                }
            }
        }
    }

    /// Removes a module from the initializer queue, if it is queued.
    fn unlink(&mut self, module: u8) -> Result<(), VmError> {
        let prev = self.rec_u8(module, record::INIT_PREV)?;
        let next = self.rec_u8(module, record::INIT_NEXT)?;
        if prev != INVALID_MODULE {
            self.set_rec_u8(prev, record::INIT_NEXT, next)?;
        }
        if next != INVALID_MODULE {
            self.set_rec_u8(next, record::INIT_PREV, prev)?;
        }
        Ok(())
    }
}
