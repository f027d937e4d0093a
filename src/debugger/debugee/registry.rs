use crate::debugger::address::{GlobalAddress, RelocatedAddress};
use crate::debugger::debugee::dwarf::{DebugInformation, SourcePlace};
use crate::debugger::error::Error;
use crate::weak_error;
use log::info;
use object::{LittleEndian, Object};
use std::fmt::{Display, Formatter};
use std::fs;
use std::path::{Path, PathBuf};

/// Stable identifier of a loaded module within one session.
#[derive(Clone, Copy, Hash, PartialEq, Eq, Debug, PartialOrd, Ord)]
pub struct ModuleId(u32);

impl Display for ModuleId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// A symbol exported by a PE image, address kept module-relative.
#[derive(Clone, Debug)]
pub struct ExportedSymbol {
    pub name: String,
    pub address: GlobalAddress,
}

/// A loaded image: the executable or a dynamic library.
pub struct Module {
    pub id: ModuleId,
    pub name: String,
    pub path: PathBuf,
    pub base: RelocatedAddress,
    pub size: u32,
    pub debug_info: Option<DebugInformation>,
    pub exports: Vec<ExportedSymbol>,
}

impl Module {
    /// True if a relocated address falls inside this image. Images whose
    /// size is unknown only have their base to compare against, the registry
    /// compensates by picking the nearest base below the address.
    pub fn contains(&self, addr: RelocatedAddress) -> bool {
        if self.size == 0 {
            return addr >= self.base;
        }
        addr >= self.base && addr.as_u32() < self.base.as_u32().saturating_add(self.size)
    }

    #[inline(always)]
    pub fn to_global(&self, addr: RelocatedAddress) -> GlobalAddress {
        addr.remove_base(self.base)
    }

    #[inline(always)]
    pub fn to_relocated(&self, addr: GlobalAddress) -> RelocatedAddress {
        addr.relocate(self.base)
    }

    pub fn has_debug_info(&self) -> bool {
        self.debug_info.is_some()
    }

    /// The nearest exported symbol at or below a relocated address.
    pub fn export_for_address(&self, addr: RelocatedAddress) -> Option<&ExportedSymbol> {
        let rel = self.to_global(addr);
        self.exports
            .iter()
            .filter(|sym| sym.address <= rel)
            .max_by_key(|sym| sym.address)
    }
}

/// Snapshot of a module entry for external observers.
#[derive(Clone, Debug)]
pub struct ModuleView {
    pub name: String,
    pub path: String,
    pub base: RelocatedAddress,
    pub size: u32,
    pub has_debug_info: bool,
    pub export_count: usize,
}

impl Module {
    pub fn view(&self) -> ModuleView {
        ModuleView {
            name: self.name.clone(),
            path: self.path.to_string_lossy().to_string(),
            base: self.base,
            size: self.size,
            has_debug_info: self.has_debug_info(),
            export_count: self.exports.len(),
        }
    }
}

/// All modules of one debuggee, executable first, dynamic libraries in load
/// order. The order is significant: source line resolution scans modules in
/// this order and the first hit wins.
#[derive(Default)]
pub struct ModuleRegistry {
    modules: Vec<Module>,
    next_id: u32,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly loaded image and try to extract its debug
    /// information. Missing or malformed debug data leaves the module usable,
    /// just without a line index.
    pub fn add(&mut self, path: &Path, base: RelocatedAddress) -> ModuleId {
        self.next_id += 1;
        let id = ModuleId(self.next_id);

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| format!("module_{base}"));

        let mut size = 0;
        let mut exports = vec![];
        let mut debug_info = None;
        match fs::File::open(path).and_then(|f| unsafe { memmap2::Mmap::map(&f) }) {
            Ok(mmap) => {
                size = image_size(&mmap).unwrap_or(0);
                exports = image_exports(&mmap).unwrap_or_default();
                debug_info = weak_error!(
                    DebugInformation::from_image(path, &mmap),
                    "module debug info:"
                );
            }
            Err(e) => {
                log::warn!(target: "debugger", "{}: image not readable: {e}", path.display());
            }
        }

        info!(
            target: "debugger",
            "module loaded: {name} at {base}, {}",
            if debug_info.is_some() { "dwarf 2 debug info" } else { "no debug info" }
        );

        self.modules.push(Module {
            id,
            name,
            path: path.to_path_buf(),
            base,
            size,
            debug_info,
            exports,
        });
        id
    }

    pub fn remove_by_base(&mut self, base: RelocatedAddress) -> Option<Module> {
        let pos = self.modules.iter().position(|m| m.base == base)?;
        Some(self.modules.remove(pos))
    }

    pub fn get(&self, id: ModuleId) -> Option<&Module> {
        self.modules.iter().find(|m| m.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Module> {
        self.modules.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Find the module owning a relocated address.
    pub fn lookup_by_address(&self, addr: RelocatedAddress) -> Option<&Module> {
        self.modules
            .iter()
            .filter(|m| m.contains(addr))
            .max_by_key(|m| m.base)
    }

    /// Resolve `path:line` to a relocated address. Modules are scanned in
    /// registry order, the first module able to resolve the location wins.
    pub fn resolve_line_to_address(
        &self,
        path: &str,
        line: u64,
    ) -> Option<(RelocatedAddress, &Module)> {
        self.modules.iter().find_map(|module| {
            let index = module.debug_info.as_ref()?.line_index();
            let rel = index.line_to_address(path, line)?;
            Some((module.to_relocated(rel), module))
        })
    }

    /// Resolve a relocated address to the source location implementing it.
    pub fn resolve_address_to_line(
        &self,
        addr: RelocatedAddress,
    ) -> Option<(SourcePlace, &Module)> {
        let module = self.lookup_by_address(addr)?;
        let index = module.debug_info.as_ref()?.line_index();
        let place = index.address_to_line(module.to_global(addr))?;
        Some((place, module))
    }
}

fn image_size(data: &[u8]) -> Result<u32, Error> {
    let pe = object::read::pe::PeFile32::parse(data)?;
    Ok(pe
        .nt_headers()
        .optional_header
        .size_of_image
        .get(LittleEndian))
}

fn image_exports(data: &[u8]) -> Result<Vec<ExportedSymbol>, Error> {
    let object = object::File::parse(data)?;
    let image_base = object.relative_address_base();
    Ok(object
        .exports()?
        .into_iter()
        .map(|export| ExportedSymbol {
            name: String::from_utf8_lossy(export.name()).to_string(),
            address: GlobalAddress::from(export.address().wrapping_sub(image_base)),
        })
        .collect())
}
