//! Locating debug information inside a PE image.
//!
//! The Watcom toolchain does not emit standard PE debug sections. Instead it
//! concatenates a small ELF object carrying the DWARF sections to the end of
//! the linked image. Extraction therefore has two stages: look for `.debug_*`
//! sections in the PE itself first, then scan the raw file bytes for an
//! appended ELF container.

use crate::debugger::error::Error;
use log::debug;
use object::{File, FileKind, Object, ObjectSection};
use std::path::Path;

/// ELF magic: 0x7F 'E' 'L' 'F'.
const ELF_MAGIC: &[u8; 4] = b"\x7fELF";

/// Minimum size of a 32-bit ELF header.
const ELF32_HEADER_LEN: usize = 52;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContainerFormat {
    /// DWARF sections embedded in the PE file itself.
    PeSections,
    /// ELF container appended after the PE image contents.
    AppendedElf,
}

/// Parsed view over the part of a PE image that carries DWARF sections.
pub struct DebugContainer<'a> {
    pub format: ContainerFormat,
    pub object: File<'a>,
    /// Offset of the container inside the on-disk image (0 for PE sections).
    pub offset: usize,
}

/// Locate the debug container inside the raw bytes of a PE image.
///
/// Fails with [`Error::NoDebugInfo`] when the image carries neither
/// recognizable `.debug_*` sections nor a valid appended ELF container.
pub fn locate_container<'a>(path: &Path, data: &'a [u8]) -> Result<DebugContainer<'a>, Error> {
    match FileKind::parse(data) {
        Ok(FileKind::Pe32) | Ok(FileKind::Pe64) => {}
        _ => return Err(Error::NoDebugInfo(path.into())),
    }

    if let Some(container) = try_pe_sections(data) {
        debug!(target: "debugger", "{}: dwarf found in pe sections", path.display());
        return Ok(container);
    }

    if let Some(container) = try_appended_elf(data) {
        debug!(
            target: "debugger",
            "{}: dwarf found in appended elf container at {:#x}",
            path.display(),
            container.offset
        );
        return Ok(container);
    }

    Err(Error::NoDebugInfo(path.into()))
}

/// Check the PE image itself for standard DWARF sections.
fn try_pe_sections(data: &[u8]) -> Option<DebugContainer> {
    let object = File::parse(data).ok()?;
    let has_dwarf = object
        .section_by_name(".debug_info")
        .map(|s| s.size() > 0)
        .unwrap_or(false);

    has_dwarf.then_some(DebugContainer {
        format: ContainerFormat::PeSections,
        object,
        offset: 0,
    })
}

/// Scan the raw file for an appended ELF container.
///
/// The container follows all normal PE content, so when several candidate
/// magic sequences appear (the magic may occur inside data sections), the
/// tail-most offset whose header validates wins.
fn try_appended_elf(data: &[u8]) -> Option<DebugContainer> {
    let candidates: Vec<usize> = data
        .windows(ELF_MAGIC.len())
        .enumerate()
        .filter(|(_, w)| w == ELF_MAGIC)
        .map(|(pos, _)| pos)
        .collect();

    for pos in candidates.into_iter().rev() {
        // appending to the PE leaves the container last, offset 0 would be
        // the PE header itself
        if pos == 0 {
            continue;
        }
        let tail = &data[pos..];
        if !elf32_header_is_plausible(tail) {
            continue;
        }
        match File::parse(tail) {
            Ok(object) => {
                return Some(DebugContainer {
                    format: ContainerFormat::AppendedElf,
                    object,
                    offset: pos,
                })
            }
            Err(e) => {
                debug!(target: "debugger", "elf candidate at {pos:#x} rejected: {e}");
            }
        }
    }

    None
}

/// Cheap pre-validation of a candidate before full object parsing:
/// a little-endian 32-bit ELF header of the current format version.
fn elf32_header_is_plausible(tail: &[u8]) -> bool {
    const EI_CLASS: usize = 4;
    const EI_DATA: usize = 5;
    const EI_VERSION: usize = 6;
    const ELFCLASS32: u8 = 1;
    const ELFDATA2LSB: u8 = 1;
    const EV_CURRENT: u8 = 1;

    tail.len() >= ELF32_HEADER_LEN
        && tail[EI_CLASS] == ELFCLASS32
        && tail[EI_DATA] == ELFDATA2LSB
        && tail[EI_VERSION] == EV_CURRENT
}
