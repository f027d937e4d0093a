pub mod pe;
pub mod unit;

use crate::debugger::address::GlobalAddress;
use crate::debugger::debugee::dwarf::pe::ContainerFormat;
use crate::debugger::debugee::dwarf::unit::{DwarfUnitParser, Unit};
use crate::debugger::error::Error;
use log::warn;
use std::borrow::Cow;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::{fs, mem};

pub type EndianArcSlice = gimli::EndianArcSlice<gimli::RunTimeEndian>;

/// Debug information of a single image: the parsed line number index plus
/// provenance of the container it came from.
pub struct DebugInformation {
    path: PathBuf,
    format: ContainerFormat,
    line_index: LineIndex,
}

impl DebugInformation {
    /// Extract and parse debug information from an image on disk.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let file = fs::File::open(path)?;
        let mmap = unsafe { memmap2::Mmap::map(&file)? };
        Self::from_image(path, &mmap)
    }

    /// Extract and parse debug information from raw image bytes.
    pub fn from_image(path: &Path, data: &[u8]) -> Result<Self, Error> {
        let container = pe::locate_container(path, data)?;
        let dwarf = load_dwarf(&container.object)?;

        let parser = DwarfUnitParser::new(&dwarf);
        let mut units: Vec<Unit> = vec![];
        let mut headers = dwarf.units();
        loop {
            match headers.next() {
                Ok(Some(header)) => {
                    if header.version() != 2 {
                        warn!(
                            target: "debugger",
                            "{}: skip dwarf {} unit, only version 2 is supported",
                            path.display(),
                            header.version()
                        );
                        continue;
                    }
                    match parser.parse(header) {
                        Ok(unit) => units.push(unit),
                        Err(e) => {
                            warn!(target: "debugger", "{}: skip malformed unit: {e}", path.display());
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(target: "debugger", "{}: stop unit iteration: {e}", path.display());
                    break;
                }
            }
        }

        Ok(Self {
            path: path.to_path_buf(),
            format: container.format,
            line_index: LineIndex::build(units),
        })
    }

    pub fn pathname(&self) -> &Path {
        &self.path
    }

    pub fn format(&self) -> ContainerFormat {
        self.format
    }

    pub fn line_index(&self) -> &LineIndex {
        &self.line_index
    }
}

fn load_dwarf(object: &object::File) -> Result<gimli::Dwarf<EndianArcSlice>, Error> {
    use object::{Object, ObjectSection};

    let endian = if object.is_little_endian() {
        gimli::RunTimeEndian::Little
    } else {
        gimli::RunTimeEndian::Big
    };

    let loader = |id: gimli::SectionId| -> Result<EndianArcSlice, gimli::Error> {
        let data = object
            .section_by_name(id.name())
            .and_then(|section| section.uncompressed_data().ok())
            .unwrap_or(Cow::Borrowed(&[]));
        Ok(gimli::EndianArcSlice::new(Arc::from(&*data), endian))
    };
    Ok(gimli::Dwarf::load(loader)?)
}

/// A source location produced by line index lookups.
#[derive(Debug, Clone, PartialEq)]
pub struct SourcePlace {
    pub file: PathBuf,
    pub line: u64,
    pub column: u64,
    pub address: GlobalAddress,
    pub is_stmt: bool,
}

#[derive(Debug, Clone)]
struct IndexRow {
    address: u64,
    file: usize,
    line: u64,
    column: u64,
    is_stmt: bool,
    end_sequence: bool,
}

#[derive(Clone, Copy)]
struct LocationSlot {
    address: u64,
    is_stmt: bool,
}

/// Bidirectional mapping between module-relative addresses and source
/// locations, merged over all compilation units of one image.
pub struct LineIndex {
    files: Vec<PathBuf>,
    /// Ordered by address; a row carrying `end_sequence` closes the address
    /// range opened by the rows before it.
    rows: Vec<IndexRow>,
    by_location: HashMap<(String, u64), LocationSlot>,
    by_basename: HashMap<(String, u64), LocationSlot>,
}

impl LineIndex {
    pub(crate) fn build(units: Vec<Unit>) -> Self {
        let mut files: Vec<PathBuf> = vec![];
        let mut file_ids: HashMap<PathBuf, usize> = HashMap::new();
        let mut rows: Vec<IndexRow> = vec![];

        for mut unit in units {
            let unit_files = mem::take(&mut unit.files);
            let remap: Vec<usize> = unit_files
                .into_iter()
                .map(|path| match file_ids.entry(path) {
                    Entry::Occupied(o) => *o.get(),
                    Entry::Vacant(v) => {
                        files.push(v.key().clone());
                        *v.insert(files.len() - 1)
                    }
                })
                .collect();

            for line in &unit.lines {
                rows.push(IndexRow {
                    address: line.address,
                    file: remap[line.file],
                    line: line.line,
                    column: line.column,
                    is_stmt: line.is_stmt(),
                    end_sequence: line.end_sequence(),
                });
            }
        }

        rows.sort_by_key(|row| row.address);

        let mut by_location: HashMap<(String, u64), LocationSlot> = HashMap::new();
        let mut by_basename: HashMap<(String, u64), LocationSlot> = HashMap::new();
        for row in rows.iter().filter(|row| !row.end_sequence && row.line != 0) {
            let slot = LocationSlot {
                address: row.address,
                is_stmt: row.is_stmt,
            };
            let normalized = normalize_path(&files[row.file].to_string_lossy());
            insert_slot(&mut by_location, (normalized.clone(), row.line), slot);
            if let Some(base) = path_basename(&normalized) {
                insert_slot(&mut by_basename, (base.to_string(), row.line), slot);
            }
        }

        Self {
            files,
            rows,
            by_location,
            by_basename,
        }
    }

    /// Resolve the source location implementing a module-relative address.
    ///
    /// Returns the greatest row at or before the address. Addresses at or
    /// past the end of their sequence resolve to nothing.
    pub fn address_to_line(&self, addr: GlobalAddress) -> Option<SourcePlace> {
        let addr = u64::from(addr);
        let pos = self.rows.partition_point(|row| row.address <= addr);
        if pos == 0 {
            return None;
        }
        let row = &self.rows[pos - 1];
        if row.end_sequence {
            return None;
        }
        Some(SourcePlace {
            file: self.files[row.file].clone(),
            line: row.line,
            column: row.column,
            address: GlobalAddress::from(row.address),
            is_stmt: row.is_stmt,
        })
    }

    /// Resolve a source location to the lowest module-relative address
    /// implementing it. `path` may be a full path or a bare file name.
    pub fn line_to_address(&self, path: &str, line: u64) -> Option<GlobalAddress> {
        let normalized = normalize_path(path);
        if let Some(slot) = self.by_location.get(&(normalized.clone(), line)) {
            return Some(GlobalAddress::from(slot.address));
        }
        let base = path_basename(&normalized)?;
        self.by_basename
            .get(&(base.to_string(), line))
            .map(|slot| GlobalAddress::from(slot.address))
    }

    /// All source paths referenced by this index.
    pub fn files(&self) -> impl Iterator<Item = &PathBuf> {
        self.files.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Keep the better candidate for a `(path, line)` key: a statement row wins
/// over a non-statement row, a lower address wins otherwise.
fn insert_slot(map: &mut HashMap<(String, u64), LocationSlot>, key: (String, u64), slot: LocationSlot) {
    match map.entry(key) {
        Entry::Vacant(v) => {
            v.insert(slot);
        }
        Entry::Occupied(mut o) => {
            let current = *o.get();
            let better = (slot.is_stmt && !current.is_stmt)
                || (slot.is_stmt == current.is_stmt && slot.address < current.address);
            if better {
                o.insert(slot);
            }
        }
    }
}

/// Case-insensitive, separator-insensitive form used for path comparison.
pub fn normalize_path(path: &str) -> String {
    path.replace('\\', "/").to_lowercase()
}

fn path_basename(normalized: &str) -> Option<&str> {
    normalized.rsplit('/').next().filter(|s| !s.is_empty())
}
