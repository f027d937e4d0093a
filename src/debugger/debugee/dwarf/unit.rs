use crate::debugger::debugee::dwarf::EndianArcSlice;
use gimli::{FileEntry, LineProgramHeader, Reader, UnitHeader};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::num::NonZeroU64;
use std::path::PathBuf;

const IS_STMT: u8 = 1 << 0;
const END_SEQUENCE: u8 = 1 << 1;

/// A row in the line number program's resulting matrix.
/// Addresses are module-relative, `file` indexes [`Unit::files`].
#[derive(PartialEq, Debug, Clone)]
pub struct LineRow {
    pub address: u64,
    pub file: usize,
    pub line: u64,
    pub column: u64,
    flags: u8,
}

impl LineRow {
    #[cfg(test)]
    pub(crate) fn new(
        address: u64,
        file: usize,
        line: u64,
        column: u64,
        is_stmt: bool,
        end_sequence: bool,
    ) -> Self {
        let mut flags = 0u8;
        if is_stmt {
            flags |= IS_STMT;
        }
        if end_sequence {
            flags |= END_SEQUENCE;
        }
        LineRow {
            address,
            file,
            line,
            column,
            flags,
        }
    }

    #[inline(always)]
    pub fn is_stmt(&self) -> bool {
        self.flags & IS_STMT == IS_STMT
    }

    #[inline(always)]
    pub fn end_sequence(&self) -> bool {
        self.flags & END_SEQUENCE == END_SEQUENCE
    }
}

/// Line number information of a single compilation unit.
pub struct Unit {
    pub name: Option<String>,
    pub comp_dir: Option<String>,
    /// Source paths referenced by [`Self::lines`], resolved and absolutized.
    pub files: Vec<PathBuf>,
    /// Line rows ordered by address.
    pub lines: Vec<LineRow>,
}

pub struct DwarfUnitParser<'a> {
    dwarf: &'a gimli::Dwarf<EndianArcSlice>,
}

impl<'a> DwarfUnitParser<'a> {
    pub fn new(dwarf: &'a gimli::Dwarf<EndianArcSlice>) -> Self {
        Self { dwarf }
    }

    pub fn parse(&self, header: UnitHeader<EndianArcSlice>) -> gimli::Result<Unit> {
        let unit = self.dwarf.unit(header)?;

        let name = unit
            .name
            .as_ref()
            .and_then(|n| n.to_string_lossy().ok().map(|s| s.to_string()));
        let comp_dir = unit
            .comp_dir
            .as_ref()
            .and_then(|d| d.to_string_lossy().ok().map(|s| s.to_string()));

        let mut files: Vec<PathBuf> = vec![];
        let mut lines: Vec<LineRow> = vec![];

        if let Some(ref lp) = unit.line_program {
            // Some producers populate the file table while the state machine
            // runs (DW_LNE_define_file), so an up-front snapshot of the table
            // may be empty. File names are resolved per row, against the
            // table as it stands at that row, and cached per file index for
            // the lifetime of this unit.
            let mut resolved: HashMap<u64, usize> = HashMap::new();
            let mut rows = lp.clone().rows();
            while let Some((header, row)) = rows.next_row()? {
                let file_index = row.file_index();
                let file = match resolved.entry(file_index) {
                    Entry::Occupied(o) => *o.get(),
                    Entry::Vacant(v) => {
                        let path = resolve_file(self.dwarf, &unit, header, file_index);
                        files.push(path);
                        *v.insert(files.len() - 1)
                    }
                };

                let column = match row.column() {
                    gimli::ColumnType::LeftEdge => 0,
                    gimli::ColumnType::Column(x) => x.get(),
                };

                let mut flags = 0u8;
                if row.is_stmt() {
                    flags |= IS_STMT;
                }
                if row.end_sequence() {
                    flags |= END_SEQUENCE;
                }

                lines.push(LineRow {
                    address: row.address(),
                    file,
                    line: row.line().map(NonZeroU64::get).unwrap_or(0),
                    column,
                    flags,
                });
            }
        }
        lines.sort_by_key(|x| x.address);

        Ok(Unit {
            name,
            comp_dir,
            files,
            lines,
        })
    }
}

/// Resolve the source path for a `file` register value using the file table
/// in its current state. An absent entry falls back to the unit name, the
/// only place a Watcom line program reliably records its source file.
fn resolve_file(
    dwarf: &gimli::Dwarf<EndianArcSlice>,
    unit: &gimli::Unit<EndianArcSlice>,
    header: &LineProgramHeader<EndianArcSlice>,
    file_index: u64,
) -> PathBuf {
    match header.file(file_index) {
        Some(entry) => render_file_path(unit, entry, header, dwarf)
            .unwrap_or_else(|_| unit_name_path(unit)),
        None => unit_name_path(unit),
    }
}

fn render_file_path<R: Reader>(
    dw_unit: &gimli::Unit<R>,
    file: &FileEntry<R, R::Offset>,
    header: &LineProgramHeader<R, R::Offset>,
    sections: &gimli::Dwarf<R>,
) -> Result<PathBuf, gimli::Error> {
    let mut path = if let Some(ref comp_dir) = dw_unit.comp_dir {
        PathBuf::from(comp_dir.to_string_lossy()?.as_ref())
    } else {
        PathBuf::new()
    };

    if file.directory_index() != 0 {
        if let Some(directory) = file.directory(header) {
            push_path_part(
                &mut path,
                sections
                    .attr_string(dw_unit, directory)?
                    .to_string_lossy()?
                    .as_ref(),
            );
        }
    }

    push_path_part(
        &mut path,
        sections
            .attr_string(dw_unit, file.path_name())?
            .to_string_lossy()?
            .as_ref(),
    );

    Ok(path)
}

/// Absolutize the unit name against the compilation directory.
fn unit_name_path<R: Reader>(unit: &gimli::Unit<R>) -> PathBuf {
    let name = unit
        .name
        .as_ref()
        .and_then(|n| n.to_string_lossy().ok().map(|s| s.to_string()))
        .unwrap_or_else(|| "unknown".to_string());

    let mut path = match unit.comp_dir {
        Some(ref dir) => match dir.to_string_lossy() {
            Ok(dir) => PathBuf::from(dir.as_ref()),
            Err(_) => PathBuf::new(),
        },
        None => PathBuf::new(),
    };
    push_path_part(&mut path, &name);
    path
}

/// Join a path component, replacing the base when the component is already
/// absolute. `PathBuf::push` alone does not treat DOS drive paths as absolute
/// on non-Windows hosts.
fn push_path_part(base: &mut PathBuf, part: &str) {
    if is_absolute_path(part) {
        *base = PathBuf::from(part);
    } else {
        base.push(part);
    }
}

fn is_absolute_path(s: &str) -> bool {
    let bytes = s.as_bytes();
    s.starts_with('/')
        || s.starts_with('\\')
        || (bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absolute_path_detection() {
        assert!(is_absolute_path("C:\\proj\\simple.c"));
        assert!(is_absolute_path("d:src\\a.c"));
        assert!(is_absolute_path("/usr/src/a.c"));
        assert!(is_absolute_path("\\\\share\\a.c"));
        assert!(!is_absolute_path("simple.c"));
        assert!(!is_absolute_path("src\\simple.c"));
    }

    #[test]
    fn test_path_part_join() {
        let mut p = PathBuf::from("C:\\proj");
        push_path_part(&mut p, "simple.c");
        assert!(p.to_string_lossy().ends_with("simple.c"));

        let mut p = PathBuf::from("C:\\proj");
        push_path_part(&mut p, "D:\\other\\dll.c");
        assert_eq!(p, PathBuf::from("D:\\other\\dll.c"));
    }
}
