use crate::debugger::error::Error;
use std::fs;
use std::path::{Path, PathBuf};

/// A window of source lines around a requested line.
#[derive(Debug, Clone)]
pub struct SourceSnippet {
    pub path: PathBuf,
    /// Line number and text pairs, one based.
    pub lines: Vec<(u64, String)>,
}

/// Locates source files for display. Debug information carries the paths the
/// compiler saw, which rarely exist on the machine running the debugger, so
/// lookups fall back to searching configured directories by file name.
#[derive(Default, Clone)]
pub struct SourceResolver {
    search_dirs: Vec<PathBuf>,
}

impl SourceResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_search_dir(&mut self, dir: PathBuf) {
        if !self.search_dirs.contains(&dir) {
            self.search_dirs.push(dir);
        }
    }

    /// Find a readable file for a path from debug info or user input.
    pub fn resolve(&self, file: &str) -> Option<PathBuf> {
        let direct = Path::new(file);
        if direct.is_file() {
            return Some(direct.to_path_buf());
        }

        let basename = basename(file);
        for dir in &self.search_dirs {
            let candidate = dir.join(file);
            if candidate.is_file() {
                return Some(candidate);
            }
            let candidate = dir.join(basename);
            if candidate.is_file() {
                return Some(candidate);
            }
            // compiler paths are frequently cased differently than the
            // on-disk tree
            if let Some(found) = find_case_insensitive(dir, basename) {
                return Some(found);
            }
        }
        None
    }

    /// Read `context` lines around `line` from a resolved source file.
    pub fn snippet(&self, file: &str, line: u64, context: u64) -> Result<SourceSnippet, Error> {
        let path = self
            .resolve(file)
            .ok_or_else(|| Error::SourceNotFound(file.to_string()))?;
        let content = fs::read_to_string(&path)?;

        let first = line.saturating_sub(context).max(1);
        let last = line.saturating_add(context);
        let lines = content
            .lines()
            .enumerate()
            .map(|(idx, text)| (idx as u64 + 1, text.to_string()))
            .filter(|(number, _)| *number >= first && *number <= last)
            .collect();

        Ok(SourceSnippet { path, lines })
    }
}

fn basename(file: &str) -> &str {
    file.rsplit(['/', '\\']).next().unwrap_or(file)
}

fn find_case_insensitive(dir: &Path, name: &str) -> Option<PathBuf> {
    let entries = fs::read_dir(dir).ok()?;
    for entry in entries.flatten() {
        let file_name = entry.file_name();
        if file_name.to_string_lossy().eq_ignore_ascii_case(name) {
            let path = entry.path();
            if path.is_file() {
                return Some(path);
            }
        }
    }
    None
}
