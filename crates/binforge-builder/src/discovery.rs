use std::path::{Path, PathBuf};

use binforge_cache::loader::SOURCE_EXTENSION;

use crate::error::BuilderError;

/// Engine names (source file stems) in `source_dir`, sorted.
pub fn discover_units(source_dir: &Path) -> Result<Vec<String>, BuilderError> {
    if !source_dir.is_dir() {
        return Err(BuilderError::SourceDirMissing(source_dir.to_path_buf()));
    }
    let entries = std::fs::read_dir(source_dir).map_err(|e| BuilderError::io(source_dir, e))?;
    let mut units: Vec<String> = entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .filter(|path| path.extension().is_some_and(|ext| ext == SOURCE_EXTENSION))
        .filter_map(|path| path.file_stem().map(|s| s.to_string_lossy().into_owned()))
        .collect();
    units.sort();
    Ok(units)
}

/// Extensions of script duties, matched case-insensitively.
pub const SCRIPT_EXTENSIONS: &[&str] = &["py", "js"];

/// Script duties directly in `source_dir`, sorted by path.
pub fn discover_scripts(source_dir: &Path) -> Result<Vec<PathBuf>, BuilderError> {
    if !source_dir.is_dir() {
        return Err(BuilderError::SourceDirMissing(source_dir.to_path_buf()));
    }
    let entries = std::fs::read_dir(source_dir).map_err(|e| BuilderError::io(source_dir, e))?;
    let mut scripts: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && is_script(path))
        .collect();
    scripts.sort();
    Ok(scripts)
}

pub(crate) fn is_script(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| SCRIPT_EXTENSIONS.iter().any(|s| s.eq_ignore_ascii_case(ext)))
}
