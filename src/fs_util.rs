use std::fs;
use std::io::Write;

use camino::Utf8Path;

use crate::error::NmdcError;

/// Writes `content` next to `path` under a temporary name, then renames it
/// into place, so readers never observe a half-written file.
pub fn write_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), NmdcError> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_str().is_empty() => parent,
        _ => Utf8Path::new("."),
    };
    fs::create_dir_all(parent.as_std_path())
        .map_err(|err| NmdcError::Filesystem(format!("create {parent}: {err}")))?;

    let mut temp = tempfile::Builder::new()
        .prefix(".nmdc-export")
        .tempfile_in(parent.as_std_path())
        .map_err(|err| NmdcError::Filesystem(err.to_string()))?;
    temp.write_all(content)
        .map_err(|err| NmdcError::Filesystem(format!("write {path}: {err}")))?;
    temp.persist(path.as_std_path())
        .map_err(|err| NmdcError::Filesystem(format!("rename into {path}: {}", err.error)))?;
    Ok(())
}

pub fn read_to_string(path: &Utf8Path) -> Result<String, NmdcError> {
    fs::read_to_string(path.as_std_path())
        .map_err(|err| NmdcError::Filesystem(format!("read {path}: {err}")))
}
