use std::fs;
use std::io::{self, Write};
use std::path::Path;

use tempfile::NamedTempFile;

pub(crate) fn create_parent_dir(path: &Path) -> Result<(), String> {
    let Some(parent) = path.parent() else {
        return Ok(());
    };
    if parent.as_os_str().is_empty() {
        return Ok(());
    }
    fs::create_dir_all(parent)
        .map_err(|err| format!("Failed to create directory {}: {}", parent.display(), err))
}

pub(crate) fn read_to_string(path: &Path) -> Result<String, String> {
    fs::read_to_string(path).map_err(|err| format!("Failed to read {}: {}", path.display(), err))
}

/// Reads a file that may legitimately be absent; a missing file yields `None`.
pub(crate) fn read_optional(path: &Path) -> Result<Option<String>, String> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(Some(content)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(format!("Failed to read {}: {}", path.display(), err)),
    }
}

/// Replaces `path` with `content` through a sibling temp file, so readers
/// sharing the file (the agent, a human editor) never observe a torn write.
pub(crate) fn write_atomic(path: &Path, content: &[u8]) -> io::Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut file = NamedTempFile::new_in(dir)?;
    file.write_all(content)?;
    file.flush()?;
    file.persist(path).map_err(|err| err.error)?;
    Ok(())
}

pub(crate) fn write(path: &Path, content: &str) -> Result<(), String> {
    create_parent_dir(path)?;
    write_atomic(path, content.as_bytes())
        .map_err(|err| format!("Failed to write {}: {}", path.display(), err))
}
