use std::fs;

use camino::Utf8Path;
use serde::Serialize;

use crate::error::FocosError;

/// Writes pretty JSON next to `path` and renames it into place.
pub fn write_json_atomic<T: Serialize>(path: &Utf8Path, value: &T) -> Result<(), FocosError> {
    let content =
        serde_json::to_vec_pretty(value).map_err(|err| FocosError::Filesystem(err.to_string()))?;
    write_bytes_atomic(path, &content)
}

pub fn write_bytes_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), FocosError> {
    if let Some(parent) = path.parent() {
        if !parent.as_str().is_empty() {
            fs::create_dir_all(parent.as_std_path())
                .map_err(|err| FocosError::Filesystem(format!("create {parent}: {err}")))?;
        }
    }
    let tmp_path = path.with_extension("tmp");
    fs::write(tmp_path.as_std_path(), content)
        .map_err(|err| FocosError::Filesystem(format!("write {tmp_path}: {err}")))?;
    fs::rename(tmp_path.as_std_path(), path.as_std_path())
        .map_err(|err| FocosError::Filesystem(format!("rename {tmp_path}: {err}")))?;
    Ok(())
}

pub fn ensure_dir(path: &Utf8Path) -> Result<(), FocosError> {
    fs::create_dir_all(path.as_std_path())
        .map_err(|err| FocosError::Filesystem(format!("create {path}: {err}")))
}

/// Remote names may carry characters that are not valid in a local file name.
pub fn safe_file_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|ch| match ch {
            '/' | '\\' | ':' | '\0' => '_',
            other => other,
        })
        .collect();
    let trimmed = cleaned.trim().trim_start_matches('.');
    if trimmed.is_empty() {
        "unnamed".to_string()
    } else {
        trimmed.to_string()
    }
}
