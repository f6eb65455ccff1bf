use std::fs;
use std::io::ErrorKind as IoErrorKind;
use std::path::Path;

use crate::error::{Error, Result};

pub fn ensure_dir(p: &Path) -> Result<()> {
    fs::create_dir_all(p)
        .map_err(|e| Error::io(format!("failed to create dir {}: {e}", p.display())).with_source(e))
}

pub fn read_bytes(p: &Path) -> Result<Vec<u8>> {
    fs::read(p).map_err(|e| Error::io(format!("failed to read {}: {e}", p.display())).with_source(e))
}

pub fn write_bytes(p: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = p.parent() {
        ensure_dir(parent)?;
    }
    fs::write(p, data)
        .map_err(|e| Error::io(format!("failed to write {}: {e}", p.display())).with_source(e))
}

/// Write via a sibling temp file and rename, so readers never see a partial file.
pub fn atomic_write_text(path: &Path, body: &str) -> Result<()> {
    let file_name = path
        .file_name()
        .and_then(|s| s.to_str())
        .ok_or_else(|| Error::io(format!("invalid file path: {}", path.display())))?;
    let tmp = path.with_file_name(format!(
        ".{}.tmp.{}.{}",
        file_name,
        std::process::id(),
        chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
    ));
    write_bytes(&tmp, body.as_bytes())?;
    fs::rename(&tmp, path).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        Error::io(format!(
            "failed to rename {} -> {}: {e}",
            tmp.display(),
            path.display()
        ))
        .with_source(e)
    })
}

pub fn write_json_pretty(p: &Path, v: &serde_json::Value) -> Result<()> {
    let s = serde_json::to_string_pretty(v)
        .map_err(|e| Error::io(format!("json encode error: {e}")))?;
    write_bytes(p, s.as_bytes())
}

/// Remove a file, symlink or directory tree; missing paths are fine.
pub fn remove_path(p: &Path) -> Result<()> {
    let meta = match fs::symlink_metadata(p) {
        Ok(m) => m,
        Err(e) if e.kind() == IoErrorKind::NotFound => return Ok(()),
        Err(e) => {
            return Err(Error::io(format!("failed to stat {}: {e}", p.display())).with_source(e));
        }
    };
    let res = if meta.is_dir() {
        fs::remove_dir_all(p)
    } else {
        fs::remove_file(p)
    };
    res.map_err(|e| Error::io(format!("failed to remove {}: {e}", p.display())).with_source(e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atomic_write_replaces_content_without_leftovers() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let marker = tmp.path().join(".update_available");
        atomic_write_text(&marker, "").expect("first write");
        atomic_write_text(&marker, "clobber").expect("second write");
        assert_eq!(fs::read_to_string(&marker).expect("read"), "clobber");
        let entries = fs::read_dir(tmp.path()).expect("readdir").count();
        assert_eq!(entries, 1);
    }

    #[test]
    fn remove_path_handles_dirs_files_and_missing() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let dir = tmp.path().join("var_new/lib");
        ensure_dir(&dir).expect("mkdir");
        write_bytes(&dir.join("x"), b"x").expect("write");
        remove_path(&tmp.path().join("var_new")).expect("remove dir");
        remove_path(&tmp.path().join("var_new")).expect("remove missing");
        assert!(!tmp.path().join("var_new").exists());
    }
}
