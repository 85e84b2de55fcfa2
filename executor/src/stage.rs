//! Harness staging: materialize the harness binary under a shared runtime
//! directory with a content-hash filename.
//!
//! Concurrent workers race freely here: each writes to a private temp file
//! and renames into place, so every winner produces a byte-identical file
//! under the same name.

use sha2::Digest;
use sha2::Sha256;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

pub fn ensure_harness(harness_bin: &Path, runtime_dir: &Path) -> std::io::Result<PathBuf> {
    let bytes = std::fs::read(harness_bin)?;
    let digest = Sha256::digest(&bytes);
    let suffix: String = digest
        .iter()
        .take(8)
        .map(|byte| format!("{byte:02x}"))
        .collect();
    let target = runtime_dir.join(format!("judge-harness-{suffix}"));
    if target.exists() {
        return Ok(target);
    }

    std::fs::create_dir_all(runtime_dir)?;
    let mut temp = tempfile::NamedTempFile::new_in(runtime_dir)?;
    temp.write_all(&bytes)?;
    temp.flush()?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(temp.path(), std::fs::Permissions::from_mode(0o755))?;
    }
    temp.persist(&target).map_err(|err| err.error)?;
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn staging_is_idempotent_and_content_addressed() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("judge-harness");
        std::fs::write(&source, b"#!/bin/sh\nexit 0\n").unwrap();
        let runtime_dir = tmp.path().join("runtime");

        let first = ensure_harness(&source, &runtime_dir).unwrap();
        let second = ensure_harness(&source, &runtime_dir).unwrap();
        assert_eq!(first, second);
        assert_eq!(std::fs::read(&first).unwrap(), b"#!/bin/sh\nexit 0\n");

        // New content gets a new name; the old artifact stays valid.
        std::fs::write(&source, b"#!/bin/sh\nexit 1\n").unwrap();
        let third = ensure_harness(&source, &runtime_dir).unwrap();
        assert_ne!(first, third);
        assert!(first.exists());
    }

    #[cfg(unix)]
    #[test]
    fn staged_file_is_executable() {
        use std::os::unix::fs::PermissionsExt;
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("judge-harness");
        std::fs::write(&source, b"payload").unwrap();
        let staged = ensure_harness(&source, &tmp.path().join("runtime")).unwrap();
        let mode = std::fs::metadata(&staged).unwrap().permissions().mode();
        assert_eq!(mode & 0o111, 0o111);
    }
}
