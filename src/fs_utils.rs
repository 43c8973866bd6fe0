//! Filesystem helpers shared by the store, key resolver and OCSP cache.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Create `path` as an empty file (or directory when `dir` is true) if nothing
/// exists there yet. Parent directories are created as needed.
pub fn create_if_missing(path: &Path, dir: bool) -> Result<()> {
    if path.exists() {
        return Ok(());
    }

    if dir {
        fs::create_dir_all(path)
            .with_context(|| format!("could not create directory {}", path.display()))?;
    } else {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("could not create directory {}", parent.display()))?;
            }
        }
        fs::File::create(path)
            .with_context(|| format!("could not create file {}", path.display()))?;
    }

    Ok(())
}

/// Write `data` to `path` via a sibling temp file and rename, so a crashed
/// export leaves either the old or the new content, not a torn file.
pub fn write_file_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp$");

    {
        let mut file = fs::File::create(&tmp)
            .with_context(|| format!("could not create {}", tmp.display()))?;
        file.write_all(data)?;
        file.sync_all()?;
    }

    fs::rename(&tmp, path).with_context(|| format!("could not replace {}", path.display()))?;
    Ok(())
}

/// Random hex file name with the given prefix and extension, e.g.
/// `SECC_LEAF_c0ffee1234.pem`. Uniqueness within a directory is checked by the
/// caller via [`unique_file_in`].
pub fn random_file_name(prefix: &str, extension: &str) -> Result<String> {
    let mut raw = [0u8; 8];
    openssl::rand::rand_bytes(&mut raw)?;
    Ok(format!("{}{}.{}", prefix, hex::encode(raw), extension))
}

/// Pick a file path inside `dir` that does not collide with an existing entry.
pub fn unique_file_in(dir: &Path, prefix: &str, extension: &str) -> Result<PathBuf> {
    loop {
        let candidate = dir.join(random_file_name(prefix, extension)?);
        if !candidate.exists() {
            return Ok(candidate);
        }
    }
}

/// Regular files of `dir` in lexicographic order. Directory iteration order is
/// filesystem-dependent; every scan in this crate goes through here so results
/// are deterministic.
pub fn sorted_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();

    for entry in
        fs::read_dir(dir).with_context(|| format!("could not read directory {}", dir.display()))?
    {
        let path = entry?.path();
        if path.is_file() {
            files.push(path);
        }
    }

    files.sort();
    Ok(files)
}
