//! File helpers shared by the WAL and snapshot paths. Mirrors the storage
//! engine's own `util.rs`: thin wrappers over `std::fs` that translate I/O
//! failures into the crate's own `Error`.

use std::fs;
use std::io::Write;
use std::path::Path;

use crate::error::Result;

/// Open `path` for appending, creating the file (and its parent directory)
/// if `reuse` is false. With `reuse` true, append to whatever is already
/// there — used when resuming a WAL segment across process restarts.
pub(crate) fn open_file_w(path: &Path, reuse: bool) -> Result<fs::File> {
    let mut opts = fs::OpenOptions::new();
    if reuse {
        Ok(opts.append(true).open(path)?)
    } else {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::remove_file(path).ok();
        Ok(opts.append(true).create_new(true).open(path)?)
    }
}

/// Atomically replace `path`'s contents: write to `path.tmp`, fsync, then
/// rename over the target. Used by `snapshot.rs` for `MANIFEST` and
/// snapshot-file writes, mirroring the storage engine's
/// write-to-temp-then-rename discipline in `bubt_build.rs`.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    {
        let mut fd = fs::OpenOptions::new().write(true).create(true).truncate(true).open(&tmp)?;
        fd.write_all(bytes)?;
        fd.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_atomic_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("MANIFEST");
        write_atomic(&path, b"hello").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"hello");
        write_atomic(&path, b"world!").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"world!");
    }
}
