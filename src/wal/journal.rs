//! One WAL segment file: append-only, rotated once it exceeds
//! `Config::journal_limit`. Naming and rotation trigger mirror the storage
//! engine's `wal_thread::Journal` (`{name}-journal-{num}.log`,
//! `exceed_limit`/`freeze`/create-next-on-rotate).

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::util;

pub struct Journal {
    pub segment: usize,
    fd: File,
    size: usize,
}

impl Journal {
    /// Create segment `segment` under `dir`, truncating any existing file
    /// of the same name (a fresh journal only ever starts after a durable
    /// snapshot has subsumed whatever came before it).
    pub fn create(dir: &Path, segment: usize) -> Result<Journal> {
        let path = Self::segment_path(dir, segment);
        let fd = util::open_file_w(&path, false)?;
        Ok(Journal { segment, fd, size: 0 })
    }

    /// Reopen segment `segment` for appending, e.g. after a restart finds
    /// a partially-written tail segment.
    pub fn reopen(dir: &Path, segment: usize) -> Result<Journal> {
        let path = Self::segment_path(dir, segment);
        let size = std::fs::metadata(&path).map(|m| m.len() as usize).unwrap_or(0);
        let fd = util::open_file_w(&path, true)?;
        Ok(Journal { segment, fd, size })
    }

    pub fn segment_path(dir: &Path, segment: usize) -> PathBuf {
        dir.join(format!("ziptag-journal-{}.log", segment))
    }

    /// Append already-framed record bytes; does not fsync (the background
    /// flusher in `wal/mod.rs` batches that).
    pub fn append(&mut self, bytes: &[u8]) -> Result<()> {
        self.fd.write_all(bytes)?;
        self.size += bytes.len();
        Ok(())
    }

    pub fn fsync(&mut self) -> Result<()> {
        self.fd.sync_data()?;
        Ok(())
    }

    pub fn exceeds(&self, limit: usize) -> bool {
        self.size >= limit
    }

    /// List existing segment numbers under `dir`, ascending.
    pub fn list_segments(dir: &Path) -> Result<Vec<usize>> {
        let mut nums = Vec::new();
        if !dir.exists() {
            return Ok(nums);
        }
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(rest) = name.strip_prefix("ziptag-journal-") {
                if let Some(num_str) = rest.strip_suffix(".log") {
                    if let Ok(num) = num_str.parse::<usize>() {
                        nums.push(num);
                    }
                }
            }
        }
        nums.sort_unstable();
        Ok(nums)
    }
}
